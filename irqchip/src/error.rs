// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("vIOAPIC MMIO access at offset {0:#x} must be 4 bytes, was {1}")]
    BadAccessSize(u64, usize),

    #[error("pin {0} is out of range for this vIOAPIC ({1} pins)")]
    NoSuchPin(u32, usize),

    #[error("RTE index {0} has no corresponding redirection table entry")]
    NoSuchRte(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for base::Error {
    fn from(err: Error) -> Self {
        match &err {
            Error::BadAccessSize(_, _) => base::Error::invalid_argument(err.to_string()),
            Error::NoSuchPin(_, _) | Error::NoSuchRte(_) => base::Error::not_found(err.to_string()),
        }
    }
}
