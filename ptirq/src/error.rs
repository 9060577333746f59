// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("physical source is already owned by another VM")]
    Conflict,

    #[error("no free ptirq entry")]
    TableFull,

    #[error("no ptirq entry matches this request")]
    NoSuchEntry,

    #[error("virtual pin {0} is out of range")]
    BadVirtPin(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for base::Error {
    fn from(err: Error) -> Self {
        match &err {
            Error::Conflict => base::Error::conflict(err.to_string()),
            Error::TableFull => base::Error::unsupported(err.to_string()),
            Error::NoSuchEntry | Error::BadVirtPin(_) => base::Error::not_found(err.to_string()),
        }
    }
}
