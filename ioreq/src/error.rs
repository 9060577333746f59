// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("vcpu {0} has no io-request slot (only {1} slots exist)")]
    NoSuchSlot(usize, usize),

    #[error("vcpu {0}'s io-request slot is not Free (acrn_insert_request requires Free)")]
    SlotNotFree(usize),

    #[error("async-io descriptor already registered for this key")]
    DuplicateAsyncIo,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for base::Error {
    fn from(err: Error) -> Self {
        match &err {
            Error::NoSuchSlot(_, _) => base::Error::invalid_argument(err.to_string()),
            Error::SlotNotFree(_) => base::Error::fatal(err.to_string()),
            Error::DuplicateAsyncIo => base::Error::conflict(err.to_string()),
        }
    }
}
