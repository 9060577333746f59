// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

use crate::field::VmcsField;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("VMfailInvalid executing {0}: no current VMCS")]
    FailInvalid(&'static str),

    #[error("VMfailValid executing {0}: VM-instruction error {1}")]
    FailValid(&'static str, u32),

    #[error("no VMCS is loaded on this pCPU")]
    NoCurrentVmcs,

    #[error("VM-entry failed, exit reason {0:#x}")]
    EntryFailure(u32),

    #[error("field {0:?} is not valid in this VMCS revision")]
    UnsupportedField(VmcsField),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for base::Error {
    fn from(err: Error) -> Self {
        match &err {
            Error::EntryFailure(_) | Error::FailInvalid(_) | Error::FailValid(_, _) => {
                base::Error::fatal(err.to_string())
            }
            Error::NoCurrentVmcs | Error::UnsupportedField(_) | Error::Other(_) => {
                base::Error::invalid_argument(err.to_string())
            }
        }
    }
}
