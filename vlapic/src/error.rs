// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("register offset {0:#x} is not a valid xAPIC register")]
    InvalidRegister(u32),

    #[error("x2APIC MSR {0:#x} is not valid in the current mode")]
    InvalidX2apicMsr(u32),

    #[error("write of {1:#x} to register {0:#x} is not permitted")]
    InvalidWrite(u32, u32),

    #[error("vcpu index {0} is out of range for this vlapic complex")]
    NoSuchVcpu(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for base::Error {
    fn from(err: Error) -> Self {
        match &err {
            Error::NoSuchVcpu(_) => base::Error::invalid_argument(err.to_string()),
            Error::InvalidRegister(_) | Error::InvalidX2apicMsr(_) | Error::InvalidWrite(_, _) => {
                base::Error::guest_fault(err.to_string())
            }
        }
    }
}
