// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no DMAR unit owns bus {0:#x}")]
    NoDmarUnit(u8),

    #[error("no DMAR unit supports address width {0}")]
    AddressWidthUnsupported(u32),

    #[error("all domain ids are in use")]
    DomainIdsExhausted,

    #[error("context entry for {0:#x}:{1:#x} is already present")]
    ContextAlreadyPresent(u8, u8),

    #[error("context entry for {0:#x}:{1:#x} belongs to a different domain")]
    DomainMismatch(u8, u8),

    #[error("the interrupt remapping table is full")]
    IrteTableFull,

    #[error("IRTE index {0} is out of range")]
    NoSuchIrte(u16),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for base::Error {
    fn from(err: Error) -> Self {
        match &err {
            Error::NoDmarUnit(_) => base::Error::not_found(err.to_string()),
            Error::AddressWidthUnsupported(_) => base::Error::unsupported(err.to_string()),
            Error::DomainIdsExhausted | Error::IrteTableFull => base::Error::fatal(err.to_string()),
            Error::ContextAlreadyPresent(_, _) | Error::DomainMismatch(_, _) => {
                base::Error::conflict(err.to_string())
            }
            Error::NoSuchIrte(_) => base::Error::invalid_argument(err.to_string()),
        }
    }
}
