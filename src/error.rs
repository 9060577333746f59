// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no such vm {0}")]
    NoSuchVm(u32),

    #[error("vm {0} already exists")]
    VmAlreadyExists(u32),

    #[error("vcpu {0} is out of range (created_vcpus = {1})")]
    VcpuOutOfRange(usize, usize),

    #[error("vm {0} requested {1} vcpus, exceeding MAX_VCPUS_PER_VM = {2}")]
    TooManyVcpus(u32, usize, usize),

    #[error("vm {0} has no pcpu in its affinity mask")]
    EmptyAffinity(u32),

    #[error("port {1:#x} is outside vuart {0}'s register window")]
    NoSuchVuartPort(usize, u16),

    #[error("illegal lifecycle transition for vm {0}: {1:?} -> {2:?}")]
    IllegalTransition(u32, crate::vm::VmState, crate::vm::VmState),

    #[error(transparent)]
    Vmx(#[from] vmx::Error),

    #[error(transparent)]
    Vlapic(#[from] vlapic::Error),

    #[error(transparent)]
    Irqchip(#[from] irqchip::Error),

    #[error(transparent)]
    Vtd(#[from] vtd::Error),

    #[error(transparent)]
    Ptirq(#[from] ptirq::Error),

    #[error(transparent)]
    Ioreq(#[from] ioreq::Error),

    #[error(transparent)]
    Vuart(#[from] vuart::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for base::Error {
    fn from(err: Error) -> Self {
        match &err {
            Error::IllegalTransition(..) => base::Error::conflict(err.to_string()),
            Error::NoSuchVm(_) => base::Error::not_found(err.to_string()),
            Error::VmAlreadyExists(_) => base::Error::conflict(err.to_string()),
            Error::VcpuOutOfRange(..) | Error::TooManyVcpus(..) | Error::EmptyAffinity(_) => {
                base::Error::invalid_argument(err.to_string())
            }
            _ => base::Error::invalid_argument(err.to_string()),
        }
    }
}
