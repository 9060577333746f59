// Copyright 2021 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The error type shared across every crate in this workspace: a thin
//! enum over the six kinds a caller can actually act on, each carrying a
//! short context string rather than a per-failure payload.
//!
//! `GuestFault` and `Unsupported` are never meant to reach a caller outside
//! the vCPU run-loop — C2's exit dispatch converts both into exception
//! injection before they can propagate further. `Fatal` means exactly
//! that: the run-loop asserts and aborts the owning pCPU rather than
//! trying to recover.
//!
//! Subsystem crates (`vmx`, `vlapic`, `irqchip`, `vtd`, `ptirq`, `ioreq`,
//! `vuart`) each own a local `Error`/`Result` for their own internal
//! failure modes, with a `From<LocalError> for base::Error` impl when they
//! need to hand a failure up to a caller in another crate — the same
//! pattern the donor workspace uses between its own per-crate errors and
//! any shared error surface.

use thiserror::Error;

/// The crate-spanning error type. Construct with the associated functions
/// below rather than the variants directly; they exist to keep call sites
/// from having to decide between `&str` and `String`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("guest fault: {0}")]
    GuestFault(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn guest_fault(msg: impl Into<String>) -> Self {
        Error::GuestFault(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    /// True for the two kinds that must be converted into guest exception
    /// injection rather than propagated as a hypervisor-level failure.
    pub fn is_guest_visible(&self) -> bool {
        matches!(self, Error::GuestFault(_) | Error::Unsupported(_))
    }

    /// True for the one kind that means the owning pCPU must not continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
