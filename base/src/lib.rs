// Copyright 2021 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ambient utilities shared by every crate in this workspace: the `log`
//! facade re-export, the crate-spanning `Error`/`Result`, and the `Event`
//! wait/notify primitive used for vCPU suspension and I/O-request
//! completion. Mirrors the donor workspace's `base` crate's role as the
//! one dependency every other crate pulls in for these three things,
//! minus everything in the donor's version that assumed a host OS
//! underneath (see `DESIGN.md`).

mod error;
mod event;
mod log;

pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::event::Event;
pub use crate::log::init_logging;
pub use crate::log::LogSink;
pub use crate::log::NullSink;
pub use ::log::*;
