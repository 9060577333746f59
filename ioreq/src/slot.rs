// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One I/O-request slot's request payload and processed-state machine
//! (spec.md §3, §4.7). [`SlotState`] carries the exact numeric codes
//! spec.md's table gives (`Pending=0`, `Complete=1`, `Processing=2`,
//! `Free=3`) since those values, not just their names, are part of the
//! wire contract a Service VM reading this page decodes against.

use enumn::N;

#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum SlotState {
    Pending = 0,
    Complete = 1,
    Processing = 2,
    Free = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PioRequest {
    pub address: u16,
    pub direction: Direction,
    pub size: u8,
    pub value: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioRequest {
    pub address: u64,
    pub direction: Direction,
    pub size: u8,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciCfgRequest {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub register: u16,
    pub direction: Direction,
    pub size: u8,
    pub value: u32,
}

/// `REQ_WP`: a write-protect-page trap, spec.md §9's open question —
/// treated as its own request type (reachable, but nothing in this crate
/// currently classifies a raw exit qualification into it; see
/// `DESIGN.md`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WpRequest {
    pub address: u64,
}

/// One request's payload, tagged by spec.md §3's four request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestBody {
    Pio(PioRequest),
    Mmio(MmioRequest),
    PciCfg(PciCfgRequest),
    Wp(WpRequest),
}

impl RequestBody {
    pub fn direction(&self) -> Option<Direction> {
        match self {
            RequestBody::Pio(r) => Some(r.direction),
            RequestBody::Mmio(r) => Some(r.direction),
            RequestBody::PciCfg(r) => Some(r.direction),
            RequestBody::Wp(_) => None,
        }
    }
}
