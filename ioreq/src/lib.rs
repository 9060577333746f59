// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The I/O-request channel (C7): the 16-slot shared page protocol that
//! delegates unhandled port-I/O, MMIO, and PCI-configuration accesses to
//! the Service VM's user-space device model, plus the optional
//! asynchronous fast path and its notification ring.

mod asyncio;
mod channel;
mod error;
mod ring;
mod slot;
mod wire;

pub use asyncio::AsyncIoDescriptor;
pub use asyncio::AsyncIoKind;
pub use asyncio::AsyncIoRegistry;
pub use channel::HsmUpcall;
pub use channel::IoReqChannel;
pub use error::Error;
pub use error::Result;
pub use ring::AsyncIoCompletion;
pub use ring::AsyncIoRing;
pub use slot::Direction;
pub use slot::MmioRequest;
pub use slot::PciCfgRequest;
pub use slot::PioRequest;
pub use slot::RequestBody;
pub use slot::SlotState;
pub use slot::WpRequest;
pub use wire::WireSlot;
pub use wire::ASYNCIO_RING_MAGIC;
pub use wire::NUM_SLOTS;
pub use wire::PAGE_SIZE;
pub use wire::SLOT_SIZE;
