// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The literal byte layout of the shared I/O-request page (SPEC_FULL §2):
//! 16 slots of 256 bytes each, one page total. Kept as its own module,
//! separate from the ergonomic [`crate::slot`] types the rest of this
//! crate operates on, because its only job is pinning down offsets that
//! must match whatever reads this page from outside this crate —
//! `req_type` at byte 0, `completion_polling` at byte 4, the per-type
//! request union at byte 64, `processed` at byte 136, 256 bytes total.

use data_model::assert_size_eq;
use data_model::offset_of;

pub const SLOT_SIZE: usize = 256;
pub const NUM_SLOTS: usize = 16;
pub const PAGE_SIZE: usize = SLOT_SIZE * NUM_SLOTS;
pub const ASYNCIO_RING_MAGIC: u64 = 0x5aa5_7aa7_1aa1_3aa3;

/// The raw wire layout of one slot. Field access goes through
/// [`crate::slot::RequestSlot`]; this struct exists to assert sizes and
/// offsets against the page layout, not to be manipulated directly.
#[repr(C)]
pub struct WireSlot {
    pub req_type: u32,
    pub completion_polling: u32,
    reserved_head: [u32; 14],
    pub body: [u8; 72],
    pub processed: u32,
    reserved_tail: [u8; 116],
}

assert_size_eq!(WireSlot, SLOT_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_match_the_wire_contract() {
        assert_eq!(offset_of!(WireSlot, req_type), 0);
        assert_eq!(offset_of!(WireSlot, completion_polling), 4);
        assert_eq!(offset_of!(WireSlot, body), 64);
        assert_eq!(offset_of!(WireSlot, processed), 136);
    }

    #[test]
    fn the_page_holds_exactly_sixteen_slots() {
        assert_eq!(PAGE_SIZE, 4096);
    }
}
