// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The interrupt-remapping table: a per-unit, fixed-size IRTE array keyed
//! by index, the form spec.md §4.6 and §4.5 describe (`dmar_assign_irte`
//! returns the index C5 programs into the guest-facing MSI/IOAPIC entry's
//! Remappable-Format handle bits). No original-source file covers IR
//! register layout in this corpus, so the exact reserved-bit placement
//! below is this crate's own choice, not lifted from a source file; the
//! fields that matter for emulation (vector, destination, delivery/dest
//! mode, source-id, presence) are SDM-accurate.

use bit_field::bitfield;

use crate::error::Error;
use crate::error::Result;

pub const IRTE_TABLE_SIZE: usize = 4096;

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestMode {
    Physical = 0,
    Logical = 1,
}

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Fixed = 0b000,
    LowestPriority = 0b001,
}

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Edge = 0,
    Level = 1,
}

/// Source-id validation type: bus, bus range, or don't-care. Only `None`
/// is emulated meaningfully here; the others are accepted and stored but
/// not enforced, since this crate has no separate "requester" path to
/// validate against.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceValidationType {
    None = 0b00,
    RequesterId = 0b01,
    BusRange = 0b10,
}

#[bitfield]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Irte {
    pub vector: bit_field::BitField8,
    #[bits = 3]
    pub delivery_mode: DeliveryMode,
    #[bits = 1]
    pub dest_mode: DestMode,
    #[bits = 1]
    pub trigger_mode: TriggerMode,
    pub present: bool,
    pub fault_disable: bool,
    pub redirection_hint: bool,
    reserved: bit_field::BitField16,
    pub destination_id: bit_field::BitField32,
    pub source_id: bit_field::BitField16,
    #[bits = 2]
    pub source_validation_type: SourceValidationType,
    reserved2: bit_field::BitField44,
}

/// One DMAR unit's interrupt-remapping table.
pub struct IrteTable {
    entries: Vec<Irte>,
    free_slots: std::collections::VecDeque<u16>,
}

impl IrteTable {
    pub fn new() -> Self {
        IrteTable {
            entries: vec![Irte::default(); IRTE_TABLE_SIZE],
            free_slots: (0..IRTE_TABLE_SIZE as u16).collect(),
        }
    }

    pub fn entry(&self, index: u16) -> Result<Irte> {
        self.entries
            .get(index as usize)
            .copied()
            .ok_or(Error::NoSuchIrte(index))
    }

    /// `dmar_assign_irte`: allocates the next free slot and programs it,
    /// returning the index C5 encodes into the Remappable-Format MSI
    /// address it hands back to the guest.
    #[allow(clippy::too_many_arguments)]
    pub fn assign(
        &mut self,
        vector: u8,
        delivery_mode: DeliveryMode,
        dest_mode: DestMode,
        trigger_mode: TriggerMode,
        destination_id: u32,
        source_id: u16,
    ) -> Result<u16> {
        let index = self.free_slots.pop_front().ok_or(Error::IrteTableFull)?;
        let mut irte = Irte::new();
        irte.set_vector(vector);
        irte.set_delivery_mode(delivery_mode);
        irte.set_dest_mode(dest_mode);
        irte.set_trigger_mode(trigger_mode);
        irte.set_destination_id(destination_id);
        irte.set_source_id(source_id);
        irte.set_source_validation_type(SourceValidationType::None);
        irte.set_present(true);
        self.entries[index as usize] = irte;
        Ok(index)
    }

    pub fn free(&mut self, index: u16) -> Result<()> {
        let entry = self.entries.get_mut(index as usize).ok_or(Error::NoSuchIrte(index))?;
        *entry = Irte::default();
        self.free_slots.push_back(index);
        Ok(())
    }
}

impl Default for IrteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_and_free_round_trips_a_slot() {
        let mut table = IrteTable::new();
        let index = table.assign(0x30, DeliveryMode::Fixed, DestMode::Physical, TriggerMode::Edge, 2, 0x0100).unwrap();
        let irte = table.entry(index).unwrap();
        assert!(irte.get_present());
        assert_eq!(irte.get_vector(), 0x30);
        assert_eq!(irte.get_destination_id(), 2);

        table.free(index).unwrap();
        assert!(!table.entry(index).unwrap().get_present());
    }

    #[test]
    fn table_reports_full_once_every_slot_is_assigned() {
        let mut table = IrteTable::new();
        for _ in 0..IRTE_TABLE_SIZE {
            table.assign(0, DeliveryMode::Fixed, DestMode::Physical, TriggerMode::Edge, 0, 0).unwrap();
        }
        assert_eq!(
            table.assign(0, DeliveryMode::Fixed, DestMode::Physical, TriggerMode::Edge, 0, 0),
            Err(Error::IrteTableFull)
        );
    }
}
