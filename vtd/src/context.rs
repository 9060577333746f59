// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Root and context tables: owning collections standing in for the
//! original's raw `uint64_t[512]` tables walked with shifts and masks.
//! One [`ContextTable`] per bus, allocated lazily the first time a device
//! on that bus is assigned; 256 `devfun` slots each, matching the
//! architectural `(bus, devfun)` addressing VT-d context entries use.

use std::collections::HashMap;

use bit_field::bitfield;

use crate::domain::IommuDomain;
use crate::error::Error;
use crate::error::Result;
use crate::regs::width_to_agaw;

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationType {
    Untranslated = 0b00,
    AllLevels = 0b01,
    Passthrough = 0b10,
}

/// One context entry, SDM-compatible bit layout (`lower`/`upper` match
/// `struct dmar_context_entry`'s two-qword shape exactly).
#[bitfield]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextEntryLower {
    pub present: bool,
    pub fault_processing_disable: bool,
    #[bits = 2]
    pub translation_type: TranslationType,
    reserved: bit_field::BitField8,
    pub second_level_ptr: bit_field::BitField52,
}

#[bitfield]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextEntryUpper {
    pub address_width: bit_field::BitField3,
    reserved: bit_field::BitField5,
    pub domain_id: bit_field::BitField6,
    reserved2: bit_field::BitField50,
}

#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextEntry {
    pub lower: ContextEntryLower,
    pub upper: ContextEntryUpper,
}

impl ContextEntry {
    fn is_present(&self) -> bool {
        self.lower.get_present()
    }
}

pub struct ContextTable {
    entries: Vec<ContextEntry>,
}

impl ContextTable {
    fn new() -> Self {
        ContextTable {
            entries: vec![ContextEntry::default(); 256],
        }
    }
}

/// One DMAR unit's root table: which buses have a context table, and what
/// it holds. `msagaw` is threaded in from [`crate::regs::cap_msagaw`] so
/// passthrough context entries can program the hardware-maximum AGAW
/// spec.md §4.6 requires when `ECAP.PT` is set.
#[derive(Default)]
pub struct RootTable {
    context_tables: HashMap<u8, ContextTable>,
}

impl RootTable {
    pub fn new() -> Self {
        RootTable::default()
    }

    fn table_mut(&mut self, bus: u8) -> &mut ContextTable {
        self.context_tables.entry(bus).or_insert_with(ContextTable::new)
    }

    /// `add_iommu_device`: programs a fresh present context entry for
    /// `(bus, devfun)`. Fails if one is already present (the original
    /// treats that as a caller bug, surfaced here as `Conflict`).
    pub fn add_device(
        &mut self,
        bus: u8,
        devfun: u8,
        domain: &IommuDomain,
        ecap_pt: bool,
        msagaw: u8,
    ) -> Result<()> {
        let table = self.table_mut(bus);
        let entry = &mut table.entries[devfun as usize];
        if entry.is_present() {
            return Err(Error::ContextAlreadyPresent(bus, devfun));
        }

        let mut lower = ContextEntryLower::new();
        let mut upper = ContextEntryUpper::new();

        if domain.is_host && ecap_pt {
            upper.set_address_width(msagaw);
            lower.set_translation_type(TranslationType::Passthrough);
        } else {
            upper.set_address_width(width_to_agaw(domain.addr_width));
            lower.set_translation_type(TranslationType::Untranslated);
        }
        upper.set_domain_id(domain.dom_id as u8);
        lower.set_second_level_ptr(domain.trans_table_phys >> 12);
        lower.set_present(true);

        *entry = ContextEntry { lower, upper };
        Ok(())
    }

    /// `remove_iommu_device`: clears the entry, verifying it belongs to
    /// `domain` first (a mismatch means the caller is removing someone
    /// else's assignment, a programming error this surfaces rather than
    /// silently tearing down).
    pub fn remove_device(&mut self, bus: u8, devfun: u8, domain: &IommuDomain) -> Result<()> {
        let table = self.table_mut(bus);
        let entry = &mut table.entries[devfun as usize];
        if entry.upper.get_domain_id() as u16 != domain.dom_id {
            return Err(Error::DomainMismatch(bus, devfun));
        }
        *entry = ContextEntry::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_domain() -> IommuDomain {
        IommuDomain {
            dom_id: 0,
            vm_id: -1,
            is_host: true,
            addr_width: 48,
            trans_table_phys: 0x1000_0000,
        }
    }

    fn guest_domain(id: u16) -> IommuDomain {
        IommuDomain {
            dom_id: id,
            vm_id: 1,
            is_host: false,
            addr_width: 48,
            trans_table_phys: 0x2000_0000,
        }
    }

    #[test]
    fn host_device_with_pt_capability_uses_passthrough() {
        let mut root = RootTable::new();
        let domain = host_domain();
        root.add_device(0, 0x18, &domain, true, 4).unwrap();
        let table = root.table_mut(0);
        let entry = table.entries[0x18];
        assert_eq!(entry.lower.get_translation_type(), TranslationType::Passthrough);
        assert_eq!(entry.upper.get_address_width(), 4);
    }

    #[test]
    fn guest_device_uses_untranslated_with_ept_pointer() {
        let mut root = RootTable::new();
        let domain = guest_domain(3);
        root.add_device(0, 0x10, &domain, true, 4).unwrap();
        let entry = root.table_mut(0).entries[0x10];
        assert_eq!(entry.lower.get_translation_type(), TranslationType::Untranslated);
        assert_eq!(entry.lower.get_second_level_ptr(), domain.trans_table_phys >> 12);
        assert_eq!(entry.upper.get_domain_id(), 3);
    }

    #[test]
    fn double_assignment_is_rejected() {
        let mut root = RootTable::new();
        let domain = guest_domain(1);
        root.add_device(0, 0, &domain, false, 4).unwrap();
        assert_eq!(
            root.add_device(0, 0, &domain, false, 4),
            Err(Error::ContextAlreadyPresent(0, 0))
        );
    }

    #[test]
    fn remove_rejects_domain_mismatch() {
        let mut root = RootTable::new();
        let domain = guest_domain(1);
        root.add_device(0, 0, &domain, false, 4).unwrap();
        let other = guest_domain(2);
        assert_eq!(root.remove_device(0, 0, &other), Err(Error::DomainMismatch(0, 0)));
    }
}
