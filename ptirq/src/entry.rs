// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The passthrough remapping table: a fixed-capacity array of entries
//! keyed by a generational id, following the newer `is_entry_invalid`
//! table approach rather than the older calloc+linked-list one (an
//! explicit choice recorded for this crate, since both exist in the
//! corpus this was learned from and they disagree on re-add semantics).

use crate::error::Error;
use crate::error::Result;
use crate::msi::MsiInfo;

/// How many simultaneously-mapped passthrough sources this table can
/// hold. Large enough for every legacy pin (16) plus a generous number of
/// MSI-X vectors across a handful of assigned devices.
pub const MAX_PT_IRQ_ENTRIES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrType {
    Intx,
    Msi,
}

/// Which virtual interrupt controller owns a legacy pin right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpinSrc {
    Pic,
    Ioapic,
}

/// The physical resource an entry claims: exactly one IOAPIC pin, or one
/// (bdf, MSI-X entry index) pair. Lookup-by-phys-sid uses this to enforce
/// the at-most-one-active-entry-per-physical-source invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysSid {
    Intx { phys_pin: u32 },
    Msi { phys_bdf: u16, entry_nr: u16 },
}

/// The virtual identity a guest uses to address the same mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtSid {
    Intx { virt_pin: u32, src: VpinSrc },
    Msi { virt_bdf: u16, entry_nr: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtirqEntryId(pub usize);

/// One physical-to-virtual interrupt mapping. `vm_id` identifies the
/// owning VM (the Service VM's id is distinguished by [`PtirqEntry::is_service_vm_owned`]'s
/// caller, which knows which id that is); this crate itself is VM-identity
/// agnostic beyond comparing ids for ownership.
#[derive(Debug, Clone)]
pub struct PtirqEntry {
    pub vm_id: u32,
    pub intr_type: IntrType,
    pub phys_sid: PhysSid,
    pub virt_sid: VirtSid,
    pub allocated_pirq: u32,
    pub vector: u8,
    pub polarity: bool,
    pub active: bool,
    pub irte_index: Option<u16>,
    pub msi: MsiInfo,
}

impl PtirqEntry {
    fn new(vm_id: u32, intr_type: IntrType, phys_sid: PhysSid, virt_sid: VirtSid) -> Self {
        PtirqEntry {
            vm_id,
            intr_type,
            phys_sid,
            virt_sid,
            allocated_pirq: 0,
            vector: 0,
            polarity: false,
            active: false,
            irte_index: None,
            msi: MsiInfo::default(),
        }
    }
}

/// The fixed-size table plus its free list. One instance per hypervisor
/// (`ptirq_entries[CONFIG_MAX_PT_IRQ_ENTRIES]` in the donor).
pub struct PtirqTable {
    slots: Vec<Option<PtirqEntry>>,
    free: Vec<usize>,
}

impl PtirqTable {
    pub fn new() -> Self {
        PtirqTable {
            slots: (0..MAX_PT_IRQ_ENTRIES).map(|_| None).collect(),
            free: (0..MAX_PT_IRQ_ENTRIES).rev().collect(),
        }
    }

    pub fn get(&self, id: PtirqEntryId) -> Option<&PtirqEntry> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: PtirqEntryId) -> Option<&mut PtirqEntry> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    /// `ptirq_lookup_entry_by_sid` with `vm == NULL`: finds whichever
    /// active entry (of the given interrupt type) currently claims this
    /// physical source, owner VM aside.
    pub fn lookup_by_phys_sid(&self, intr_type: IntrType, sid: PhysSid) -> Option<PtirqEntryId> {
        self.slots.iter().enumerate().find_map(|(idx, slot)| {
            let entry = slot.as_ref()?;
            (entry.intr_type == intr_type && entry.phys_sid == sid).then_some(PtirqEntryId(idx))
        })
    }

    /// `ptirq_lookup_entry_by_sid` with an explicit `vm`: finds the entry
    /// a specific VM owns for a virtual source id.
    pub fn lookup_by_virt_sid(&self, vm_id: u32, intr_type: IntrType, sid: VirtSid) -> Option<PtirqEntryId> {
        self.slots.iter().enumerate().find_map(|(idx, slot)| {
            let entry = slot.as_ref()?;
            (entry.vm_id == vm_id && entry.intr_type == intr_type && entry.virt_sid == sid).then_some(PtirqEntryId(idx))
        })
    }

    /// `ptirq_alloc_entry`: claims a free slot for a brand-new mapping.
    pub fn alloc(&mut self, vm_id: u32, intr_type: IntrType, phys_sid: PhysSid, virt_sid: VirtSid) -> Result<PtirqEntryId> {
        let idx = self.free.pop().ok_or(Error::TableFull)?;
        self.slots[idx] = Some(PtirqEntry::new(vm_id, intr_type, phys_sid, virt_sid));
        Ok(PtirqEntryId(idx))
    }

    /// `ptirq_activate_entry`: marks a freshly-allocated (or just
    /// reassigned) entry ready for softirq dispatch.
    pub fn activate(&mut self, id: PtirqEntryId, allocated_pirq: u32, vector: u8) -> Result<()> {
        let entry = self.get_mut(id).ok_or(Error::NoSuchEntry)?;
        entry.allocated_pirq = allocated_pirq;
        entry.vector = vector;
        entry.active = true;
        Ok(())
    }

    pub fn deactivate(&mut self, id: PtirqEntryId) {
        if let Some(entry) = self.get_mut(id) {
            entry.active = false;
        }
    }

    pub fn is_active(&self, id: PtirqEntryId) -> bool {
        self.get(id).map(|e| e.active).unwrap_or(false)
    }

    /// `ptirq_release_entry`: returns the slot to the free list. Callers
    /// must have deactivated (and freed any IRTE for) the entry first.
    pub fn release(&mut self, id: PtirqEntryId) {
        if self.slots[id.0].take().is_some() {
            self.free.push(id.0);
        }
    }
}

impl Default for PtirqTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_activate_release_round_trips_a_slot() {
        let mut table = PtirqTable::new();
        let phys = PhysSid::Intx { phys_pin: 5 };
        let virt = VirtSid::Intx { virt_pin: 5, src: VpinSrc::Ioapic };
        let id = table.alloc(0, IntrType::Intx, phys, virt).unwrap();
        assert!(!table.is_active(id));
        table.activate(id, 0x20, 0x41).unwrap();
        assert!(table.is_active(id));
        assert_eq!(table.lookup_by_phys_sid(IntrType::Intx, phys), Some(id));
        table.deactivate(id);
        table.release(id);
        assert_eq!(table.lookup_by_phys_sid(IntrType::Intx, phys), None);
    }

    #[test]
    fn table_reports_full_once_every_slot_is_taken() {
        let mut table = PtirqTable::new();
        for i in 0..MAX_PT_IRQ_ENTRIES {
            let phys = PhysSid::Intx { phys_pin: i as u32 };
            let virt = VirtSid::Intx { virt_pin: i as u32, src: VpinSrc::Ioapic };
            table.alloc(0, IntrType::Intx, phys, virt).unwrap();
        }
        let phys = PhysSid::Intx { phys_pin: 999 };
        let virt = VirtSid::Intx { virt_pin: 999, src: VpinSrc::Ioapic };
        assert_eq!(table.alloc(0, IntrType::Intx, phys, virt), Err(Error::TableFull));
    }

    #[test]
    fn released_slots_are_reused() {
        let mut table = PtirqTable::new();
        let phys = PhysSid::Intx { phys_pin: 1 };
        let virt = VirtSid::Intx { virt_pin: 1, src: VpinSrc::Ioapic };
        let id = table.alloc(0, IntrType::Intx, phys, virt).unwrap();
        table.release(id);
        let id2 = table.alloc(0, IntrType::Intx, phys, virt).unwrap();
        assert_eq!(id, id2);
    }
}
