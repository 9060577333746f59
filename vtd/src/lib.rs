// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VT-d / IOMMU (C6): DMAR unit discovery, domain management, device
//! assignment, and interrupt remapping. `VtdContext` is the one instance
//! `hvcore` owns; everything else in this crate is either per-unit
//! ([`DmarUnit`]) or per-domain ([`IommuDomain`]) state it manages.

mod context;
mod domain;
mod error;
mod irte;
mod regs;
mod unit;

pub use context::ContextEntry;
pub use context::TranslationType;
pub use domain::IommuDomain;
pub use error::Error;
pub use error::Result;
pub use irte::DeliveryMode as IrteDeliveryMode;
pub use irte::DestMode as IrteDestMode;
pub use irte::Irte;
pub use irte::TriggerMode as IrteTriggerMode;
pub use irte::IRTE_TABLE_SIZE;
pub use regs::DmarRegs;
pub use regs::RealDmarRegs;
pub use regs::TestDmarRegs;
pub use unit::BusRange;
pub use unit::DmarUnit;

use sync::Mutex;

use domain::DomainIdAllocator;

/// One VM or physical device's PCI address, used as both the device
/// identity passed to (un)assign and the IRTE source-id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddr {
    pub bus: u8,
    pub devfun: u8,
}

impl PciAddr {
    pub fn new(bus: u8, devfun: u8) -> Self {
        PciAddr { bus, devfun }
    }

    pub fn source_id(&self) -> u16 {
        ((self.bus as u16) << 8) | self.devfun as u16
    }
}

/// Owns every discovered DMAR unit, the shared domain-id bitmap, and the
/// always-present host domain every device starts out assigned to.
pub struct VtdContext {
    units: Vec<DmarUnit>,
    domain_ids: Mutex<DomainIdAllocator>,
    host_domain: IommuDomain,
}

impl VtdContext {
    /// `register_hrhd_units` + `create_host_domain`: takes ownership of
    /// already-constructed per-unit register backends (discovered from
    /// ACPI DMAR tables by whatever owns firmware parsing) and the
    /// service VM's own EPT root, which every not-yet-assigned device is
    /// translated through by default.
    pub fn new(units: Vec<DmarUnit>, host_trans_table_phys: u64, host_addr_width: u32) -> Self {
        let mut domain_ids = DomainIdAllocator::new();
        let host_dom_id = domain_ids.alloc().expect("domain 1 is always free at startup");
        VtdContext {
            units,
            domain_ids: Mutex::new(domain_ids),
            host_domain: IommuDomain {
                dom_id: host_dom_id,
                vm_id: -1,
                is_host: true,
                addr_width: host_addr_width,
                trans_table_phys: host_trans_table_phys,
            },
        }
    }

    fn unit_for(&self, bus: u8) -> Result<&DmarUnit> {
        self.units
            .iter()
            .find(|u| u.bus_range.contains(bus))
            .ok_or(Error::NoDmarUnit(bus))
    }

    pub fn host_domain_id(&self) -> u16 {
        self.host_domain.dom_id
    }

    /// `create_iommu_domain`: every device starts in the host domain, so
    /// this only needs to mint a domain id and record the VM's EPT root.
    pub fn create_domain(&self, vm_id: i32, trans_table_phys: u64, addr_width: u32) -> Result<IommuDomain> {
        let dom_id = self.domain_ids.lock().alloc()?;
        Ok(IommuDomain {
            dom_id,
            vm_id,
            is_host: false,
            addr_width,
            trans_table_phys,
        })
    }

    pub fn destroy_domain(&self, domain: IommuDomain) {
        self.domain_ids.lock().free(domain.dom_id);
    }

    /// `assign_iommu_device`: removes the device from the host domain
    /// first, then adds it to `domain` — the original's own ordering,
    /// which matters because a device can't be present in two context
    /// entries for the same `(bus, devfun)` slot at once.
    pub fn assign_device(&self, domain: &IommuDomain, addr: PciAddr) -> Result<()> {
        let unit = self.unit_for(addr.bus)?;
        unit.remove_device(addr.bus, addr.devfun, &self.host_domain)?;
        unit.add_device(addr.bus, addr.devfun, domain, domain.trans_table_phys)
    }

    /// `unassign_iommu_device`: symmetric handback to the host domain.
    pub fn unassign_device(&self, domain: &IommuDomain, addr: PciAddr) -> Result<()> {
        let unit = self.unit_for(addr.bus)?;
        unit.remove_device(addr.bus, addr.devfun, domain)?;
        unit.add_device(addr.bus, addr.devfun, &self.host_domain, self.host_domain.trans_table_phys)
    }

    /// Initial population: every device starts translated through the
    /// host domain with `ECAP.PT` passthrough where available, so normal
    /// Service VM operation never pays for a second-level walk it
    /// doesn't need.
    pub fn add_device_to_host_domain(&self, addr: PciAddr) -> Result<()> {
        let unit = self.unit_for(addr.bus)?;
        unit.add_device(addr.bus, addr.devfun, &self.host_domain, self.host_domain.trans_table_phys)
    }

    pub fn enable_iommu(&self) {
        for unit in &self.units {
            unit.enable_translation();
        }
    }

    pub fn disable_iommu(&self) {
        for unit in &self.units {
            unit.disable_translation();
        }
    }

    /// `dmar_assign_irte`: programs an IRTE on the unit that owns
    /// `addr`'s bus and returns the index C5 needs to build the
    /// Remappable-Format MSI/IOAPIC entry.
    #[allow(clippy::too_many_arguments)]
    pub fn assign_irte(
        &self,
        addr: PciAddr,
        vector: u8,
        delivery_mode: IrteDeliveryMode,
        dest_mode: IrteDestMode,
        trigger_mode: IrteTriggerMode,
        destination_id: u32,
    ) -> Result<u16> {
        let unit = self.unit_for(addr.bus)?;
        unit.assign_irte(vector, delivery_mode, dest_mode, trigger_mode, destination_id, addr.source_id())
    }

    pub fn free_irte(&self, addr: PciAddr, index: u16) -> Result<()> {
        self.unit_for(addr.bus)?.free_irte(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::TestDmarRegs;

    fn single_unit_context() -> VtdContext {
        let mut regs = TestDmarRegs::new();
        regs.preset64(regs::REG_CAP, 0b0000_0110 << 8);
        regs.preset64(regs::REG_ECAP, 1 << 6);
        let unit = DmarUnit::new(Box::new(regs), BusRange { first: 0, last: 0xff });
        VtdContext::new(vec![unit], 0x9000_0000, 48)
    }

    #[test]
    fn assign_then_unassign_round_trips_through_host_domain() {
        let ctx = single_unit_context();
        let addr = PciAddr::new(0, 0x20);
        ctx.add_device_to_host_domain(addr).unwrap();

        let domain = ctx.create_domain(1, 0x1000_0000, 48).unwrap();
        ctx.assign_device(&domain, addr).unwrap();
        ctx.unassign_device(&domain, addr).unwrap();
        ctx.destroy_domain(domain);
    }

    #[test]
    fn unknown_bus_reports_no_dmar_unit() {
        let ctx = single_unit_context();
        let units: Vec<DmarUnit> = Vec::new();
        let empty = VtdContext::new(units, 0, 48);
        assert_eq!(
            empty.assign_device(&ctx.host_domain, PciAddr::new(3, 0)),
            Err(Error::NoDmarUnit(3))
        );
    }

    #[test]
    fn irte_assignment_is_scoped_to_the_owning_unit() {
        let ctx = single_unit_context();
        let addr = PciAddr::new(0, 0x10);
        let idx = ctx
            .assign_irte(
                addr,
                0x41,
                IrteDeliveryMode::Fixed,
                IrteDestMode::Physical,
                IrteTriggerMode::Edge,
                1,
            )
            .unwrap();
        ctx.free_irte(addr, idx).unwrap();
    }
}
