// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VM lifecycle (C10, spec.md §4.10) and the per-VM container tying every
//! subsystem crate together: vCPUs, the vLAPIC complex, the legacy
//! interrupt controllers, the vUART array, and the I/O-request channel.

use std::cell::Cell;
use std::collections::HashMap;

use irqchip::LegacyIrqChip;
use ioreq::IoReqChannel;
use vlapic::VlapicComplex;
use vmx::Vcpu;
use vuart::VuartSet;

use crate::affinity::CpuMask;
use crate::affinity::VcpuPcpuMap;
use crate::affinity::VmDestResolver;
use crate::config::LoadOrder;
use crate::config::PtDevConfig;
use crate::config::VmConfig;
use crate::config::VmFeatureFlags;
use crate::error::Error;
use crate::error::Result;

/// Guest-physical address width this crate assumes for every VM's EPT
/// root when handing it to `vtd` as a domain's second-level page table;
/// matches `vtd`'s own test fixtures since no per-VM override is modeled
/// at this layer (address-width discovery is part of the out-of-scope
/// physical memory allocator).
const GUEST_ADDR_WIDTH: u32 = 48;

/// A 16550's register file spans 8 consecutive ports from `port_base`.
const UART_REG_WINDOW: u16 = 8;

fn to_vlapic_delivery_mode(mode: irqchip::DeliveryMode) -> vlapic::DeliveryMode {
    match mode {
        irqchip::DeliveryMode::Fixed => vlapic::DeliveryMode::Fixed,
        irqchip::DeliveryMode::LowestPriority => vlapic::DeliveryMode::LowestPriority,
        irqchip::DeliveryMode::Smi => vlapic::DeliveryMode::Smi,
        irqchip::DeliveryMode::Reserved => vlapic::DeliveryMode::RemoteRead,
        irqchip::DeliveryMode::Nmi => vlapic::DeliveryMode::Nmi,
        irqchip::DeliveryMode::Init => vlapic::DeliveryMode::Init,
        irqchip::DeliveryMode::Reserved2 => vlapic::DeliveryMode::Startup,
        irqchip::DeliveryMode::ExtInt => vlapic::DeliveryMode::ExtInt,
    }
}

fn to_vlapic_delivery_mode_from_msi(mode: ptirq::DeliveryMode) -> vlapic::DeliveryMode {
    match mode {
        ptirq::DeliveryMode::Fixed => vlapic::DeliveryMode::Fixed,
        ptirq::DeliveryMode::LowestPriority => vlapic::DeliveryMode::LowestPriority,
        ptirq::DeliveryMode::Smi => vlapic::DeliveryMode::Smi,
        ptirq::DeliveryMode::Reserved => vlapic::DeliveryMode::RemoteRead,
        ptirq::DeliveryMode::Nmi => vlapic::DeliveryMode::Nmi,
        ptirq::DeliveryMode::Init => vlapic::DeliveryMode::Init,
        ptirq::DeliveryMode::Reserved2 => vlapic::DeliveryMode::Startup,
        ptirq::DeliveryMode::ExtInt => vlapic::DeliveryMode::ExtInt,
    }
}

fn to_irte_delivery_mode(mode: ptirq::DeliveryMode) -> vtd::IrteDeliveryMode {
    match mode.normalize() {
        ptirq::DeliveryMode::Fixed => vtd::IrteDeliveryMode::Fixed,
        _ => vtd::IrteDeliveryMode::LowestPriority,
    }
}

/// A `PtDevConfig`/`ptirq` bdf is packed `bus << 8 | devfun`, the same
/// layout `vtd::PciAddr::source_id` produces.
fn pci_addr(bdf: u16) -> vtd::PciAddr {
    vtd::PciAddr::new((bdf >> 8) as u8, (bdf & 0xff) as u8)
}

/// spec.md §2's stated budget is for the *implementation core*; the
/// Service VM and pre-launched VMs get a larger headroom than a minimal
/// guest, so this is a hypervisor-wide ceiling, not a per-load-order one.
pub const MAX_VCPUS_PER_VM: usize = 8;

/// `Poweroff -> Created -> Running <-> Paused -> Poweroff`
/// (spec.md §4.10). `ReadyToPoweroff` is the brief state between
/// `shutdown_vm` being requested and every vCPU having actually parked;
/// `Vm::shutdown_vm` here treats it as instantaneous since there is no
/// separate notification path modeled at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Poweroff,
    Created,
    Running,
    Paused,
    ReadyToPoweroff,
}

impl VmState {
    fn can_transition_to(self, next: VmState) -> bool {
        use VmState::*;
        matches!(
            (self, next),
            (Poweroff, Created)
                | (Created, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Created)
                | (Paused, Created)
                | (Running, ReadyToPoweroff)
                | (Paused, ReadyToPoweroff)
                | (ReadyToPoweroff, Poweroff)
                | (Running, Poweroff)
                | (Paused, Poweroff)
        )
    }
}

/// Forwards a vIOAPIC/vPIC mask<->unmask transition into the passthrough
/// remapper (spec.md §4.4's `ptirq_intx_pin_remap` hook). Only unmask
/// transitions create or re-home a mapping; `ptirq` silently ignores a
/// transition it has no pre-held entry for.
struct PtirqPinObserver<'a> {
    vm_id: u32,
    src: ptirq::VpinSrc,
    ptirq_mgr: &'a ptirq::PtirqManager,
}

impl irqchip::PinRemapObserver for PtirqPinObserver<'_> {
    fn on_pin_mask_transition(&mut self, gsi: u32, masked: bool) {
        if !masked {
            let _ = self.ptirq_mgr.ptirq_intx_pin_remap(self.vm_id, gsi, self.src);
        }
    }
}

/// Records a legacy vUART's `InterruptSink` calls, which fire from
/// inside `Vuart::write`/`read` itself; the level/MSI change is applied
/// to this VM's controllers once the call returns, since that needs
/// `&mut self` and the sink trait only offers `&self`.
#[derive(Default)]
struct VuartSinkState {
    level: Cell<Option<bool>>,
    msi_pending: Cell<bool>,
}

impl vuart::InterruptSink for VuartSinkState {
    fn set_level(&self, asserted: bool) {
        self.level.set(Some(asserted));
    }

    fn trigger_msi(&self) {
        self.msi_pending.set(true);
    }
}

pub struct Vm {
    pub vm_id: u32,
    pub name: String,
    pub load_order: LoadOrder,
    pub features: VmFeatureFlags,
    pub affinity: CpuMask,
    pub pcpu_map: VcpuPcpuMap,
    pub state: VmState,
    pub vcpus: Vec<Vcpu>,
    pub vlapics: VlapicComplex,
    pub irqchip: LegacyIrqChip,
    pub vuarts: VuartSet,
    pub ioreq: IoReqChannel,
    /// The passthrough devices this VM was configured with (spec.md
    /// §4.5); kept around so a later MSI-X remap can look the owning
    /// physical bdf back up by virtual bdf.
    pub pt_devices: Vec<PtDevConfig>,
    /// This VM's IOMMU domain, minted from `VmRegistry`'s shared
    /// `vtd::VtdContext` the first time a device is assigned to it.
    /// `None` for a VM with no passthrough devices or when no `vtd`
    /// context was configured for this hypervisor instance.
    pub iommu_domain: Option<vtd::IommuDomain>,
}

impl Vm {
    /// `create_vm`: validates the vCPU count and affinity mask, then
    /// builds the BSP-first vCPU array and every per-VM subsystem state
    /// the config doesn't otherwise own (spec.md §3's VM invariants:
    /// exactly one BSP at index 0, `created_vcpus <= MAX_VCPUS_PER_VM`,
    /// one pCPU per vCPU).
    pub fn create_vm(config: VmConfig) -> Result<Vm> {
        if config.vcpus.len() > MAX_VCPUS_PER_VM {
            return Err(Error::TooManyVcpus(config.vm_id, config.vcpus.len(), MAX_VCPUS_PER_VM));
        }
        if config.cpu_affinity.is_empty() {
            return Err(Error::EmptyAffinity(config.vm_id));
        }

        let mut sorted = config.vcpus.clone();
        sorted.sort_by_key(|v| v.vcpu_id);
        let mut pcpu_of_vcpu = Vec::with_capacity(sorted.len());
        let mut vcpus = Vec::with_capacity(sorted.len());
        for (expected_id, vcpu_cfg) in sorted.iter().enumerate() {
            if vcpu_cfg.vcpu_id != expected_id {
                return Err(Error::VcpuOutOfRange(vcpu_cfg.vcpu_id, sorted.len()));
            }
            pcpu_of_vcpu.push(vcpu_cfg.pcpu_id);
            // VMCS regions and VPIDs are allocated by the out-of-scope
            // physical memory allocator; `0` is a placeholder the real
            // wiring overwrites before `start_vm`.
            vcpus.push(Vcpu::new(0, expected_id as u16 + 1));
        }

        let num_vcpus = vcpus.len();
        Ok(Vm {
            vm_id: config.vm_id,
            name: config.name,
            load_order: config.load_order,
            features: config.features,
            affinity: config.cpu_affinity,
            pcpu_map: VcpuPcpuMap::new(pcpu_of_vcpu),
            state: VmState::Created,
            vcpus,
            vlapics: VlapicComplex::new(num_vcpus, config.features.lapic_passthrough),
            irqchip: LegacyIrqChip::new(),
            vuarts: VuartSet::new(),
            ioreq: IoReqChannel::new(num_vcpus),
            pt_devices: config.pt_devices,
            iommu_domain: None,
        })
    }

    fn transition(&mut self, next: VmState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::IllegalTransition(self.vm_id, self.state, next));
        }
        self.state = next;
        Ok(())
    }

    /// `start_vm`: launches the BSP only (vCPU 0, pinned to the
    /// least-significant bit of the affinity mask); APs are brought up
    /// later by the Normal-world INIT-SIPI-SIPI sequence the BSP's vLAPIC
    /// emulation already handles, not by this call (spec.md §4.10).
    pub fn start_vm(&mut self) -> Result<()> {
        self.transition(VmState::Running)?;
        if let Some(bsp) = self.vcpus.get_mut(0) {
            bsp.run_state = vmx::VcpuRunState::Running;
        }
        Ok(())
    }

    pub fn pause_vm(&mut self) -> Result<()> {
        self.transition(VmState::Paused)
    }

    /// `reset_vm`: valid from `Running` or `Paused` (spec.md §4.10's
    /// `Running <-> Paused` edge also covers `reset_vm`, not just
    /// `pause_vm`); returns every vCPU to `Init` via `Zombie` and the VM
    /// to `Created` — the caller is expected to call `start_vm` again
    /// afterwards, which re-launches every vCPU from scratch.
    pub fn reset_vm(&mut self) -> Result<()> {
        self.transition(VmState::Created)?;
        for vcpu in self.vcpus.iter_mut() {
            vcpu.reset();
        }
        Ok(())
    }

    pub fn shutdown_vm(&mut self) -> Result<()> {
        if self.state == VmState::Running || self.state == VmState::Paused {
            self.transition(VmState::ReadyToPoweroff)?;
        }
        self.transition(VmState::Poweroff)
    }

    pub fn bsp_pcpu(&self) -> Option<u32> {
        self.affinity.bsp_pcpu()
    }

    /// `vm_set_irqline` (spec.md §6): routes a legacy GSI change through
    /// whichever controller currently owns it (spec.md §4.4's vPIC/vIOAPIC
    /// wire-mode arbitration) and, if that produces a delivery, fans it
    /// out through the vLAPIC complex.
    pub fn set_irqline(&mut self, gsi: u32, level: bool) -> Result<()> {
        match self.irqchip.route_for(gsi) {
            irqchip::IrqRoute::PicExtInt => {
                self.irqchip.pic.set_irqline(gsi as u8, level)?;
            }
            irqchip::IrqRoute::Ioapic | irqchip::IrqRoute::IoapicOnly => {
                let op = if level { irqchip::PinOp::SetHigh } else { irqchip::PinOp::SetLow };
                if let Some(req) = self.irqchip.ioapic.set_irqline(gsi as usize, op)? {
                    self.deliver_ioapic_request(req);
                }
            }
        }
        Ok(())
    }

    fn deliver_ioapic_request(&self, req: irqchip::DeliverRequest) {
        let intr = vlapic::IntrRequest {
            dest: req.dest,
            dest_mode: match req.dest_mode {
                irqchip::DestMode::Physical => vlapic::DestinationMode::Physical,
                irqchip::DestMode::Logical => vlapic::DestinationMode::Logical,
            },
            dest_shorthand: vlapic::DestShorthand::NoShorthand,
            delivery_mode: to_vlapic_delivery_mode(req.delivery_mode),
            vector: req.vector,
            level_triggered: req.level_triggered,
        };
        self.vlapics.receive_intr(None, intr);
    }

    /// `vm_inject_msi` (spec.md §6): decodes a guest-facing MSI
    /// address/data pair the same way `ptirq_msix_remap`'s guest side
    /// does (`MsiInfo::guest_address`/`guest_data`) and fans it out
    /// through the vLAPIC complex directly, for a Service-VM-injected MSI
    /// that isn't routed through a passthrough device's remapping entry.
    pub fn inject_msi(&mut self, vmsi_addr: u64, vmsi_data: u32) -> Result<()> {
        let info = ptirq::MsiInfo { vmsi_addr, vmsi_data, ..Default::default() };
        let guest_addr = info.guest_address();
        let guest_data = info.guest_data();
        let intr = vlapic::IntrRequest {
            dest: guest_addr.get_dest_field() as u32,
            dest_mode: if guest_addr.get_dest_mode_logical() {
                vlapic::DestinationMode::Logical
            } else {
                vlapic::DestinationMode::Physical
            },
            dest_shorthand: vlapic::DestShorthand::NoShorthand,
            delivery_mode: to_vlapic_delivery_mode_from_msi(guest_data.get_delivery_mode()),
            vector: guest_data.get_vector(),
            level_triggered: guest_data.get_trigger_level(),
        };
        self.vlapics.receive_intr(None, intr);
        Ok(())
    }

    /// `ptirq_handle_intx`/`vlapic_intr_msi`'s hvcore-side sink: applies
    /// one `ptirq::SoftirqWork` item already filtered to this VM by
    /// `VmRegistry::service_softirq` (spec.md §4.5 step 2, the softirq
    /// boundary). INTX sources go through whichever legacy controller the
    /// entry's `VirtSid::src` names; MSI sources are injected the same
    /// way a Service-VM-originated `inject_msi` would be.
    fn apply_softirq_work(&mut self, work: ptirq::SoftirqWork) {
        match work {
            ptirq::SoftirqWork::Intx { virt_sid: ptirq::VirtSid::Intx { virt_pin, src }, op, .. } => match src {
                ptirq::VpinSrc::Ioapic => {
                    if let Ok(Some(req)) = self.irqchip.ioapic.set_irqline(virt_pin as usize, op) {
                        self.deliver_ioapic_request(req);
                    }
                }
                ptirq::VpinSrc::Pic => {
                    // `ptirq_handle_intx` only ever produces `SetHigh`
                    // (level, held asserted until `ptirq_intx_ack`) or
                    // `RaisingPulse` (edge) for a PIC-owned pin; a pulse
                    // asserts then immediately releases, mirroring the
                    // vIOAPIC's own pulse handling in `set_irqline`.
                    let _ = self.irqchip.pic.set_irqline(virt_pin as u8, true);
                    if matches!(op, irqchip::PinOp::RaisingPulse) {
                        let _ = self.irqchip.pic.set_irqline(virt_pin as u8, false);
                    }
                }
            },
            ptirq::SoftirqWork::Intx { virt_sid: ptirq::VirtSid::Msi { .. }, .. } => {}
            ptirq::SoftirqWork::Msi { vmsi_addr, vmsi_data, .. } => {
                let _ = self.inject_msi(vmsi_addr, vmsi_data);
            }
        }
    }

    /// `vioapic_process_eoi` + `ptirq_intx_ack` wired end to end (spec.md
    /// §4.5 step 3). `vcpu_idx`'s vLAPIC has already decoded the guest's
    /// EOI write into a vector (`vlapic::Vlapic::process_eoi`); this
    /// forwards it to the vIOAPIC, clears any passthrough entry waiting
    /// on this EOI, and returns every physical IRQ that must now be
    /// `GSI_UNMASK`ed.
    pub fn handle_lapic_eoi(&mut self, vcpu_idx: usize, ptirq_mgr: &ptirq::PtirqManager) -> Result<Vec<u32>> {
        let Some(eoi) = self.vlapics.with_vlapic(vcpu_idx, |l| l.process_eoi())? else {
            return Ok(Vec::new());
        };
        let acks = self.irqchip.ioapic.process_eoi(eoi.vector);
        let mut phys_irqs = Vec::new();
        for ack in acks {
            if let Some(req) = ack.redeliver {
                self.deliver_ioapic_request(req);
            }
            if let Some(intx_ack) = ptirq_mgr.ptirq_intx_ack(self.vm_id, ack.pin as u32, ptirq::VpinSrc::Ioapic) {
                phys_irqs.push(intx_ack.phys_irq);
            }
        }
        Ok(phys_irqs)
    }

    /// Guest MMIO write into the vIOAPIC's `IOREGSEL`/`IOWIN` window
    /// (spec.md §4.4). Threads a `ptirq`-forwarding observer through the
    /// write so an RTE mask<->unmask transition updates the passthrough
    /// remapping table, then re-runs GSI 0's wire-mode arbitration from
    /// both controllers' post-write mask state.
    pub fn vioapic_mmio_write(&mut self, offset: u64, size: usize, value: u32, ptirq_mgr: &ptirq::PtirqManager) -> Result<()> {
        let mut observer = PtirqPinObserver { vm_id: self.vm_id, src: ptirq::VpinSrc::Ioapic, ptirq_mgr };
        if let Some(req) = self.irqchip.ioapic.mmio_write(offset, size, value, &mut observer)? {
            self.deliver_ioapic_request(req);
        }
        self.resync_wire_mode()?;
        Ok(())
    }

    pub fn vioapic_mmio_read(&self, offset: u64, size: usize) -> Result<u32> {
        Ok(self.irqchip.ioapic.mmio_read(offset, size)?)
    }

    /// Guest I/O-port write to the legacy `0x20`/`0x21`/`0xa0`/`0xa1` pair
    /// (spec.md §4.4). Same observer wiring as `vioapic_mmio_write`, since
    /// either controller's mask state can flip GSI 0's wire-mode route.
    pub fn vpic_io_write(&mut self, port: u16, value: u8, ptirq_mgr: &ptirq::PtirqManager) -> Result<()> {
        let mut observer = PtirqPinObserver { vm_id: self.vm_id, src: ptirq::VpinSrc::Pic, ptirq_mgr };
        self.irqchip.pic.io_write(port, value, &mut observer)?;
        self.resync_wire_mode()?;
        Ok(())
    }

    pub fn vpic_io_read(&mut self, port: u16) -> Result<u8> {
        Ok(self.irqchip.pic.io_read(port)?)
    }

    fn resync_wire_mode(&mut self) -> Result<()> {
        let ioapic_pin0_masked = self.irqchip.ioapic.rte(0)?.get_interrupt_mask();
        let pic_pin0_masked = self.irqchip.pic.is_masked(0)?;
        self.irqchip.observe_pin_zero_masks(ioapic_pin0_masked, pic_pin0_masked);
        Ok(())
    }

    /// Guest I/O-port write to vUART `index` (spec.md §4.9). `port` is
    /// translated to the UART's register offset from its configured
    /// `port_base`; cross-VM channel routing isn't threaded through here,
    /// so this serves the console vUART every VM carries at index 0.
    pub fn vuart_io_write(&mut self, index: usize, port: u16, value: u8) -> Result<()> {
        let offset = self.vuart_offset(index, port)?;
        let sink = VuartSinkState::default();
        self.vuarts.get_mut(index)?.write(offset, value, None, &sink);
        self.apply_vuart_sink(index, &sink)
    }

    pub fn vuart_io_read(&mut self, index: usize, port: u16) -> Result<u8> {
        let offset = self.vuart_offset(index, port)?;
        let sink = VuartSinkState::default();
        let value = self.vuarts.get_mut(index)?.read(offset, None, &sink);
        self.apply_vuart_sink(index, &sink)?;
        Ok(value)
    }

    fn vuart_offset(&self, index: usize, port: u16) -> Result<u16> {
        let base = self.vuarts.get(index)?.config.port_base;
        let offset = port.checked_sub(base).ok_or(Error::NoSuchVuartPort(index, port))?;
        if offset < UART_REG_WINDOW {
            Ok(offset)
        } else {
            Err(Error::NoSuchVuartPort(index, port))
        }
    }

    /// The installed vUART (if any) whose 8-register window covers `port`,
    /// used by claim-first port-I/O routing to tell a legacy UART access
    /// from one this VM's device model has nothing to do with.
    fn vuart_index_for_port(&self, port: u16) -> Option<usize> {
        (0..vuart::MAX_VUART_NUM_PER_VM).find(|&i| self.vuart_offset(i, port).is_ok())
    }

    fn apply_vuart_sink(&mut self, index: usize, sink: &VuartSinkState) -> Result<()> {
        if let Some(asserted) = sink.level.get() {
            let irq = self.vuarts.get(index)?.config.irq;
            self.set_irqline(irq as u32, asserted)?;
        }
        if sink.msi_pending.get() {
            log::debug!("vuart {index} pci msi trigger requested but no msi binding is modeled");
        }
        Ok(())
    }

    /// spec.md §4.7's claim-first port I/O routing: vPIC and any installed
    /// vUART are served in-hypervisor; everything else is queued on the
    /// I/O-request channel for the Service VM's device model to pick up.
    /// `Ok(Some(value))` is a completed read the caller writes back into the
    /// guest's GPR; `Ok(None)` is either a write or a request now pending
    /// completion via [`Vm::complete_io_request`].
    pub fn handle_port_io(
        &mut self,
        vcpu_id: usize,
        req: ioreq::PioRequest,
        ptirq_mgr: &ptirq::PtirqManager,
        upcall: &dyn ioreq::HsmUpcall,
    ) -> Result<Option<u32>> {
        match req.address {
            0x20 | 0x21 | 0xa0 | 0xa1 => match req.direction {
                ioreq::Direction::Write => {
                    self.vpic_io_write(req.address, req.value as u8, ptirq_mgr)?;
                    Ok(None)
                }
                ioreq::Direction::Read => Ok(Some(self.vpic_io_read(req.address)? as u32)),
            },
            port => match self.vuart_index_for_port(port) {
                Some(index) => match req.direction {
                    ioreq::Direction::Write => {
                        self.vuart_io_write(index, port, req.value as u8)?;
                        Ok(None)
                    }
                    ioreq::Direction::Read => Ok(Some(self.vuart_io_read(index, port)? as u32)),
                },
                None => {
                    self.ioreq.insert_request(vcpu_id, ioreq::RequestBody::Pio(req), false, upcall)?;
                    Ok(None)
                }
            },
        }
    }

    /// The Service VM's `SetIoReqCompletion` hypercall (spec.md §6):
    /// publishes the device model's result and wakes whichever vCPU is
    /// waiting on it.
    pub fn complete_io_request(&mut self, vcpu_id: usize, result: ioreq::RequestBody) -> Result<()> {
        Ok(self.ioreq.complete(vcpu_id, result)?)
    }
}

/// `ptdev_softirq`'s live trigger-mode query: the owning VM's vIOAPIC RTE
/// or vPIC ELCR bit for the entry's virtual pin, looked up by `vm_id`
/// since distinct VMs number their virtual pins independently. `false`
/// (edge) for a VM that no longer exists or an MSI source, neither of
/// which this query is ever meaningfully asked about.
fn trigger_level_for(vms: &HashMap<u32, Vm>, vm_id: u32, virt_sid: ptirq::VirtSid) -> bool {
    let Some(vm) = vms.get(&vm_id) else { return false };
    match virt_sid {
        ptirq::VirtSid::Intx { virt_pin, src: ptirq::VpinSrc::Ioapic } => vm
            .irqchip
            .ioapic
            .rte(virt_pin as usize)
            .map(|rte| rte.get_trigger_mode() == irqchip::TriggerMode::Level)
            .unwrap_or(false),
        ptirq::VirtSid::Intx { virt_pin, src: ptirq::VpinSrc::Pic } => {
            vm.irqchip.pic.is_level_triggered(virt_pin as u8).unwrap_or(false)
        }
        ptirq::VirtSid::Msi { .. } => false,
    }
}

/// The hypervisor-wide VM registry, keyed by `vm_id`: owns every live
/// `Vm` plus the two hypervisor-wide passthrough subsystems that span VM
/// boundaries (spec.md §4.5/§4.6) — `ptirq::PtirqManager`'s remapping
/// table is keyed by physical source across every VM, and `vtd`'s DMAR
/// units and domain-id space are shared the same way.
pub struct VmRegistry {
    vms: HashMap<u32, Vm>,
    ptirq: ptirq::PtirqManager,
    vtd: Option<vtd::VtdContext>,
}

impl VmRegistry {
    /// `service_vm_id` is the one VM `ptirq::PtirqManager` allows to
    /// pre-hold a passthrough source before any guest has claimed it
    /// (spec.md §4.5's ownership-transfer rule).
    pub fn new(num_pcpus: usize, service_vm_id: u32) -> Self {
        VmRegistry {
            vms: HashMap::new(),
            ptirq: ptirq::PtirqManager::new(num_pcpus, service_vm_id),
            vtd: None,
        }
    }

    /// Attaches a `vtd::VtdContext` built from already-discovered DMAR
    /// units (firmware/ACPI parsing is out of scope, spec.md §1). Without
    /// one, passthrough devices still get ptirq remapping table entries
    /// but no IRTE programming — `ptirq_msix_remap` falls back to the
    /// Compatibility Format, same as real hardware with IR disabled.
    pub fn with_vtd(mut self, vtd: vtd::VtdContext) -> Self {
        self.vtd = Some(vtd);
        self
    }

    /// Seeds the ptirq remapping table (and, if a `vtd` context is
    /// attached, an IOMMU domain) from `config.pt_devices` before handing
    /// the new `Vm` to the caller (spec.md §4.5, §4.10).
    pub fn create_vm(&mut self, config: VmConfig) -> Result<u32> {
        let vm_id = config.vm_id;
        if self.vms.contains_key(&vm_id) {
            return Err(Error::VmAlreadyExists(vm_id));
        }
        let mut vm = Vm::create_vm(config)?;
        self.seed_passthrough(&mut vm)?;
        self.vms.insert(vm_id, vm);
        Ok(vm_id)
    }

    /// Mints one IOMMU domain for the whole VM (every passthrough device
    /// a VM owns shares its single EPT root, spec.md §4.6's `is_tt_ept`
    /// choice) and assigns each configured device into it, then seeds the
    /// ptirq remapping table for the INTX/MSI-X sources `pt_devices`
    /// names.
    fn seed_passthrough(&mut self, vm: &mut Vm) -> Result<()> {
        if vm.pt_devices.is_empty() {
            return Ok(());
        }
        if let Some(vtd_ctx) = &self.vtd {
            let domain = vtd_ctx.create_domain(vm.vm_id as i32, 0, GUEST_ADDR_WIDTH)?;
            for dev in &vm.pt_devices {
                vtd_ctx.assign_device(&domain, pci_addr(dev.phys_bdf))?;
            }
            vm.iommu_domain = Some(domain);
        }
        for dev in &vm.pt_devices {
            if let Some(intx) = &dev.intx {
                let vector = 0x20 + intx.phys_pin as u8;
                self.ptirq.add_intx_remapping(vm.vm_id, intx.virt_pin, intx.phys_pin, intx.pic_pin, vector)?;
            }
            for entry_nr in 0..dev.num_msix_entries {
                self.ptirq.add_msix_remapping(vm.vm_id, dev.virt_bdf, dev.phys_bdf, entry_nr, 0)?;
            }
        }
        Ok(())
    }

    pub fn get(&self, vm_id: u32) -> Result<&Vm> {
        self.vms.get(&vm_id).ok_or(Error::NoSuchVm(vm_id))
    }

    pub fn get_mut(&mut self, vm_id: u32) -> Result<&mut Vm> {
        self.vms.get_mut(&vm_id).ok_or(Error::NoSuchVm(vm_id))
    }

    /// Tears down every ptirq entry and IOMMU assignment this VM's
    /// passthrough devices hold before removing it from the registry.
    pub fn destroy_vm(&mut self, vm_id: u32) -> Result<()> {
        let vm = self.get_mut(vm_id)?;
        vm.shutdown_vm()?;
        let pt_devices = std::mem::take(&mut vm.pt_devices);
        let domain = vm.iommu_domain.take();
        for dev in &pt_devices {
            if let Some(intx) = &dev.intx {
                self.ptirq.remove_intx_remapping(vm_id, intx.virt_pin, intx.pic_pin);
            }
            for entry_nr in 0..dev.num_msix_entries {
                self.ptirq.remove_msix_remapping(vm_id, dev.virt_bdf, entry_nr);
            }
        }
        if let (Some(vtd_ctx), Some(domain)) = (&self.vtd, domain) {
            for dev in &pt_devices {
                vtd_ctx.unassign_device(&domain, pci_addr(dev.phys_bdf))?;
            }
            vtd_ctx.destroy_domain(domain);
        }
        self.vms.remove(&vm_id);
        Ok(())
    }

    /// `hcall_add_irq_routing` (vIOAPIC/vPIC half, spec.md §6): a
    /// Service-VM Device Model request to pre-hold a legacy passthrough
    /// source for a non-Service VM.
    pub fn add_intx_remapping(&self, vm_id: u32, virt_pin: u32, phys_pin: u32, pic_pin: bool, vector: u8) -> Result<()> {
        self.get(vm_id)?;
        self.ptirq.add_intx_remapping(vm_id, virt_pin, phys_pin, pic_pin, vector)?;
        Ok(())
    }

    pub fn remove_intx_remapping(&self, vm_id: u32, virt_pin: u32, pic_pin: bool) -> Result<()> {
        self.get(vm_id)?;
        self.ptirq.remove_intx_remapping(vm_id, virt_pin, pic_pin);
        Ok(())
    }

    pub fn add_msix_remapping(&self, vm_id: u32, virt_bdf: u16, phys_bdf: u16, entry_nr: u16, vector: u8) -> Result<()> {
        self.get(vm_id)?;
        self.ptirq.add_msix_remapping(vm_id, virt_bdf, phys_bdf, entry_nr, vector)?;
        Ok(())
    }

    pub fn remove_msix_remapping(&self, vm_id: u32, virt_bdf: u16, entry_nr: u16) -> Result<()> {
        self.get(vm_id)?;
        self.ptirq.remove_msix_remapping(vm_id, virt_bdf, entry_nr);
        Ok(())
    }

    /// `ptirq_msix_remap` wired up end to end: resolves the guest's
    /// programmed destination through this VM's own vLAPIC/pCPU-affinity
    /// state (`VmDestResolver`, spec.md §4.5) and, if a `vtd` context is
    /// attached and this entry's physical device is known, programs a
    /// real IRTE so the rewrite uses the Remappable Format.
    pub fn remap_msix(&self, vm_id: u32, virt_bdf: u16, entry_nr: u16, info: &mut ptirq::MsiInfo) -> Result<()> {
        let vm = self.get(vm_id)?;
        let resolver = VmDestResolver { vlapics: &vm.vlapics, pcpu_map: &vm.pcpu_map };
        let vtd_irte = self.assign_msix_irte(vm, virt_bdf, info)?;
        self.ptirq.ptirq_msix_remap(vm_id, virt_bdf, entry_nr, info, &resolver, vtd_irte)?;
        Ok(())
    }

    fn assign_msix_irte(&self, vm: &Vm, virt_bdf: u16, info: &ptirq::MsiInfo) -> Result<Option<u16>> {
        let (vtd_ctx, dev) = match (&self.vtd, vm.pt_devices.iter().find(|d| d.virt_bdf == virt_bdf)) {
            (Some(ctx), Some(dev)) => (ctx, dev),
            _ => return Ok(None),
        };
        let addr = pci_addr(dev.phys_bdf);
        let guest_addr = info.guest_address();
        let guest_data = info.guest_data();
        let dest_mode = if guest_addr.get_dest_mode_logical() { vtd::IrteDestMode::Logical } else { vtd::IrteDestMode::Physical };
        let index = vtd_ctx.assign_irte(
            addr,
            guest_data.get_vector(),
            to_irte_delivery_mode(guest_data.get_delivery_mode()),
            dest_mode,
            vtd::IrteTriggerMode::Edge,
            guest_addr.get_dest_field() as u32,
        )?;
        Ok(Some(index))
    }

    /// `hcall_set_irqline` (spec.md §6).
    pub fn set_irqline(&mut self, vm_id: u32, gsi: u32, level: bool) -> Result<()> {
        self.get_mut(vm_id)?.set_irqline(gsi, level)
    }

    /// `hcall_inject_msi` (spec.md §6).
    pub fn inject_msi(&mut self, vm_id: u32, vmsi_addr: u64, vmsi_data: u32) -> Result<()> {
        self.get_mut(vm_id)?.inject_msi(vmsi_addr, vmsi_data)
    }

    /// Guest MMIO write into `vm_id`'s vIOAPIC, threading the registry's
    /// shared `ptirq` table so a mask<->unmask transition reaches
    /// `ptirq_intx_pin_remap` (spec.md §4.4).
    pub fn vioapic_mmio_write(&mut self, vm_id: u32, offset: u64, size: usize, value: u32) -> Result<()> {
        let ptirq_mgr = &self.ptirq;
        let vm = self.vms.get_mut(&vm_id).ok_or(Error::NoSuchVm(vm_id))?;
        vm.vioapic_mmio_write(offset, size, value, ptirq_mgr)
    }

    pub fn vioapic_mmio_read(&self, vm_id: u32, offset: u64, size: usize) -> Result<u32> {
        self.get(vm_id)?.vioapic_mmio_read(offset, size)
    }

    /// Guest I/O-port write to `vm_id`'s vPIC, same `ptirq` wiring as
    /// `vioapic_mmio_write`.
    pub fn vpic_io_write(&mut self, vm_id: u32, port: u16, value: u8) -> Result<()> {
        let ptirq_mgr = &self.ptirq;
        let vm = self.vms.get_mut(&vm_id).ok_or(Error::NoSuchVm(vm_id))?;
        vm.vpic_io_write(port, value, ptirq_mgr)
    }

    pub fn vpic_io_read(&mut self, vm_id: u32, port: u16) -> Result<u8> {
        self.vms.get_mut(&vm_id).ok_or(Error::NoSuchVm(vm_id))?.vpic_io_read(port)
    }

    /// Guest I/O-port write to `vm_id`'s vUART `index` (spec.md §4.9).
    pub fn vuart_io_write(&mut self, vm_id: u32, index: usize, port: u16, value: u8) -> Result<()> {
        self.vms.get_mut(&vm_id).ok_or(Error::NoSuchVm(vm_id))?.vuart_io_write(index, port, value)
    }

    pub fn vuart_io_read(&mut self, vm_id: u32, index: usize, port: u16) -> Result<u8> {
        self.vms.get_mut(&vm_id).ok_or(Error::NoSuchVm(vm_id))?.vuart_io_read(index, port)
    }

    /// `vm_id`'s claim-first port I/O entry point (spec.md §4.7), threading
    /// the registry's shared `ptirq` table the same way `vpic_io_write`
    /// does for the PIC branch of the routing decision.
    pub fn handle_port_io(
        &mut self,
        vm_id: u32,
        vcpu_id: usize,
        req: ioreq::PioRequest,
        upcall: &dyn ioreq::HsmUpcall,
    ) -> Result<Option<u32>> {
        let ptirq_mgr = &self.ptirq;
        let vm = self.vms.get_mut(&vm_id).ok_or(Error::NoSuchVm(vm_id))?;
        vm.handle_port_io(vcpu_id, req, ptirq_mgr, upcall)
    }

    /// `vm_id`'s `SetIoReqCompletion` hypercall handler (spec.md §6).
    pub fn complete_io_request(&mut self, vm_id: u32, vcpu_id: usize, result: ioreq::RequestBody) -> Result<()> {
        self.vms.get_mut(&vm_id).ok_or(Error::NoSuchVm(vm_id))?.complete_io_request(vcpu_id, result)
    }

    /// `ptdev_enqueue_softirq` (spec.md §4.5 step 1): the out-of-scope
    /// physical-interrupt top-half's entry point for a passthrough source
    /// that just fired, keyed by the pCPU the top-half is running on.
    pub fn enqueue_softirq(&self, pcpu_id: usize, intr_type: ptirq::IntrType, phys_sid: ptirq::PhysSid) {
        self.ptirq.enqueue_softirq(pcpu_id, intr_type, phys_sid);
    }

    /// `ptdev_softirq` (spec.md §4.5 step 2): drains `pcpu_id`'s queue and
    /// applies every dequeued entry to its owning VM's legacy controller
    /// or vLAPIC. Returns the number of entries applied, for a caller (or
    /// test) confirming delivery happened.
    pub fn service_softirq(&mut self, pcpu_id: usize) -> usize {
        let vms = &self.vms;
        let work = self.ptirq.ptdev_softirq(pcpu_id, |vm_id, virt_sid| trigger_level_for(vms, vm_id, virt_sid));
        let applied = work.len();
        for item in work {
            let vm_id = match item {
                ptirq::SoftirqWork::Intx { vm_id, .. } => vm_id,
                ptirq::SoftirqWork::Msi { vm_id, .. } => vm_id,
            };
            if let Some(vm) = self.vms.get_mut(&vm_id) {
                vm.apply_softirq_work(item);
            }
        }
        applied
    }

    /// `vioapic_process_eoi` + `ptirq_intx_ack` wired end to end (spec.md
    /// §4.5 step 3), routed through the registry since the ptirq
    /// remapping table is hypervisor-wide, not per-VM.
    pub fn handle_lapic_eoi(&mut self, vm_id: u32, vcpu_idx: usize) -> Result<Vec<u32>> {
        let vm = self.vms.get_mut(&vm_id).ok_or(Error::NoSuchVm(vm_id))?;
        vm.handle_lapic_eoi(vcpu_idx, &self.ptirq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadOrder;
    use crate::config::VcpuConfig;

    fn test_config() -> VmConfig {
        VmConfig {
            vm_id: 1,
            name: "test".into(),
            load_order: LoadOrder::PostLaunched,
            features: VmFeatureFlags::default(),
            cpu_affinity: CpuMask::new(0b11),
            vcpus: vec![
                VcpuConfig { vcpu_id: 0, pcpu_id: 0 },
                VcpuConfig { vcpu_id: 1, pcpu_id: 1 },
            ],
            pt_devices: vec![],
        }
    }

    #[test]
    fn create_vm_starts_in_created_with_bsp_at_index_zero() {
        let vm = Vm::create_vm(test_config()).unwrap();
        assert_eq!(vm.state, VmState::Created);
        assert_eq!(vm.vcpus.len(), 2);
        assert_eq!(vm.bsp_pcpu(), Some(0));
    }

    #[test]
    fn too_many_vcpus_is_rejected() {
        let mut config = test_config();
        config.vcpus = (0..MAX_VCPUS_PER_VM + 1).map(|i| VcpuConfig { vcpu_id: i, pcpu_id: i as u32 }).collect();
        let err = Vm::create_vm(config).unwrap_err();
        assert!(matches!(err, Error::TooManyVcpus(1, _, MAX_VCPUS_PER_VM)));
    }

    #[test]
    fn empty_affinity_is_rejected() {
        let mut config = test_config();
        config.cpu_affinity = CpuMask::new(0);
        assert!(matches!(Vm::create_vm(config), Err(Error::EmptyAffinity(1))));
    }

    #[test]
    fn lifecycle_follows_the_spec_state_diagram() {
        let mut vm = Vm::create_vm(test_config()).unwrap();
        vm.start_vm().unwrap();
        assert_eq!(vm.state, VmState::Running);
        vm.pause_vm().unwrap();
        assert_eq!(vm.state, VmState::Paused);
        vm.start_vm().unwrap();
        assert_eq!(vm.state, VmState::Running);
        vm.shutdown_vm().unwrap();
        assert_eq!(vm.state, VmState::Poweroff);
    }

    #[test]
    fn starting_a_vm_that_is_not_created_is_illegal() {
        let mut vm = Vm::create_vm(test_config()).unwrap();
        vm.start_vm().unwrap();
        let err = vm.start_vm().unwrap_err();
        assert!(matches!(err, Error::IllegalTransition(1, VmState::Running, VmState::Running)));
    }

    #[test]
    fn registry_roundtrips_create_get_destroy() {
        let mut registry = VmRegistry::new(2, 0);
        let vm_id = registry.create_vm(test_config()).unwrap();
        assert!(registry.get(vm_id).is_ok());
        registry.destroy_vm(vm_id).unwrap();
        assert!(matches!(registry.get(vm_id), Err(Error::NoSuchVm(_))));
    }

    #[test]
    fn registry_seeds_ptirq_from_pt_devices_and_tears_down_on_destroy() {
        let mut config = test_config();
        config.pt_devices = vec![crate::config::PtDevConfig {
            phys_bdf: 0x0020,
            virt_bdf: 0x0010,
            intx: Some(crate::config::PtIntxConfig { phys_pin: 5, virt_pin: 5, pic_pin: false }),
            num_msix_entries: 0,
        }];
        let mut registry = VmRegistry::new(2, 0);
        let vm_id = registry.create_vm(config).unwrap();
        // Re-adding the same intx source from the same VM should no-op
        // rather than conflict, confirming the table already holds it.
        registry.add_intx_remapping(vm_id, 5, 5, false, 0x25).unwrap();
        registry.destroy_vm(vm_id).unwrap();
    }

    #[test]
    fn registry_remap_msix_uses_the_vm_dest_resolver() {
        let mut config = test_config();
        config.pt_devices = vec![crate::config::PtDevConfig {
            phys_bdf: 0x0020,
            virt_bdf: 0x0010,
            intx: None,
            num_msix_entries: 1,
        }];
        let mut registry = VmRegistry::new(2, 0);
        let vm_id = registry.create_vm(config).unwrap();
        let mut info = ptirq::MsiInfo { vmsi_addr: 0xfee0_0000, vmsi_data: 0x4041, ..Default::default() };
        registry.remap_msix(vm_id, 0x0010, 0, &mut info).unwrap();
        assert_ne!(info.pmsi_data, info.vmsi_data);
    }

    #[test]
    fn set_irqline_on_ioapic_owned_gsi_sets_target_irr() {
        let mut vm = Vm::create_vm(test_config()).unwrap();
        // Select pin 5's low RTE word and unmask it with vector 0x41,
        // leaving dest_mode/dest_id at their power-on default (Physical,
        // 0) — the BSP's own apic id.
        vm.irqchip.ioapic.mmio_write(0x00, 4, 0x10 + 5 * 2, &mut irqchip::NullPinObserver).unwrap();
        vm.irqchip.ioapic.mmio_write(0x10, 4, 0x41, &mut irqchip::NullPinObserver).unwrap();
        vm.set_irqline(5, true).unwrap();
        vm.vlapics.with_vlapic(0, |l| assert_eq!(l.highest_irr(), Some(0x41))).unwrap();
    }

    #[test]
    fn inject_msi_delivers_to_the_decoded_destination() {
        let mut vm = Vm::create_vm(test_config()).unwrap();
        let mut addr = ptirq::MsiInfo::default();
        addr.vmsi_addr = 0xfee0_0000 | (1 << 12);
        addr.vmsi_data = 0x41;
        vm.inject_msi(addr.vmsi_addr, addr.vmsi_data).unwrap();
        vm.vlapics.with_vlapic(1, |l| assert_eq!(l.highest_irr(), Some(0x41))).unwrap();
    }

    #[test]
    fn vioapic_mmio_write_switches_gsi_zero_route_to_ioapic() {
        let mgr = ptirq::PtirqManager::new(1, 0);
        let mut vm = Vm::create_vm(test_config()).unwrap();
        assert_eq!(vm.irqchip.route_for(0), irqchip::IrqRoute::PicExtInt);
        // Select RTE 0's low word and unmask it; the vPIC side is still
        // masked (power-on default), so the route should flip to the
        // vIOAPIC per spec.md §4.4's NULL -> IOAPIC latch.
        vm.vioapic_mmio_write(0x00, 4, 0x10, &mgr).unwrap();
        vm.vioapic_mmio_write(0x10, 4, 0x41, &mgr).unwrap();
        assert_eq!(vm.irqchip.route_for(0), irqchip::IrqRoute::Ioapic);
    }

    #[test]
    fn vioapic_unmask_auto_creates_a_fresh_intx_mapping_for_the_service_vm() {
        let mut registry = VmRegistry::new(2, 1);
        let vm_id = registry.create_vm(test_config()).unwrap();
        assert_eq!(vm_id, 1);
        // Select RTE 5's low word and unmask it with vector 0x41; no
        // passthrough entry has been registered for this pin yet, so the
        // service VM's auto-create path in `ptirq_intx_pin_remap` should
        // stand one up from scratch.
        registry.vioapic_mmio_write(vm_id, 0x00, 4, 0x10 + 5 * 2).unwrap();
        registry.vioapic_mmio_write(vm_id, 0x10, 4, 0x41).unwrap();
        registry.enqueue_softirq(0, ptirq::IntrType::Intx, ptirq::PhysSid::Intx { phys_pin: 5 });
        assert_eq!(registry.service_softirq(0), 1);
    }

    #[test]
    fn vpic_io_write_unmasking_master_pin_zero_latches_intr_wire_mode() {
        let mgr = ptirq::PtirqManager::new(1, 0);
        let mut vm = Vm::create_vm(test_config()).unwrap();
        vm.vpic_io_write(0x21, 0x00, &mgr).unwrap(); // unmask every master pin
        assert_eq!(vm.irqchip.route_for(0), irqchip::IrqRoute::PicExtInt);
        assert_eq!(vm.irqchip.pic.wire_mode(), irqchip::WireMode::Intr);
    }

    #[test]
    fn vuart_io_write_to_thr_raises_the_configured_irq_line() {
        let mut vm = Vm::create_vm(test_config()).unwrap();
        vm.vuarts.install(0, vuart::VuartConfig { port_base: 0x3f8, irq: 4, is_pci: false }).unwrap();
        vm.irqchip.ioapic.mmio_write(0x00, 4, 0x10 + 4 * 2, &mut irqchip::NullPinObserver).unwrap();
        vm.irqchip.ioapic.mmio_write(0x10, 4, 0x44, &mut irqchip::NullPinObserver).unwrap();
        // Enabling THRE (IER offset 1, ETBEI bit) on its 0->1 edge latches
        // `thre_int_pending`, which this same write reports as a level
        // rise on irq 4.
        vm.vuart_io_write(0, 0x3f9, 0x02).unwrap();
        vm.vlapics.with_vlapic(0, |l| assert_eq!(l.highest_irr(), Some(0x44))).unwrap();
    }

    #[test]
    fn vuart_io_read_from_unmapped_port_is_rejected() {
        let mut vm = Vm::create_vm(test_config()).unwrap();
        vm.vuarts.install(0, vuart::VuartConfig { port_base: 0x3f8, irq: 4, is_pci: false }).unwrap();
        assert!(matches!(vm.vuart_io_read(0, 0x2f8), Err(Error::NoSuchVuartPort(0, 0x2f8))));
    }

    struct CountingUpcall(std::cell::Cell<usize>);
    impl ioreq::HsmUpcall for CountingUpcall {
        fn raise(&self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn handle_port_io_claims_vpic_ports_in_hypervisor() {
        let mgr = ptirq::PtirqManager::new(1, 0);
        let mut vm = Vm::create_vm(test_config()).unwrap();
        let upcall = CountingUpcall(std::cell::Cell::new(0));
        let req = ioreq::PioRequest { address: 0x21, direction: ioreq::Direction::Write, size: 1, value: 0xff };
        let result = vm.handle_port_io(0, req, &mgr, &upcall).unwrap();
        assert_eq!(result, None);
        assert_eq!(upcall.0.get(), 0, "a claimed port never reaches the Service VM");
    }

    #[test]
    fn handle_port_io_claims_an_installed_vuart() {
        let mgr = ptirq::PtirqManager::new(1, 0);
        let mut vm = Vm::create_vm(test_config()).unwrap();
        vm.vuarts.install(0, vuart::VuartConfig { port_base: 0x3f8, irq: 4, is_pci: false }).unwrap();
        let upcall = CountingUpcall(std::cell::Cell::new(0));
        let write = ioreq::PioRequest { address: 0x3f8, direction: ioreq::Direction::Write, size: 1, value: b'A' as u32 };
        assert_eq!(vm.handle_port_io(0, write, &mgr, &upcall).unwrap(), None);
        let read = ioreq::PioRequest { address: 0x3fd, direction: ioreq::Direction::Read, size: 1, value: 0 };
        let lsr = vm.handle_port_io(0, read, &mgr, &upcall).unwrap().unwrap();
        assert_ne!(lsr as u8 & 0x20, 0, "THRE should read back set");
        assert_eq!(upcall.0.get(), 0);
    }

    #[test]
    fn handle_port_io_falls_back_to_the_io_request_channel_for_an_unclaimed_port() {
        let mgr = ptirq::PtirqManager::new(1, 0);
        let mut vm = Vm::create_vm(test_config()).unwrap();
        let upcall = CountingUpcall(std::cell::Cell::new(0));
        let req = ioreq::PioRequest { address: 0xcf8, direction: ioreq::Direction::Write, size: 4, value: 0x8000_0000 };
        assert_eq!(vm.handle_port_io(0, req, &mgr, &upcall).unwrap(), None);
        assert_eq!(upcall.0.get(), 1);
        assert_eq!(vm.ioreq.pending_vcpus(), vec![0]);
    }

    #[test]
    fn complete_io_request_publishes_the_service_vm_result() {
        let mgr = ptirq::PtirqManager::new(1, 0);
        let mut vm = Vm::create_vm(test_config()).unwrap();
        let upcall = CountingUpcall(std::cell::Cell::new(0));
        let req = ioreq::PioRequest { address: 0xcf8, direction: ioreq::Direction::Read, size: 4, value: 0 };
        vm.handle_port_io(0, req, &mgr, &upcall).unwrap();
        vm.ioreq.accept(0).unwrap();
        let result = ioreq::RequestBody::Pio(ioreq::PioRequest { address: 0xcf8, direction: ioreq::Direction::Read, size: 4, value: 0x1234 });
        vm.complete_io_request(0, result).unwrap();
        assert!(vm.ioreq.is_complete(0).unwrap());
    }
}
