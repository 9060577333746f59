// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire shapes for the Service VM's hypercall surface (spec.md §6):
//! struct-aligned, little-endian, 8-byte-packed parameter blocks. The
//! VMCALL trap itself is part of C2's exit dispatch and out of this
//! module's scope; what lives here is the data each request carries plus
//! the [`handlers`] functions that call into the owning `VmRegistry`/`Vm`
//! method and convert this crate's internal `Result` into the
//! ABI-facing `base::Result` a real VMCALL handler would hand back to
//! the guest.

use data_model::DataInit as _;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/// Mirrors `acrn_vm_creation` (SPEC_FULL §2): the literal shape a
/// `CreateVm` hypercall parameter carries. Derives the `zerocopy` traits
/// directly (rather than a manual `unsafe impl DataInit`) so it picks up
/// [`data_model::DataInit`] through the crate's blanket impl, the same
/// way `common/data_model`'s own test type does.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
pub struct VmCreateParams {
    pub vmid: u16,
    pub vcpu_num: u16,
    pub reserved0: u32,
    pub name: [u8; 16],
    pub vm_flag: u64,
    /// Host-physical address of the 4 KiB I/O-request shared page.
    pub ioreq_buf: u64,
    pub cpu_affinity: u64,
}

/// Request codes named in spec.md §6. Only the shapes this crate models
/// end up with a matching parameter struct; the rest are listed so the
/// dispatch switch this enum exists for stays exhaustive as the surface
/// grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HypercallCode {
    CreateVm = 0,
    StartVm = 1,
    PauseVm = 2,
    ResetVm = 3,
    DestroyVm = 4,
    SetVcpuRegs = 5,
    SetIrqLine = 6,
    InjectMsi = 7,
    AddIntxRemapping = 8,
    RemoveIntxRemapping = 9,
    AddMsixRemapping = 10,
    RemoveMsixRemapping = 11,
    CreateVdev = 12,
    DestroyVdev = 13,
    SetIoReqCompletion = 14,
}

/// One wrapper per [`HypercallCode`] whose request this crate can
/// actually carry out, each forwarding to the matching `VmRegistry`/`Vm`
/// method and turning its `crate::error::Result` into a `base::Result`
/// via the `From<Error> for base::Error` impl (spec.md §7's 6-kind
/// taxonomy) — the one place that conversion is exercised outside the
/// subsystem crates' own unit tests.
///
/// `CreateVm`, `SetVcpuRegs`, `CreateVdev` and `DestroyVdev` have no
/// function here: this crate has no wire-to-`VmConfig` decode path for
/// `VmCreateParams` (it lacks a feature-flag/load-order/pt-device
/// encoding), no live per-vcpu register-write API, and no device-model
/// attach/detach concept at all. Wiring those needs that surface built
/// first, not just an error-conversion call site, so they are left
/// undispatched rather than faked.
pub mod handlers {
    use base::Result;

    use crate::vm::VmRegistry;

    pub fn start_vm(registry: &mut VmRegistry, vm_id: u32) -> Result<()> {
        Ok(registry.get_mut(vm_id)?.start_vm()?)
    }

    pub fn pause_vm(registry: &mut VmRegistry, vm_id: u32) -> Result<()> {
        Ok(registry.get_mut(vm_id)?.pause_vm()?)
    }

    pub fn reset_vm(registry: &mut VmRegistry, vm_id: u32) -> Result<()> {
        Ok(registry.get_mut(vm_id)?.reset_vm()?)
    }

    pub fn destroy_vm(registry: &mut VmRegistry, vm_id: u32) -> Result<()> {
        Ok(registry.destroy_vm(vm_id)?)
    }

    pub fn set_irqline(registry: &mut VmRegistry, vm_id: u32, gsi: u32, level: bool) -> Result<()> {
        Ok(registry.set_irqline(vm_id, gsi, level)?)
    }

    pub fn inject_msi(registry: &mut VmRegistry, vm_id: u32, vmsi_addr: u64, vmsi_data: u32) -> Result<()> {
        Ok(registry.inject_msi(vm_id, vmsi_addr, vmsi_data)?)
    }

    pub fn add_intx_remapping(
        registry: &VmRegistry,
        vm_id: u32,
        virt_pin: u32,
        phys_pin: u32,
        pic_pin: bool,
        vector: u8,
    ) -> Result<()> {
        Ok(registry.add_intx_remapping(vm_id, virt_pin, phys_pin, pic_pin, vector)?)
    }

    pub fn remove_intx_remapping(registry: &VmRegistry, vm_id: u32, virt_pin: u32, pic_pin: bool) -> Result<()> {
        Ok(registry.remove_intx_remapping(vm_id, virt_pin, pic_pin)?)
    }

    pub fn add_msix_remapping(
        registry: &VmRegistry,
        vm_id: u32,
        virt_bdf: u16,
        phys_bdf: u16,
        entry_nr: u16,
        vector: u8,
    ) -> Result<()> {
        Ok(registry.add_msix_remapping(vm_id, virt_bdf, phys_bdf, entry_nr, vector)?)
    }

    pub fn remove_msix_remapping(registry: &VmRegistry, vm_id: u32, virt_bdf: u16, entry_nr: u16) -> Result<()> {
        Ok(registry.remove_msix_remapping(vm_id, virt_bdf, entry_nr)?)
    }

    pub fn set_io_req_completion(
        registry: &mut VmRegistry,
        vm_id: u32,
        vcpu_id: usize,
        result: ioreq::RequestBody,
    ) -> Result<()> {
        Ok(registry.complete_io_request(vm_id, vcpu_id, result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_model::assert_size_eq;

    assert_size_eq!(VmCreateParams, 48);

    #[test]
    fn vm_create_params_round_trips_through_bytes() {
        let params = VmCreateParams {
            vmid: 1,
            vcpu_num: 2,
            reserved0: 0,
            name: *b"service_vm\0\0\0\0\0\0",
            vm_flag: 0,
            ioreq_buf: 0x1000,
            cpu_affinity: 0b11,
        };
        let bytes = params.as_slice();
        let back = VmCreateParams::from_slice(bytes).unwrap();
        assert_eq!(back.vmid, 1);
        assert_eq!(back.cpu_affinity, 0b11);
    }

    fn test_config() -> crate::config::VmConfig {
        crate::config::VmConfig {
            vm_id: 1,
            name: "test".into(),
            load_order: crate::config::LoadOrder::PostLaunched,
            features: crate::config::VmFeatureFlags::default(),
            cpu_affinity: crate::affinity::CpuMask::new(0b1),
            vcpus: vec![crate::config::VcpuConfig { vcpu_id: 0, pcpu_id: 0 }],
            pt_devices: vec![],
        }
    }

    #[test]
    fn handlers_start_vm_drives_the_registry_through_base_result() {
        let mut registry = crate::vm::VmRegistry::new(1, 0);
        let vm_id = registry.create_vm(test_config()).unwrap();
        handlers::start_vm(&mut registry, vm_id).unwrap();
        assert_eq!(registry.get(vm_id).unwrap().state, crate::vm::VmState::Running);
    }

    #[test]
    fn handlers_on_a_missing_vm_converts_to_base_error_not_found() {
        let mut registry = crate::vm::VmRegistry::new(1, 0);
        let err = handlers::start_vm(&mut registry, 99).unwrap_err();
        assert!(matches!(err, base::Error::NotFound(_)));
    }

    #[test]
    fn handlers_illegal_transition_converts_to_base_error_conflict() {
        let mut registry = crate::vm::VmRegistry::new(1, 0);
        let vm_id = registry.create_vm(test_config()).unwrap();
        handlers::start_vm(&mut registry, vm_id).unwrap();
        let err = handlers::start_vm(&mut registry, vm_id).unwrap_err();
        assert!(matches!(err, base::Error::Conflict(_)));
    }

    #[test]
    fn handlers_set_io_req_completion_publishes_through_the_registry() {
        let mut registry = crate::vm::VmRegistry::new(1, 0);
        let vm_id = registry.create_vm(test_config()).unwrap();
        struct NullUpcall;
        impl ioreq::HsmUpcall for NullUpcall {
            fn raise(&self) {}
        }
        let req = ioreq::PioRequest { address: 0xcf8, direction: ioreq::Direction::Read, size: 4, value: 0 };
        registry.handle_port_io(vm_id, 0, req, &NullUpcall).unwrap();
        registry.get_mut(vm_id).unwrap().ioreq.accept(0).unwrap();
        let result = ioreq::RequestBody::Pio(ioreq::PioRequest {
            address: 0xcf8,
            direction: ioreq::Direction::Read,
            size: 4,
            value: 0x1234,
        });
        handlers::set_io_req_completion(&mut registry, vm_id, 0, result).unwrap();
        assert!(registry.get(vm_id).unwrap().ioreq.is_complete(0).unwrap());
    }
}
