// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CPUID leaf emulation (C8's CPUID half). A vCPU's CPUID exit is handled
//! by binary-searching a closed table of leaves this hypervisor virtualizes
//! outright, falling through to the physical CPUID result (filtered by the
//! VM's feature mask) for everything else — the same "closed enum with a
//! physical-CPUID fallthrough" shape the donor workspace's own `CpuId`
//! snapshot/restore machinery uses for feature masking.

use enumn::N;

/// One CPUID result: EAX/EBX/ECX/EDX as the guest should see them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Leaves 0x4000_0000-0x4000_0010, the hypervisor's own vendor leaves.
/// Every hypervisor that implements this interface returns the same
/// signature and leaf layout regardless of vendor, so guests can probe for
/// "am I virtualized" without caring which hypervisor answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum HypervisorLeaf {
    VendorSignature = 0x4000_0000,
    FeatureInformation = 0x4000_0001,
    TscFrequency = 0x4000_0010,
}

const HYPERVISOR_SIGNATURE: &[u8; 12] = b"HVCOREHVCORE";
const MAX_HYPERVISOR_LEAF: u32 = 0x4000_0010;

/// Bit 0 of leaf 0x4000_0001.EAX: this vCPU belongs to the privileged
/// (service) VM and may use the hypercall surface that ordinary guests
/// cannot.
const FEATURE_PRIVILEGED_VM: u32 = 1 << 0;

/// Per-VM configuration the emulated leaves read from, kept deliberately
/// small: everything else is either a closed architectural constant or
/// comes from the physical CPUID fallthrough.
#[derive(Debug, Clone, Copy)]
pub struct CpuidConfig {
    pub privileged_vm: bool,
    pub tsc_frequency_khz: u32,
}

fn signature_result(signature: &[u8; 12]) -> CpuidResult {
    CpuidResult {
        eax: MAX_HYPERVISOR_LEAF,
        ebx: u32::from_le_bytes(signature[0..4].try_into().unwrap()),
        ecx: u32::from_le_bytes(signature[4..8].try_into().unwrap()),
        edx: u32::from_le_bytes(signature[8..12].try_into().unwrap()),
    }
}

/// Emulates `leaf`/`subleaf`, falling back to `physical` (a closure
/// invoking the real `CPUID` instruction, supplied by the caller so this
/// module stays host-independent and testable) for anything this
/// hypervisor doesn't claim.
pub fn emulate_cpuid(
    config: &CpuidConfig,
    leaf: u32,
    _subleaf: u32,
    physical: impl FnOnce(u32, u32) -> CpuidResult,
) -> CpuidResult {
    match HypervisorLeaf::n(leaf) {
        Some(HypervisorLeaf::VendorSignature) => signature_result(HYPERVISOR_SIGNATURE),
        Some(HypervisorLeaf::FeatureInformation) => {
            let eax = if config.privileged_vm { FEATURE_PRIVILEGED_VM } else { 0 };
            CpuidResult { eax, ebx: 0, ecx: 0, edx: 0 }
        }
        Some(HypervisorLeaf::TscFrequency) => CpuidResult {
            eax: config.tsc_frequency_khz,
            ebx: 0,
            ecx: 0,
            edx: 0,
        },
        None if (0x4000_0000..=0x4000_0010).contains(&leaf) => CpuidResult::default(),
        None => physical(leaf, _subleaf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CpuidConfig {
        CpuidConfig {
            privileged_vm: false,
            tsc_frequency_khz: 1_900_000,
        }
    }

    #[test]
    fn vendor_signature_leaf_reports_max_leaf_and_signature() {
        let result = emulate_cpuid(&config(), 0x4000_0000, 0, |_, _| unreachable!());
        assert_eq!(result.eax, 0x4000_0010);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&result.ebx.to_le_bytes());
        bytes.extend_from_slice(&result.ecx.to_le_bytes());
        bytes.extend_from_slice(&result.edx.to_le_bytes());
        assert_eq!(&bytes, HYPERVISOR_SIGNATURE);
    }

    #[test]
    fn feature_leaf_reports_privileged_vm_bit() {
        let mut cfg = config();
        cfg.privileged_vm = true;
        let result = emulate_cpuid(&cfg, 0x4000_0001, 0, |_, _| unreachable!());
        assert_eq!(result.eax & FEATURE_PRIVILEGED_VM, FEATURE_PRIVILEGED_VM);

        cfg.privileged_vm = false;
        let result = emulate_cpuid(&cfg, 0x4000_0001, 0, |_, _| unreachable!());
        assert_eq!(result.eax & FEATURE_PRIVILEGED_VM, 0);
    }

    #[test]
    fn tsc_frequency_leaf_reports_khz() {
        let result = emulate_cpuid(&config(), 0x4000_0010, 0, |_, _| unreachable!());
        assert_eq!(result.eax, 1_900_000);
    }

    #[test]
    fn reserved_hypervisor_leaves_return_zero_not_physical() {
        let result = emulate_cpuid(&config(), 0x4000_0005, 0, |_, _| unreachable!());
        assert_eq!(result, CpuidResult::default());
    }

    #[test]
    fn ordinary_leaves_fall_through_to_physical_cpuid() {
        let result = emulate_cpuid(&config(), 0x0000_0001, 0, |leaf, _| {
            assert_eq!(leaf, 1);
            CpuidResult { eax: 0x1234, ebx: 0, ecx: 0, edx: 0 }
        });
        assert_eq!(result.eax, 0x1234);
    }
}
