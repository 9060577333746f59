// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-reported VMX capabilities (SDM Vol. 3C §A.7-A.8, §24.8). Read once
//! at pCPU bring-up and handed to `vmcs::init_vmcs` rather than re-read on
//! every VM creation; the physical MSR reads themselves are `hvcore`'s
//! job (bring-up order and which pCPU is "first" are out of this crate's
//! scope), so this module only defines the shape and the bit contract
//! `init_vmcs` builds control fields from.

/// `IA32_VMX_CR0_FIXED0`/`FIXED1` and `IA32_VMX_CR4_FIXED0`/`FIXED1`: bits
/// that must be 1 (`fixed0`, read as "bit set in fixed0 means bit must be
/// 1") or must be 0 (bits clear in `fixed1` must be 0) in the guest's CR0/
/// CR4 for VM-entry to succeed.
#[derive(Debug, Clone, Copy)]
pub struct HostCaps {
    pub vmx_basic_revision_id: u32,
    pub cr0_fixed0: u64,
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
    pub ept_supported: bool,
    pub vpid_supported: bool,
    pub unrestricted_guest_supported: bool,
    pub apicv_register_virt_supported: bool,
    pub apicv_virtual_interrupt_delivery_supported: bool,
    pub posted_interrupt_supported: bool,
    pub rdtscp_supported: bool,
    pub tsc_offsetting_supported: bool,
    /// `get_ibrs_type() == IBRS_RAW`: the host wants an explicit
    /// `IA32_PRED_CMD`/`PRED_SET_IBPB` write on every first VM-entry after
    /// a VMCS switch, rather than relying on IBRS/STIBP alone (spec.md
    /// §4.2, "issue IBPB (if IBRS mitigation selected)").
    pub ibrs_raw_mitigation: bool,
}

impl HostCaps {
    /// Computes the CR0/CR4 bits the hypervisor must always trap writes to
    /// regardless of what the guest requests, per spec.md §4.1: paging,
    /// write-protect, cache-disable/not-write-through on CR0; VMXE, SMXE,
    /// PCIDE and the reserved bits on CR4.
    pub fn cr0_host_owned_mask(&self) -> u64 {
        const CR0_PE: u64 = 1 << 0;
        const CR0_CD: u64 = 1 << 30;
        const CR0_NW: u64 = 1 << 29;
        const CR0_WP: u64 = 1 << 16;
        const CR0_PG: u64 = 1 << 31;
        let always_trapped = CR0_PE | CR0_WP | CR0_CD | CR0_NW | CR0_PG;
        // Bits the hardware itself pins (fixed0 set or fixed1 clear) are
        // host-owned too: the guest can never legally change them.
        let hardware_fixed = self.cr0_fixed0 | !self.cr0_fixed1;
        always_trapped | hardware_fixed
    }

    pub fn cr4_host_owned_mask(&self) -> u64 {
        const CR4_VMXE: u64 = 1 << 13;
        const CR4_SMXE: u64 = 1 << 14;
        const CR4_PCIDE: u64 = 1 << 17;
        let always_trapped = CR4_VMXE | CR4_SMXE | CR4_PCIDE;
        let hardware_fixed = self.cr4_fixed0 | !self.cr4_fixed1;
        always_trapped | hardware_fixed
    }

    /// A fixed test double with EPT/VPID/unrestricted-guest/APICv all
    /// supported and no extra fixed bits beyond the architectural minimum
    /// (`CR0.PE`/`CR0.NE` fixed to 1, `CR4` fully guest-controllable).
    #[cfg(test)]
    pub fn test_default() -> Self {
        HostCaps {
            vmx_basic_revision_id: 1,
            cr0_fixed0: (1 << 0) | (1 << 5),
            cr0_fixed1: u64::MAX,
            cr4_fixed0: 1 << 13,
            cr4_fixed1: u64::MAX,
            ept_supported: true,
            vpid_supported: true,
            unrestricted_guest_supported: true,
            apicv_register_virt_supported: true,
            apicv_virtual_interrupt_delivery_supported: true,
            posted_interrupt_supported: true,
            rdtscp_supported: true,
            tsc_offsetting_supported: true,
            ibrs_raw_mitigation: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_owned_mask_always_includes_paging_bits() {
        let caps = HostCaps::test_default();
        let mask = caps.cr0_host_owned_mask();
        assert_ne!(mask & (1 << 31), 0, "CR0.PG must be host-owned");
        assert_ne!(mask & (1 << 16), 0, "CR0.WP must be host-owned");
    }

    #[test]
    fn host_owned_mask_includes_vmxe() {
        let caps = HostCaps::test_default();
        assert_ne!(caps.cr4_host_owned_mask() & (1 << 13), 0);
    }
}
