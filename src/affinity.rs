// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! pCPU affinity masks and the virtual-to-physical destination mapping
//! ptirq's MSI/INTx remapping needs (`vcpumask2pcpumask`, spec.md §4.5).

use serde::Deserialize;

use ptirq::PhysicalDestResolver;
use vlapic::DestinationMode;
use vlapic::VlapicComplex;

/// A bitmask over pCPU (or, before remapping, vCPU) ids. `Deserialize`s
/// straight from an integer, the donor workspace's own `cpu_affinity`
/// wire shape (SPEC_FULL §2's `acrn_vm_creation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct CpuMask(u64);

impl CpuMask {
    pub fn new(bits: u64) -> Self {
        CpuMask(bits)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn contains(&self, cpu: u32) -> bool {
        cpu < 64 && (self.0 & (1u64 << cpu)) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..64u32).filter(move |&cpu| self.contains(cpu))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The BSP pCPU: the least-significant set bit of the affinity mask
    /// (spec.md §4.10).
    pub fn bsp_pcpu(&self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros())
        }
    }
}

/// Maps each of this VM's vCPU indices to the pCPU it's statically pinned
/// to (spec.md §3's "each vCPU is mapped to exactly one pCPU ... and
/// never migrates"), built once at `create_vm` time from the per-vCPU
/// config.
#[derive(Debug, Clone, Default)]
pub struct VcpuPcpuMap {
    pcpu_of_vcpu: Vec<u32>,
}

impl VcpuPcpuMap {
    pub fn new(pcpu_of_vcpu: Vec<u32>) -> Self {
        VcpuPcpuMap { pcpu_of_vcpu }
    }

    pub fn pcpu_for(&self, vcpu_id: usize) -> Option<u32> {
        self.pcpu_of_vcpu.get(vcpu_id).copied()
    }

    /// `vcpumask2pcpumask`: rewrites a guest-relative vCPU-index bitmask
    /// into the pCPU mask those vCPUs are actually pinned to.
    pub fn vcpumask2pcpumask(&self, vcpu_mask: u64) -> CpuMask {
        let mut pcpu_bits = 0u64;
        for (vcpu_id, &pcpu) in self.pcpu_of_vcpu.iter().enumerate() {
            if vcpu_id < 64 && vcpu_mask & (1u64 << vcpu_id) != 0 && pcpu < 64 {
                pcpu_bits |= 1u64 << pcpu;
            }
        }
        CpuMask::new(pcpu_bits)
    }
}

/// Composes `vlapic_calc_dest` (owned by `vlapic::VlapicComplex`) with
/// [`VcpuPcpuMap::vcpumask2pcpumask`] — the concrete
/// [`PhysicalDestResolver`] `ptirq::PtirqManager::ptirq_msix_remap` asks
/// for (spec.md §4.5).
pub struct VmDestResolver<'a> {
    pub vlapics: &'a VlapicComplex,
    pub pcpu_map: &'a VcpuPcpuMap,
}

impl<'a> PhysicalDestResolver for VmDestResolver<'a> {
    fn resolve(&self, dest: u32, logical: bool) -> Vec<u32> {
        let dest_mode = if logical { DestinationMode::Logical } else { DestinationMode::Physical };
        let vcpu_mask: u64 =
            self.vlapics.calc_dest_mask(dest, dest_mode).into_iter().filter(|&idx| idx < 64).map(|idx| 1u64 << idx).sum();
        self.pcpu_map.vcpumask2pcpumask(vcpu_mask).iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bsp_pcpu_is_the_least_significant_affinity_bit() {
        let mask = CpuMask::new(0b1100);
        assert_eq!(mask.bsp_pcpu(), Some(2));
    }

    #[test]
    fn empty_affinity_has_no_bsp() {
        assert_eq!(CpuMask::new(0).bsp_pcpu(), None);
    }

    #[test]
    fn vcpumask2pcpumask_rewrites_through_the_pinning_table() {
        let map = VcpuPcpuMap::new(vec![3, 5, 7]);
        let pcpus = map.vcpumask2pcpumask(0b011);
        assert_eq!(pcpus.as_u64(), (1 << 3) | (1 << 5));
    }

    #[test]
    fn cpu_mask_deserializes_from_a_bare_integer() {
        let mask: CpuMask = serde_json::from_str("7").unwrap();
        assert_eq!(mask.as_u64(), 7);
    }
}
