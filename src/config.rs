// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Plain serde-`Deserialize` shapes an external loader hands this crate —
//! config loading itself is out of scope (spec.md §1), but the shapes
//! that carry a parsed configuration across the trait boundary are part
//! of this crate, the donor workspace's `serde_keyvalue`/`serde_json`
//! convention for its own VM configuration (SPEC_FULL §1.3).

use serde::Deserialize;

use crate::affinity::CpuMask;

/// Where in boot order a VM falls: the privileged Service VM with direct
/// device-model responsibilities, a VM started by the hypervisor itself
/// before the Service VM, or one started later at the Service VM's
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOrder {
    ServiceVm,
    PreLaunched,
    PostLaunched,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct VmFeatureFlags {
    #[serde(default)]
    pub lapic_passthrough: bool,
    #[serde(default)]
    pub real_time: bool,
    #[serde(default)]
    pub vcat: bool,
    #[serde(default)]
    pub hide_mtrr: bool,
    #[serde(default)]
    pub secure_world: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VcpuConfig {
    /// vCPU index within the VM; index 0 is always the BSP.
    pub vcpu_id: usize,
    /// The single pCPU this vCPU is statically pinned to (spec.md §5).
    pub pcpu_id: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PtDevConfig {
    pub phys_bdf: u16,
    pub virt_bdf: u16,
    #[serde(default)]
    pub intx: Option<PtIntxConfig>,
    #[serde(default)]
    pub num_msix_entries: u16,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PtIntxConfig {
    pub phys_pin: u32,
    pub virt_pin: u32,
    pub pic_pin: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    pub vm_id: u32,
    pub name: String,
    pub load_order: LoadOrder,
    #[serde(default)]
    pub features: VmFeatureFlags,
    pub cpu_affinity: CpuMask,
    pub vcpus: Vec<VcpuConfig>,
    #[serde(default)]
    pub pt_devices: Vec<PtDevConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_config_deserializes_from_json() {
        let json = r#"{
            "vm_id": 1,
            "name": "service_vm",
            "load_order": "service_vm",
            "features": { "lapic_passthrough": true },
            "cpu_affinity": 3,
            "vcpus": [ { "vcpu_id": 0, "pcpu_id": 0 }, { "vcpu_id": 1, "pcpu_id": 1 } ],
            "pt_devices": []
        }"#;
        let config: VmConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.vm_id, 1);
        assert_eq!(config.load_order, LoadOrder::ServiceVm);
        assert!(config.features.lapic_passthrough);
        assert_eq!(config.cpu_affinity.as_u64(), 3);
        assert_eq!(config.vcpus.len(), 2);
    }
}
