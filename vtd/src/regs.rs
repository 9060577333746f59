// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The DMAR unit's MMIO register file: offsets, the capability/extended-
//! capability bitslices, and the backend seam (`DmarRegs`/`RealDmarRegs`/
//! `TestDmarRegs`) that mirrors `vmx::backend`'s split between the real
//! instruction stream and an in-memory double.

pub const REG_VER: u32 = 0x00;
pub const REG_CAP: u32 = 0x08;
pub const REG_ECAP: u32 = 0x10;
pub const REG_GCMD: u32 = 0x18;
pub const REG_GSTS: u32 = 0x1c;
pub const REG_RTADDR: u32 = 0x20;
pub const REG_CCMD: u32 = 0x28;
pub const REG_FSTS: u32 = 0x34;
pub const REG_FECTL: u32 = 0x38;
pub const REG_FEDATA: u32 = 0x3c;
pub const REG_FEADDR: u32 = 0x40;

pub const GCMD_SRTP: u32 = 1 << 30;
pub const GCMD_TE: u32 = 1 << 31;
pub const GCMD_WBF: u32 = 1 << 27;
pub const GSTS_RTPS: u32 = 1 << 30;
pub const GSTS_TES: u32 = 1 << 31;
pub const GSTS_WBFS: u32 = 1 << 27;

pub const CCMD_ICC: u64 = 1 << 63;
pub const CCMD_GLOBAL_INVL: u64 = 0x1 << 61;
pub const FECTL_IM: u32 = 1 << 30;

/// `cap_msagaw`: highest adjusted-guest-address-width the unit's SAGAW
/// bitmap supports, spec.md §4.6's "maximum supported adjusted guest
/// address width".
pub fn cap_msagaw(cap: u64) -> u8 {
    let sagaw = ((cap >> 8) & 0x1f) as u8;
    for i in (0..5).rev() {
        if sagaw & (1 << i) != 0 {
            return i;
        }
    }
    0
}

pub fn cap_ndoms(cap: u64) -> u32 {
    1 << (4 + (cap & 0x7))
}

pub fn cap_rwbf(cap: u64) -> bool {
    cap & (1 << 4) != 0
}

pub fn ecap_pt(ecap: u64) -> bool {
    ecap & (1 << 6) != 0
}

/// `width_to_agaw`: guest address width in bits -> AGAW encoding (levels
/// past the mandatory 2, 9 bits each starting at bit 12).
pub fn width_to_agaw(width: u32) -> u8 {
    let level = ((width.saturating_sub(12)) + 9 - 1) / 9;
    (level.saturating_sub(2)) as u8
}

/// One pCPU's view of a DMAR unit's MMIO register file. Never holds the
/// 64-bit split across two 32-bit halves implicit the way the original
/// macro-based `iommu_read64`/`iommu_write64` did — call sites use
/// `read64`/`write64` directly.
pub trait DmarRegs: Send {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&mut self, offset: u32, value: u32);
    fn read64(&self, offset: u32) -> u64;
    fn write64(&mut self, offset: u32, value: u64);
}

/// Real hardware backend: volatile MMIO through the unit's register base.
/// `unsafe` because `base_addr` must be a valid, mapped DMAR register
/// window — an invariant owned by whatever discovered it from ACPI DMAR
/// tables, not by this type.
pub struct RealDmarRegs {
    base_addr: *mut u8,
}

// The DMAR register window is a fixed hardware MMIO range; concurrent
// access across pCPUs is already serialized by each `DmarUnit`'s own lock.
unsafe impl Send for RealDmarRegs {}

impl RealDmarRegs {
    /// # Safety
    /// `base_addr` must point at a live, mapped DMAR register window for
    /// the lifetime of this value.
    pub unsafe fn new(base_addr: u64) -> Self {
        RealDmarRegs {
            base_addr: base_addr as *mut u8,
        }
    }
}

impl DmarRegs for RealDmarRegs {
    fn read32(&self, offset: u32) -> u32 {
        unsafe { std::ptr::read_volatile(self.base_addr.add(offset as usize) as *const u32) }
    }

    fn write32(&mut self, offset: u32, value: u32) {
        unsafe { std::ptr::write_volatile(self.base_addr.add(offset as usize) as *mut u32, value) }
    }

    fn read64(&self, offset: u32) -> u64 {
        let lo = self.read32(offset) as u64;
        let hi = self.read32(offset + 4) as u64;
        (hi << 32) | lo
    }

    fn write64(&mut self, offset: u32, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

/// In-memory stand-in used by every vtd test: a flat register file plus
/// whatever completion condition the caller pre-seeds, since a fixed
/// hardware-style poll loop has nothing to converge against otherwise.
#[derive(Default)]
pub struct TestDmarRegs {
    regs: std::collections::HashMap<u32, u32>,
}

impl TestDmarRegs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preset32(&mut self, offset: u32, value: u32) {
        self.regs.insert(offset, value);
    }

    pub fn preset64(&mut self, offset: u32, value: u64) {
        self.regs.insert(offset, value as u32);
        self.regs.insert(offset + 4, (value >> 32) as u32);
    }
}

impl DmarRegs for TestDmarRegs {
    fn read32(&self, offset: u32) -> u32 {
        *self.regs.get(&offset).unwrap_or(&0)
    }

    fn write32(&mut self, offset: u32, value: u32) {
        self.regs.insert(offset, value);
        // Every status-echoing command this crate issues is modeled as
        // completing immediately, since there's no real hardware latency
        // to simulate in a unit test.
        match offset {
            REG_GCMD => {
                let mut gsts = self.read32(REG_GSTS);
                if value & GCMD_SRTP != 0 {
                    gsts |= GSTS_RTPS;
                }
                gsts = if value & GCMD_TE != 0 {
                    gsts | GSTS_TES
                } else {
                    gsts & !GSTS_TES
                };
                if value & GCMD_WBF != 0 {
                    gsts |= GSTS_WBFS;
                }
                self.regs.insert(REG_GSTS, gsts);
            }
            REG_CCMD => {
                // Clear the in-progress bit (upper dword) immediately.
                self.regs.insert(REG_CCMD + 4, 0);
            }
            _ => {}
        }
    }

    fn read64(&self, offset: u32) -> u64 {
        let lo = self.read32(offset) as u64;
        let hi = self.read32(offset + 4) as u64;
        (hi << 32) | lo
    }

    fn write64(&mut self, offset: u32, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_msagaw_picks_highest_set_sagaw_bit() {
        // SAGAW bits 1 and 2 set (3-level and 4-level paging supported).
        let cap = 0b0000_0110 << 8;
        assert_eq!(cap_msagaw(cap), 2);
    }

    #[test]
    fn width_to_agaw_matches_4_level_paging() {
        assert_eq!(width_to_agaw(48), 2);
        assert_eq!(width_to_agaw(39), 1);
    }

    #[test]
    fn test_regs_echoes_root_table_pointer_set() {
        let mut regs = TestDmarRegs::new();
        regs.write32(REG_GCMD, GCMD_SRTP);
        assert_eq!(regs.read32(REG_GSTS) & GSTS_RTPS, GSTS_RTPS);
    }
}
