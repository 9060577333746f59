// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! IOMMU domains: the (EPT pointer, address-width) pair a set of assigned
//! devices translates through, plus the shared domain-id bitmap. Domain
//! id 0 is reserved the way the original reserves it (bit 0 of the
//! bitmap is never cleared), so the first domain anyone allocates is id 1.

use crate::error::Error;
use crate::error::Result;

const MAX_DOMAIN_ID: u16 = 63;

/// One VM's (or the host's) IOMMU translation context. `trans_table_phys`
/// is the VM's EPT root — this crate reuses it as the second-level paging
/// structure rather than maintaining a separate IOMMU page table, the
/// same "is_tt_ept" choice the original makes unconditionally.
pub struct IommuDomain {
    pub dom_id: u16,
    pub vm_id: i32,
    pub is_host: bool,
    pub addr_width: u32,
    pub trans_table_phys: u64,
}

/// Allocates domain ids out of a 64-bit bitmap (bit 0 permanently taken).
pub struct DomainIdAllocator {
    bitmap: u64,
}

impl DomainIdAllocator {
    pub fn new() -> Self {
        DomainIdAllocator { bitmap: 1 }
    }

    pub fn alloc(&mut self) -> Result<u16> {
        for id in 1..=MAX_DOMAIN_ID {
            if self.bitmap & (1 << id) == 0 {
                self.bitmap |= 1 << id;
                return Ok(id);
            }
        }
        Err(Error::DomainIdsExhausted)
    }

    pub fn free(&mut self, id: u16) {
        if id != 0 {
            self.bitmap &= !(1 << id);
        }
    }
}

impl Default for DomainIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_zero_is_never_handed_out() {
        let mut alloc = DomainIdAllocator::new();
        assert_ne!(alloc.alloc().unwrap(), 0);
    }

    #[test]
    fn freed_ids_are_reused() {
        let mut alloc = DomainIdAllocator::new();
        let id = alloc.alloc().unwrap();
        alloc.free(id);
        assert_eq!(alloc.alloc().unwrap(), id);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut alloc = DomainIdAllocator::new();
        for _ in 1..=MAX_DOMAIN_ID {
            alloc.alloc().unwrap();
        }
        assert_eq!(alloc.alloc(), Err(Error::DomainIdsExhausted));
    }
}
