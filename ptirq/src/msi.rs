// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MSI address/data decoding and the Remappable/Compatibility Format
//! rewrite `ptirq_build_physical_msi` performs. No header in this corpus
//! gives the exact Remappable-Format bit placement (`dmar_ir_entry`'s
//! address-side encoding lives in a header `original_source` doesn't carry),
//! so [`RemapAddress`] is this crate's own reasonable layout: interrupt
//! format flag, the shorthand-validity bit, and a 15-bit handle wide
//! enough to index the full IRTE table. The Compatibility Format side and
//! the guest-facing decode match the wire format exactly (SDM 10.11).

use bit_field::bitfield;

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Fixed = 0b000,
    LowestPriority = 0b001,
    Smi = 0b010,
    Reserved = 0b011,
    Nmi = 0b100,
    Init = 0b101,
    Reserved2 = 0b110,
    ExtInt = 0b111,
}

impl DeliveryMode {
    /// `ptirq_build_physical_msi`/`ptirq_build_physical_rte` both reject
    /// every guest-requested delivery mode but Fixed and Lowest-Priority,
    /// substituting Lowest-Priority for anything else.
    pub fn normalize(self) -> DeliveryMode {
        match self {
            DeliveryMode::Fixed => DeliveryMode::Fixed,
            _ => DeliveryMode::LowestPriority,
        }
    }
}

/// Guest- or physical-facing MSI address, Compatibility Format (SDM
/// "Message Address Register for Pentium 4 and Intel Xeon processors").
#[bitfield]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct MsiAddress {
    reserved: bit_field::BitField2,
    pub dest_mode_logical: bool,
    pub redirection_hint: bool,
    reserved2: bit_field::BitField8,
    pub dest_field: bit_field::BitField8,
    pub constant: bit_field::BitField12,
}

/// Guest- or physical-facing MSI data register.
#[bitfield]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct MsiData {
    pub vector: bit_field::BitField8,
    #[bits = 3]
    pub delivery_mode: DeliveryMode,
    reserved: bit_field::BitField3,
    pub level: bool,
    pub trigger_level: bool,
    reserved2: bit_field::BitField16,
}

/// Remappable-Format MSI address: this crate's own bit placement (see
/// module doc), wide enough to carry any index into a 4096-entry IRTE
/// table.
#[bitfield]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct RemapAddress {
    pub interrupt_format: bool,
    pub shv: bool,
    pub handle: bit_field::BitField15,
    reserved: bit_field::BitField3,
    pub constant: bit_field::BitField12,
}

pub const MSI_ADDRESS_CONSTANT: u32 = 0xfee;

/// One MSI/MSI-X vector's guest-programmed and physical-rewritten
/// address/data pair (`struct ptirq_msi_info`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsiInfo {
    pub vmsi_addr: u64,
    pub vmsi_data: u32,
    pub pmsi_addr: u64,
    pub pmsi_data: u32,
}

impl MsiInfo {
    pub fn guest_address(&self) -> MsiAddress {
        MsiAddress::from_bits(self.vmsi_addr as u32)
    }

    pub fn guest_data(&self) -> MsiData {
        MsiData::from_bits(self.vmsi_data)
    }

    /// Programs the Remappable-Format rewrite: `pmsi_data` is zeroed (the
    /// vector and delivery mode now live in the IRTE itself) and
    /// `pmsi_addr` carries the IRTE index.
    pub fn set_remappable(&mut self, irte_index: u16) {
        let mut addr = RemapAddress::new();
        addr.set_interrupt_format(true);
        addr.set_shv(false);
        addr.set_handle(irte_index as u64);
        addr.set_constant(MSI_ADDRESS_CONSTANT as u64);
        self.pmsi_addr = addr.into_bits() as u64;
        self.pmsi_data = 0;
    }

    /// Programs the Compatibility-Format rewrite when no IRTE is
    /// available: `dest_mask` and `delmode`/`vector` are baked directly
    /// into the physical address/data pair.
    pub fn set_compatibility(&mut self, dest_mask: u8, delivery_mode: DeliveryMode, vector: u8) {
        let mut addr = MsiAddress::from_bits(self.vmsi_addr as u32);
        addr.set_dest_field(dest_mask as u64);
        addr.set_redirection_hint(true);
        addr.set_dest_mode_logical(true);
        addr.set_constant(MSI_ADDRESS_CONSTANT as u64);
        self.pmsi_addr = addr.into_bits() as u64;

        let mut data = MsiData::new();
        data.set_delivery_mode(delivery_mode);
        data.set_vector(vector);
        self.pmsi_data = data.into_bits();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remappable_rewrite_carries_the_irte_index_and_zeroes_data() {
        let mut info = MsiInfo {
            vmsi_addr: 0xfee0_0000,
            vmsi_data: 0x4041,
            ..Default::default()
        };
        info.set_remappable(7);
        assert_eq!(info.pmsi_data, 0);
        let addr = RemapAddress::from_bits(info.pmsi_addr as u32);
        assert!(addr.get_interrupt_format());
        assert_eq!(addr.get_handle(), 7);
    }

    #[test]
    fn compatibility_rewrite_normalizes_delivery_mode_and_vector() {
        let mut info = MsiInfo {
            vmsi_addr: 0xfee0_0000,
            vmsi_data: 0x4041,
            ..Default::default()
        };
        info.set_compatibility(0x02, DeliveryMode::LowestPriority, 0x40);
        let data = MsiData::from_bits(info.pmsi_data);
        assert_eq!(data.get_delivery_mode(), DeliveryMode::LowestPriority);
        assert_eq!(data.get_vector(), 0x40);
    }
}
