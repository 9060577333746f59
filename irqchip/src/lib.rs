// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Legacy interrupt controllers (C4): the virtual IOAPIC and the virtual
//! cascaded 8259 pair, plus the per-VM wire-mode arbitration between them
//! for GSI 0 / IRQ2.

mod error;
mod vioapic;
mod vpic;

pub use error::Error;
pub use error::Result;
pub use vioapic::DeliverRequest;
pub use vioapic::DestMode;
pub use vioapic::DeliveryMode;
pub use vioapic::EoiAck;
pub use vioapic::NullPinObserver;
pub use vioapic::PinOp;
pub use vioapic::PinRemapObserver;
pub use vioapic::Polarity;
pub use vioapic::Rte;
pub use vioapic::TriggerMode;
pub use vioapic::Vioapic;
pub use vioapic::IOAPIC_MMIO_BASE;
pub use vioapic::NUM_IOAPIC_PINS;
pub use vpic::Vpic;
pub use vpic::WireMode;
pub use vpic::NUM_PIC_PINS;

/// Owns one VM's vIOAPIC and vPIC and arbitrates GSI 0 between them. Real
/// legacy-IRQ sources (the PIT, the keyboard controller, ...) are wired to
/// both sides through [`IrqRoute`] and this decides, based on wire-mode,
/// which one actually injects.
pub struct LegacyIrqChip {
    pub ioapic: Vioapic,
    pub pic: Vpic,
}

/// Where a legacy GSI source should be delivered right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqRoute {
    /// GSI 0 while the guest hasn't unmasked the vIOAPIC: drives vLAPIC
    /// `ExtINT` directly to the BSP.
    PicExtInt,
    /// GSI 0 after the vIOAPIC side has taken over.
    Ioapic,
    /// Any GSI above 0: always the vIOAPIC (the 8259 only ever owns 16
    /// lines and GSIs other than 0 never alias onto it in this model).
    IoapicOnly,
}

impl LegacyIrqChip {
    pub fn new() -> Self {
        LegacyIrqChip {
            ioapic: Vioapic::new(0),
            pic: Vpic::new(),
        }
    }

    /// `NULL -> IOAPIC` when vIOAPIC pin 0 is unmasked while vPIC pin 0 is
    /// masked; `IOAPIC -> INTR` when vPIC pin 0 is masked-then-unmasked
    /// (spec.md §4.4). Call after any write that could flip either mask.
    pub fn observe_pin_zero_masks(&mut self, ioapic_pin0_masked: bool, pic_pin0_masked: bool) {
        if self.pic.wire_mode() == WireMode::Null && !ioapic_pin0_masked && pic_pin0_masked {
            self.pic.latch_wire_mode(WireMode::Ioapic);
        }
        if self.pic.wire_mode() == WireMode::Ioapic && !pic_pin0_masked {
            self.pic.latch_wire_mode(WireMode::Intr);
        }
        if self.pic.wire_mode() == WireMode::Null && !pic_pin0_masked {
            self.pic.latch_wire_mode(WireMode::Intr);
        }
    }

    pub fn route_for(&self, gsi: u32) -> IrqRoute {
        if gsi != 0 {
            return IrqRoute::IoapicOnly;
        }
        match self.pic.wire_mode() {
            WireMode::Ioapic => IrqRoute::Ioapic,
            _ => IrqRoute::PicExtInt,
        }
    }
}

impl Default for LegacyIrqChip {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gsi_zero_starts_on_pic_extint_path() {
        let chip = LegacyIrqChip::new();
        assert_eq!(chip.route_for(0), IrqRoute::PicExtInt);
        assert_eq!(chip.route_for(5), IrqRoute::IoapicOnly);
    }

    #[test]
    fn unmasking_ioapic_pin_zero_before_pic_switches_route() {
        let mut chip = LegacyIrqChip::new();
        chip.observe_pin_zero_masks(false, true);
        assert_eq!(chip.route_for(0), IrqRoute::Ioapic);
    }

    #[test]
    fn unmasking_pic_pin_zero_after_ioapic_switch_hands_back_to_intr() {
        let mut chip = LegacyIrqChip::new();
        chip.observe_pin_zero_masks(false, true);
        assert_eq!(chip.route_for(0), IrqRoute::Ioapic);
        chip.observe_pin_zero_masks(false, false);
        assert_eq!(chip.route_for(0), IrqRoute::PicExtInt);
    }
}
