// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The virtual IOAPIC (C4 half): 48 redirection table entries, the
//! `IOREGSEL`/`IOWIN` indirect-access pair, and the mask/unmask and pin
//! edge/level semantics spec.md §4.4 defines. Destination fan-out
//! ("deliver this vector to these vCPUs") is left to the caller — this
//! crate doesn't depend on `vlapic`, so every method that would trigger
//! delivery instead returns a [`DeliverRequest`] for `hvcore` to route.

use bit_field::bitfield;

use crate::error::Error;
use crate::error::Result;

pub const NUM_IOAPIC_PINS: usize = 48;
pub const IOAPIC_MMIO_BASE: u64 = 0xfec0_0000;
const REG_IOREGSEL: u64 = 0x00;
const REG_IOWIN: u64 = 0x10;

const IDX_ID: u32 = 0x00;
const IDX_VER: u32 = 0x01;
const IDX_ARB: u32 = 0x02;
const IDX_RTE_BASE: u32 = 0x10;

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

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestMode {
    Physical = 0,
    Logical = 1,
}

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    ActiveHigh = 0,
    ActiveLow = 1,
}

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Edge = 0,
    Level = 1,
}

/// One 64-bit redirection table entry, SDM-compatible layout (matches the
/// donor workspace's `IoapicRedirectionTableEntry`, here sized to this
/// spec's 48-pin vIOAPIC rather than crosvm's 120).
#[bitfield]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Rte {
    pub vector: bit_field::BitField8,
    #[bits = 3]
    pub delivery_mode: DeliveryMode,
    #[bits = 1]
    pub dest_mode: DestMode,
    pub delivery_status: bool,
    #[bits = 1]
    pub polarity: Polarity,
    pub remote_irr: bool,
    #[bits = 1]
    pub trigger_mode: TriggerMode,
    pub interrupt_mask: bool,
    reserved: bit_field::BitField39,
    pub dest_id: bit_field::BitField8,
}

/// A pin-state change request: one of the four primitives spec.md §4.4's
/// `set_irqline_nolock` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOp {
    SetHigh,
    SetLow,
    RaisingPulse,
    FallingPulse,
}

/// A vector ready for `hvcore` to hand to `vlapic::VlapicComplex::receive_intr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverRequest {
    pub dest: u32,
    pub dest_mode: DestMode,
    pub delivery_mode: DeliveryMode,
    pub vector: u8,
    pub level_triggered: bool,
}

/// A pin whose Remote-IRR cleared on guest EOI: the ptirq remapper (C5)
/// must `GSI_UNMASK` the corresponding physical IRQ (spec.md §8 property 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EoiAck {
    pub pin: usize,
    pub redeliver: Option<DeliverRequest>,
}

/// Called on every RTE mask<->unmask transition, spec.md §4.4's
/// "informs the ptirq remapper (`ptirq_intx_pin_remap`)". Implemented by
/// `ptirq` and threaded in explicitly by `hvcore` rather than held behind
/// a global singleton (spec.md §9's re-architecture guidance).
pub trait PinRemapObserver {
    fn on_pin_mask_transition(&mut self, gsi: u32, masked: bool);
}

/// A no-op observer for callers (and tests) that don't care about pin
/// remap notifications.
pub struct NullPinObserver;

impl PinRemapObserver for NullPinObserver {
    fn on_pin_mask_transition(&mut self, _gsi: u32, _masked: bool) {}
}

/// One vIOAPIC unit. A VM may have more than one (spec.md §3); `gsi_base`
/// is the first global system interrupt number this unit owns, so a
/// multi-unit VM's units tile a contiguous GSI space.
pub struct Vioapic {
    gsi_base: u32,
    id: u8,
    ioregsel: u32,
    rtes: [Rte; NUM_IOAPIC_PINS],
    pin_state: [bool; NUM_IOAPIC_PINS],
}

impl Vioapic {
    pub fn new(gsi_base: u32) -> Self {
        Vioapic {
            gsi_base,
            id: 0,
            ioregsel: 0,
            rtes: [Rte::from_bits(1 << 16); NUM_IOAPIC_PINS], // power-on: every RTE masked.
            pin_state: [false; NUM_IOAPIC_PINS],
        }
    }

    pub fn gsi_base(&self) -> u32 {
        self.gsi_base
    }

    pub fn num_pins(&self) -> usize {
        NUM_IOAPIC_PINS
    }

    pub fn rte(&self, pin: usize) -> Result<Rte> {
        self.rtes.get(pin).copied().ok_or(Error::NoSuchRte(pin as u32))
    }

    fn indirect_read(&self) -> u32 {
        match self.ioregsel {
            IDX_ID => (self.id as u32) << 24,
            IDX_VER => 0x11 | (((NUM_IOAPIC_PINS - 1) as u32) << 16),
            IDX_ARB => (self.id as u32) << 24,
            sel if sel >= IDX_RTE_BASE => {
                let pin = ((sel - IDX_RTE_BASE) / 2) as usize;
                if pin >= NUM_IOAPIC_PINS {
                    return 0;
                }
                let bits = self.rtes[pin].into_bits();
                if (sel - IDX_RTE_BASE) % 2 == 0 {
                    bits as u32
                } else {
                    (bits >> 32) as u32
                }
            }
            _ => 0,
        }
    }

    /// Writes an indirect register. RTE writes preserve Remote-IRR and
    /// Delivery-Status (read-only per spec.md §4.4); a mask->unmask
    /// transition whose pin is still asserted at its programmed polarity,
    /// with Remote-IRR clear, delivers immediately. Every mask<->unmask
    /// transition is reported to `observer`.
    fn indirect_write(
        &mut self,
        value: u32,
        observer: &mut dyn PinRemapObserver,
    ) -> Result<Option<DeliverRequest>> {
        match self.ioregsel {
            IDX_ID => {
                self.id = (value >> 24) as u8;
                Ok(None)
            }
            IDX_VER | IDX_ARB => Ok(None),
            sel if sel >= IDX_RTE_BASE => {
                let pin = ((sel - IDX_RTE_BASE) / 2) as usize;
                if pin >= NUM_IOAPIC_PINS {
                    return Err(Error::NoSuchPin(pin as u32, NUM_IOAPIC_PINS));
                }
                let old = self.rtes[pin];
                let low_half = (sel - IDX_RTE_BASE) % 2 == 0;
                let mut bits = old.into_bits();
                if low_half {
                    bits = (bits & !0xffff_ffff) | value as u64;
                } else {
                    bits = (bits & 0xffff_ffff) | ((value as u64) << 32);
                }
                let mut new = Rte::from_bits(bits);
                // Remote-IRR and Delivery-Status are read-only to software.
                new.set_remote_irr(old.get_remote_irr());
                new.set_delivery_status(old.get_delivery_status());
                self.rtes[pin] = new;

                if old.get_interrupt_mask() != new.get_interrupt_mask() {
                    observer.on_pin_mask_transition(self.gsi_base + pin as u32, new.get_interrupt_mask());
                }

                if old.get_interrupt_mask() && !new.get_interrupt_mask() {
                    return Ok(self.maybe_deliver(pin));
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// If `pin` is currently asserted at its programmed polarity and
    /// neither masked nor (for level mode) awaiting EOI, builds the
    /// delivery request and, for level-triggered pins, marks Remote-IRR
    /// set.
    fn maybe_deliver(&mut self, pin: usize) -> Option<DeliverRequest> {
        let rte = self.rtes[pin];
        if rte.get_interrupt_mask() {
            return None;
        }
        let active = matches!(rte.get_polarity(), Polarity::ActiveHigh);
        if self.pin_state[pin] != active {
            return None;
        }
        if rte.get_trigger_mode() == TriggerMode::Level && rte.get_remote_irr() {
            return None;
        }
        if rte.get_trigger_mode() == TriggerMode::Level {
            let mut updated = rte;
            updated.set_remote_irr(true);
            updated.set_delivery_status(true);
            self.rtes[pin] = updated;
        }
        Some(DeliverRequest {
            dest: rte.get_dest_id() as u32,
            dest_mode: rte.get_dest_mode(),
            delivery_mode: rte.get_delivery_mode(),
            vector: rte.get_vector(),
            level_triggered: rte.get_trigger_mode() == TriggerMode::Level,
        })
    }

    /// `set_irqline_nolock`, spec.md §4.4: updates the pin's latch and
    /// generates an interrupt only when the stored-vs-new state crosses
    /// the RTE's programmed polarity edge; level re-asserts are
    /// suppressed while Remote-IRR is set.
    pub fn set_irqline(&mut self, pin: usize, op: PinOp) -> Result<Option<DeliverRequest>> {
        if pin >= NUM_IOAPIC_PINS {
            return Err(Error::NoSuchPin(pin as u32, NUM_IOAPIC_PINS));
        }
        let old = self.pin_state[pin];
        let pulse = matches!(op, PinOp::RaisingPulse | PinOp::FallingPulse);
        let momentary = match op {
            PinOp::SetHigh | PinOp::RaisingPulse => true,
            PinOp::SetLow | PinOp::FallingPulse => false,
        };
        if !pulse {
            self.pin_state[pin] = momentary;
        }
        if old == momentary && !pulse {
            return Ok(None);
        }
        let prior_latch = self.pin_state[pin];
        self.pin_state[pin] = momentary;
        let result = self.maybe_deliver(pin);
        if pulse {
            self.pin_state[pin] = prior_latch;
        }
        Ok(result)
    }

    /// MMIO read over the `IOREGSEL`/`IOWIN` window. Non-4-byte accesses
    /// are rejected per spec.md §4.4.
    pub fn mmio_read(&self, offset: u64, size: usize) -> Result<u32> {
        if size != 4 {
            return Err(Error::BadAccessSize(offset, size));
        }
        match offset {
            REG_IOREGSEL => Ok(self.ioregsel),
            REG_IOWIN => Ok(self.indirect_read()),
            _ => Ok(0),
        }
    }

    pub fn mmio_write(
        &mut self,
        offset: u64,
        size: usize,
        value: u32,
        observer: &mut dyn PinRemapObserver,
    ) -> Result<Option<DeliverRequest>> {
        if size != 4 {
            return Err(Error::BadAccessSize(offset, size));
        }
        match offset {
            REG_IOREGSEL => {
                self.ioregsel = value & 0xff;
                Ok(None)
            }
            REG_IOWIN => self.indirect_write(value, observer),
            _ => Ok(None),
        }
    }

    /// For LAPIC-passthrough guests, spec.md §4.4 requires Remote-IRR be
    /// synchronized from the physical IOAPIC before an RTE read returns;
    /// `hvcore` calls this with the physical bit immediately before
    /// servicing such a read.
    pub fn sync_remote_irr_from_physical(&mut self, pin: usize, remote_irr: bool) {
        if let Some(rte) = self.rtes.get_mut(pin) {
            rte.set_remote_irr(remote_irr);
        }
    }

    /// `vioapic_process_eoi`, spec.md §4.5 step 3: for every RTE whose
    /// vector matches and whose Remote-IRR is set, deasserts Remote-IRR
    /// and reports the pin for a physical `GSI_UNMASK`. If the pin is
    /// still latched asserted, redelivers immediately (the "does not
    /// re-inject until EOI" rule resolving on this exact EOI).
    pub fn process_eoi(&mut self, vector: u8) -> Vec<EoiAck> {
        let mut acks = Vec::new();
        for pin in 0..NUM_IOAPIC_PINS {
            let rte = self.rtes[pin];
            if rte.get_vector() != vector || !rte.get_remote_irr() {
                continue;
            }
            self.rtes[pin].set_remote_irr(false);
            self.rtes[pin].set_delivery_status(false);
            let redeliver = self.maybe_deliver(pin);
            acks.push(EoiAck { pin, redeliver });
        }
        acks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unmasked_level_rte(vector: u8) -> u64 {
        let mut rte = Rte::new();
        rte.set_vector(vector);
        rte.set_trigger_mode(TriggerMode::Level);
        rte.set_dest_id(1);
        rte.set_interrupt_mask(false);
        rte.into_bits()
    }

    fn unmasked_edge_rte(vector: u8) -> u64 {
        let mut rte = Rte::new();
        rte.set_vector(vector);
        rte.set_trigger_mode(TriggerMode::Edge);
        rte.set_dest_id(1);
        rte.set_interrupt_mask(false);
        rte.into_bits()
    }

    #[test]
    fn ver_register_reports_max_redir_and_version() {
        let ioapic = Vioapic::new(0);
        let mut ioapic = ioapic;
        ioapic.mmio_write(REG_IOREGSEL, 4, IDX_VER, &mut NullPinObserver).unwrap();
        let ver = ioapic.mmio_read(REG_IOWIN, 4).unwrap();
        assert_eq!(ver & 0xff, 0x11);
        assert_eq!((ver >> 16) & 0xff, (NUM_IOAPIC_PINS - 1) as u32);
    }

    #[test]
    fn non_four_byte_access_is_rejected() {
        let ioapic = Vioapic::new(0);
        assert_eq!(ioapic.mmio_read(REG_IOWIN, 2), Err(Error::BadAccessSize(REG_IOWIN, 2)));
    }

    #[test]
    fn s1_edge_intx_delivers_once_and_needs_no_eoi_ack() {
        let mut ioapic = Vioapic::new(0);
        let bits = unmasked_edge_rte(0x21);
        let pin = 3;
        ioapic
            .mmio_write(REG_IOREGSEL, 4, IDX_RTE_BASE + pin as u32 * 2, &mut NullPinObserver)
            .unwrap();
        ioapic
            .mmio_write(REG_IOWIN, 4, bits as u32, &mut NullPinObserver)
            .unwrap();
        ioapic
            .mmio_write(REG_IOREGSEL, 4, IDX_RTE_BASE + pin as u32 * 2 + 1, &mut NullPinObserver)
            .unwrap();
        ioapic
            .mmio_write(REG_IOWIN, 4, (bits >> 32) as u32, &mut NullPinObserver)
            .unwrap();

        let req = ioapic.set_irqline(pin, PinOp::RaisingPulse).unwrap().unwrap();
        assert_eq!(req.vector, 0x21);
        assert!(!req.level_triggered);

        // An edge RTE never carries Remote-IRR, so EOI is a no-op.
        assert!(ioapic.process_eoi(0x21).is_empty());
    }

    #[test]
    fn s2_level_intx_sets_remote_irr_and_eoi_clears_it() {
        let mut ioapic = Vioapic::new(0);
        let bits = unmasked_level_rte(0x30);
        let pin = 3;
        ioapic
            .mmio_write(REG_IOREGSEL, 4, IDX_RTE_BASE + pin as u32 * 2, &mut NullPinObserver)
            .unwrap();
        ioapic
            .mmio_write(REG_IOWIN, 4, bits as u32, &mut NullPinObserver)
            .unwrap();
        ioapic
            .mmio_write(REG_IOREGSEL, 4, IDX_RTE_BASE + pin as u32 * 2 + 1, &mut NullPinObserver)
            .unwrap();
        ioapic
            .mmio_write(REG_IOWIN, 4, (bits >> 32) as u32, &mut NullPinObserver)
            .unwrap();

        let req = ioapic.set_irqline(pin, PinOp::SetHigh).unwrap().unwrap();
        assert_eq!(req.vector, 0x30);
        assert!(req.level_triggered);
        assert!(ioapic.rte(pin).unwrap().get_remote_irr());

        // While asserted and Remote-IRR set, re-assertion is suppressed.
        assert!(ioapic.set_irqline(pin, PinOp::SetHigh).unwrap().is_none());

        let acks = ioapic.process_eoi(0x30);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].pin, pin);
        assert!(!ioapic.rte(pin).unwrap().get_remote_irr());
        // Still latched high, so the EOI itself redelivers.
        assert!(acks[0].redeliver.is_some());
    }

    #[test]
    fn mask_unmask_transition_notifies_observer_exactly_once() {
        struct Recorder(Vec<(u32, bool)>);
        impl PinRemapObserver for Recorder {
            fn on_pin_mask_transition(&mut self, gsi: u32, masked: bool) {
                self.0.push((gsi, masked));
            }
        }
        let mut ioapic = Vioapic::new(0);
        let mut rec = Recorder(Vec::new());
        let pin = 5u32;
        ioapic
            .mmio_write(REG_IOREGSEL, 4, IDX_RTE_BASE + pin * 2, &mut rec)
            .unwrap();
        let bits = unmasked_edge_rte(0x40);
        ioapic.mmio_write(REG_IOWIN, 4, bits as u32, &mut rec).unwrap();
        assert_eq!(rec.0, vec![(pin, false)]);
    }

    #[test]
    fn rte_write_cannot_clear_remote_irr_directly() {
        let mut ioapic = Vioapic::new(0);
        let pin = 0;
        ioapic.rtes[pin].set_remote_irr(true);
        ioapic
            .mmio_write(REG_IOREGSEL, 4, IDX_RTE_BASE + pin as u32 * 2, &mut NullPinObserver)
            .unwrap();
        ioapic.mmio_write(REG_IOWIN, 4, 0, &mut NullPinObserver).unwrap();
        assert!(ioapic.rte(pin).unwrap().get_remote_irr());
    }
}
