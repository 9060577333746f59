// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The virtual PIC (C4 half): two cascaded 8259s, reachable at the legacy
//! `0x20`/`0x21` (master) and `0xa0`/`0xa1` (slave) port pairs, plus the
//! wire-mode tracking spec.md §4.4 requires for a VM that starts out on
//! the 8259 and later switches its GSI 0 routing to the vIOAPIC.

use crate::error::Error;
use crate::error::Result;
use crate::vioapic::PinRemapObserver;

const NUM_CHIP_PINS: usize = 8;
pub const NUM_PIC_PINS: usize = 16;
const SLAVE_CASCADE_PIN: u8 = 2;

/// Where pin 0's interrupt source currently wires to. A VM starts at
/// `Null`; the first unmasked master-PIC interrupt latches `Intr`, and
/// programming the vIOAPIC's RTE 0 latches `Ioapic` — whichever happens
/// first, permanently (spec.md §4.4: "tracking NULL -> IOAPIC -> INTR").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMode {
    Null,
    Intr,
    Ioapic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IcwStep {
    AwaitIcw1,
    AwaitIcw2,
    AwaitIcw3,
    AwaitIcw4,
    Ready,
}

/// One 8259 equivalent half: ICW/OCW state machine, IRR/ISR/IMR, and the
/// ELCR edge/level control register the original PC platform bolted on
/// beside the strictly-edge-triggered architectural 8259.
struct Pic8259 {
    is_slave: bool,
    step: IcwStep,
    expect_icw4: bool,
    vector_base: u8,
    irr: u8,
    isr: u8,
    imr: u8,
    elcr: u8,
    auto_eoi: bool,
    rotate_in_auto_eoi: bool,
    priority_base: u8,
    read_isr: bool,
    poll_mode: bool,
    special_mask_mode: bool,
}

impl Pic8259 {
    fn new(is_slave: bool) -> Self {
        Pic8259 {
            is_slave,
            step: IcwStep::AwaitIcw1,
            expect_icw4: false,
            vector_base: 0,
            irr: 0,
            isr: 0,
            imr: 0xff,
            elcr: 0,
            auto_eoi: false,
            rotate_in_auto_eoi: false,
            priority_base: 0,
            read_isr: false,
            poll_mode: false,
            special_mask_mode: false,
        }
    }

    /// Master local pins 0,1,2 (timer, keyboard, cascade) and slave local
    /// pins 0,5 (global GSI 8 and 13: RTC and the floating-point error
    /// line) cannot be ELCR-programmed.
    fn elcr_writable_mask(&self) -> u8 {
        if self.is_slave {
            !((1 << 0) | (1 << 5))
        } else {
            !((1 << 0) | (1 << 1) | (1 << SLAVE_CASCADE_PIN))
        }
    }

    fn write_elcr(&mut self, value: u8) {
        let mask = self.elcr_writable_mask();
        self.elcr = (self.elcr & !mask) | (value & mask);
    }

    fn is_level_triggered(&self, pin: u8) -> bool {
        self.elcr & (1 << pin) != 0
    }

    /// Port-0 write: dispatches to ICW1/OCW2/OCW3 by the same bit-4/bit-3
    /// decode the real 8259 uses (`A0=0`, so these three share one port).
    fn write_port0(&mut self, value: u8) {
        if value & 0x10 != 0 {
            self.write_icw1(value);
        } else if value & 0x08 == 0 {
            self.write_ocw2(value);
        } else {
            self.write_ocw3(value);
        }
    }

    fn write_icw1(&mut self, value: u8) {
        self.step = IcwStep::AwaitIcw2;
        self.expect_icw4 = value & 0x01 != 0;
        self.irr = 0;
        self.isr = 0;
        self.imr = 0xff;
        self.special_mask_mode = false;
        self.poll_mode = false;
        self.priority_base = 0;
    }

    /// Port-1 write while mid-initialization feeds the ICW sequence;
    /// once `Ready`, the same port is OCW1 (the mask register).
    fn write_port1(&mut self, value: u8) {
        match self.step {
            IcwStep::AwaitIcw2 => {
                self.vector_base = value & 0xf8;
                self.step = IcwStep::AwaitIcw3;
            }
            IcwStep::AwaitIcw3 => {
                // ICW3 is only meaningful context (cascade id bitmap on the
                // master, cascade identity on the slave); this model
                // always runs as a master+slave pair so the value itself
                // doesn't change behavior, only the sequencing does.
                self.step = if self.expect_icw4 {
                    IcwStep::AwaitIcw4
                } else {
                    IcwStep::Ready
                };
            }
            IcwStep::AwaitIcw4 => {
                self.auto_eoi = value & 0x02 != 0;
                self.step = IcwStep::Ready;
            }
            IcwStep::AwaitIcw1 | IcwStep::Ready => {
                self.imr = value;
            }
        }
    }

    fn write_ocw2(&mut self, value: u8) {
        let rotate = value & 0x80 != 0;
        let specific = value & 0x40 != 0;
        let eoi = value & 0x20 != 0;
        let level = value & 0x07;

        if eoi {
            let bit = if specific { 1 << level } else { self.highest_isr_bit() };
            if let Some(bit) = bit {
                self.isr &= !bit_mask(bit);
            }
            if rotate {
                self.priority_base = (level.wrapping_add(1)) & 0x07;
            }
        } else if rotate && !specific {
            self.rotate_in_auto_eoi = true;
        } else if specific {
            self.priority_base = (level.wrapping_add(1)) & 0x07;
        }
    }

    fn write_ocw3(&mut self, value: u8) {
        if value & 0x04 != 0 {
            self.poll_mode = true;
        }
        if value & 0x02 != 0 {
            self.read_isr = value & 0x01 != 0;
        }
        if value & 0x40 != 0 {
            self.special_mask_mode = value & 0x20 != 0;
        }
    }

    fn read_port0(&mut self) -> u8 {
        if self.poll_mode {
            self.poll_mode = false;
            return self.highest_isr_bit().map(|b| 0x80 | b).unwrap_or(0);
        }
        if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }

    fn read_port1(&self) -> u8 {
        self.imr
    }

    /// Raw pin assert/deassert; edge pins latch IRR on the low->high
    /// transition only, level pins track the line directly and stay set
    /// while the source holds it asserted.
    fn set_pin(&mut self, pin: u8, asserted: bool) {
        let bit = bit_mask(pin);
        if self.is_level_triggered(pin) {
            if asserted {
                self.irr |= bit;
            } else {
                self.irr &= !bit;
            }
        } else if asserted {
            self.irr |= bit;
        }
    }

    fn highest_isr_bit(&self) -> Option<u8> {
        highest_priority_bit(self.isr, self.priority_base)
    }

    /// The next pin the chip would present on its `INT` line: highest
    /// priority among IRR bits not masked, and (absent special mask mode)
    /// not already in service at equal-or-higher priority.
    fn pending_pin(&self) -> Option<u8> {
        let eligible = self.irr & !self.imr;
        if eligible == 0 {
            return None;
        }
        if !self.special_mask_mode {
            if let Some(in_service) = self.highest_isr_bit() {
                let masked = eligible & !higher_or_equal_priority_mask(in_service, self.priority_base);
                if masked == 0 {
                    return None;
                }
                return highest_priority_bit(masked, self.priority_base);
            }
        }
        highest_priority_bit(eligible, self.priority_base)
    }

    /// The acknowledge (`INTA`) cycle: sets ISR (unless auto-EOI), clears
    /// the edge-triggered IRR latch, and returns the vector to inject.
    fn ack(&mut self, pin: u8) -> u8 {
        let bit = bit_mask(pin);
        if !self.auto_eoi {
            self.isr |= bit;
        } else if self.rotate_in_auto_eoi {
            self.priority_base = (pin.wrapping_add(1)) & 0x07;
        }
        if !self.is_level_triggered(pin) {
            self.irr &= !bit;
        }
        self.vector_base | pin
    }
}

fn bit_mask(pin: u8) -> u8 {
    1 << (pin & 0x07)
}

fn highest_priority_bit(bits: u8, priority_base: u8) -> Option<u8> {
    if bits == 0 {
        return None;
    }
    (0..NUM_CHIP_PINS as u8)
        .map(|i| (priority_base.wrapping_add(i)) & 0x07)
        .find(|&pin| bits & bit_mask(pin) != 0)
}

fn higher_or_equal_priority_mask(pin: u8, priority_base: u8) -> u8 {
    let mut mask = 0u8;
    for i in 0..NUM_CHIP_PINS as u8 {
        let p = (priority_base.wrapping_add(i)) & 0x07;
        mask |= bit_mask(p);
        if p == pin {
            break;
        }
    }
    mask
}

/// Identifies which chip and local pin a global GSI 0-15 maps to.
fn locate(pin: u8) -> Result<(bool, u8)> {
    match pin {
        0..=7 => Ok((false, pin)),
        8..=15 => Ok((true, pin - 8)),
        _ => Err(Error::NoSuchPin(pin as u32, NUM_PIC_PINS)),
    }
}

/// The cascaded master+slave pair presented to the guest as a single
/// 16-line interrupt controller.
pub struct Vpic {
    master: Pic8259,
    slave: Pic8259,
    wire_mode: WireMode,
}

impl Vpic {
    pub fn new() -> Self {
        Vpic {
            master: Pic8259::new(false),
            slave: Pic8259::new(true),
            wire_mode: WireMode::Null,
        }
    }

    pub fn wire_mode(&self) -> WireMode {
        self.wire_mode
    }

    /// Latches the wire mode the first time either side becomes known;
    /// once non-`Null`, later calls are no-ops (spec.md §4.4).
    pub fn latch_wire_mode(&mut self, mode: WireMode) {
        if self.wire_mode == WireMode::Null {
            log::debug!("pic wire mode latching null -> {:?}", mode);
            self.wire_mode = mode;
        }
    }

    pub fn io_read(&mut self, port: u16) -> Result<u8> {
        Ok(match port {
            0x20 => self.master.read_port0(),
            0x21 => self.master.read_port1(),
            0xa0 => self.slave.read_port0(),
            0xa1 => self.slave.read_port1(),
            _ => return Err(Error::NoSuchRte(port as u32)),
        })
    }

    /// Port-0/1 write. Any IMR bit that flips is reported to `observer` as
    /// a global-pin mask transition (spec.md §4.4's `ptirq_intx_pin_remap`
    /// hook), local pin `p` on the slave numbering as global pin `8 + p`.
    pub fn io_write(&mut self, port: u16, value: u8, observer: &mut dyn PinRemapObserver) -> Result<()> {
        let (chip, base) = match port {
            0x20 | 0x21 => (&mut self.master, 0u8),
            0xa0 | 0xa1 => (&mut self.slave, 8u8),
            _ => return Err(Error::NoSuchRte(port as u32)),
        };
        let old_imr = chip.imr;
        match port {
            0x20 | 0xa0 => chip.write_port0(value),
            0x21 | 0xa1 => chip.write_port1(value),
            _ => unreachable!(),
        }
        let changed = old_imr ^ chip.imr;
        for pin in 0..NUM_CHIP_PINS as u8 {
            if changed & bit_mask(pin) != 0 {
                observer.on_pin_mask_transition((base + pin) as u32, chip.imr & bit_mask(pin) != 0);
            }
        }
        Ok(())
    }

    /// ELCR is memory-mapped on a separate pair of ports (`0x4d0`/`0x4d1`)
    /// on real PC/AT hardware; exposed here as two chip-scoped setters
    /// rather than guessing a port number this crate doesn't own.
    pub fn write_elcr(&mut self, is_slave: bool, value: u8) {
        if is_slave {
            self.slave.write_elcr(value);
        } else {
            self.master.write_elcr(value);
        }
    }

    pub fn set_irqline(&mut self, pin: u8, asserted: bool) -> Result<()> {
        let (is_slave, local) = locate(pin)?;
        if is_slave {
            self.slave.set_pin(local, asserted);
        } else {
            self.master.set_pin(local, asserted);
        }
        Ok(())
    }

    /// `vpic_get_irqline_trigger_mode`: whether `pin`'s ELCR bit currently
    /// selects level triggering, queried by the passthrough remapper when
    /// it decides between a pulse and a held assertion.
    pub fn is_level_triggered(&self, pin: u8) -> Result<bool> {
        let (is_slave, local) = locate(pin)?;
        let chip = if is_slave { &self.slave } else { &self.master };
        Ok(chip.is_level_triggered(local))
    }

    /// Current IMR bit for `pin`, used by wire-mode arbitration to read
    /// pin 0's mask state independent of whatever just changed it.
    pub fn is_masked(&self, pin: u8) -> Result<bool> {
        let (is_slave, local) = locate(pin)?;
        let chip = if is_slave { &self.slave } else { &self.master };
        Ok(chip.imr & bit_mask(local) != 0)
    }

    /// What the CPU should see on its `INTR` line right now, and the
    /// vector it would receive on acknowledge. Slave-cascade pending
    /// interrupts present through master pin 2, same as real hardware.
    pub fn pending_vector(&self) -> Option<u8> {
        if self.master.pending_pin() == Some(SLAVE_CASCADE_PIN) {
            if let Some(slave_pin) = self.slave.pending_pin() {
                return Some(self.slave.vector_base | slave_pin);
            }
        }
        self.master.pending_pin().map(|pin| self.master.vector_base | pin)
    }

    /// The `INTA` acknowledge cycle for whichever pin is currently
    /// pending, returning the vector to inject.
    pub fn ack_pending(&mut self) -> Option<u8> {
        if self.master.pending_pin() == Some(SLAVE_CASCADE_PIN) {
            if let Some(slave_pin) = self.slave.pending_pin() {
                self.master.ack(SLAVE_CASCADE_PIN);
                return Some(self.slave.ack(slave_pin));
            }
        }
        self.master.pending_pin().map(|pin| self.master.ack(pin))
    }

    /// `ptirq_intx_ack`: acknowledges a specific global pin out of band
    /// (used when a level-triggered passthrough source needs its PIC
    /// state cleared independent of the normal `INTA` path). The ISR/IRR
    /// bit manipulated is local to whichever half serviced it — pin 10
    /// clears the slave's bit 2, not a (nonexistent) global bit 10 — kept
    /// exactly as original since downstream EOI bookkeeping assumes it.
    pub fn intx_ack(&mut self, pin: u8) -> Result<()> {
        let (is_slave, local) = locate(pin)?;
        let chip = if is_slave { &mut self.slave } else { &mut self.master };
        let bit = bit_mask(local);
        chip.isr &= !bit;
        if !chip.is_level_triggered(local) {
            chip.irr &= !bit;
        }
        Ok(())
    }
}

impl Default for Vpic {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_chip(pic: &mut Vpic, base_port: u16, vector_base: u8, icw4: bool) {
        pic.io_write(base_port, 0x10 | if icw4 { 0x01 } else { 0x00 }, &mut crate::vioapic::NullPinObserver).unwrap(); // ICW1
        pic.io_write(base_port + 1, vector_base, &mut crate::vioapic::NullPinObserver).unwrap(); // ICW2
        pic.io_write(base_port + 1, 0x04, &mut crate::vioapic::NullPinObserver).unwrap(); // ICW3
        if icw4 {
            pic.io_write(base_port + 1, 0x01, &mut crate::vioapic::NullPinObserver).unwrap(); // ICW4
        }
    }

    fn init_cascade(pic: &mut Vpic) {
        init_chip(pic, 0x20, 0x20, true);
        init_chip(pic, 0xa0, 0x28, true);
        pic.io_write(0x21, 0x00, &mut crate::vioapic::NullPinObserver).unwrap(); // unmask all on master
        pic.io_write(0xa1, 0x00, &mut crate::vioapic::NullPinObserver).unwrap(); // unmask all on slave
    }

    #[test]
    fn s5_cascade_delivers_slave_vector_through_master_pin_two() {
        let mut pic = Vpic::new();
        init_cascade(&mut pic);

        pic.set_irqline(10, true).unwrap(); // slave local pin 2
        assert_eq!(pic.pending_vector(), Some(0x28 + 2));

        let vector = pic.ack_pending().unwrap();
        assert_eq!(vector, 0x28 + 2);
    }

    #[test]
    fn master_only_irq_does_not_touch_slave() {
        let mut pic = Vpic::new();
        init_cascade(&mut pic);

        pic.set_irqline(1, true).unwrap();
        assert_eq!(pic.pending_vector(), Some(0x21));
        assert_eq!(pic.ack_pending(), Some(0x21));
    }

    #[test]
    fn masked_pin_never_becomes_pending() {
        let mut pic = Vpic::new();
        init_cascade(&mut pic);
        pic.io_write(0x21, 0x02, &mut crate::vioapic::NullPinObserver).unwrap(); // mask master pin 1

        pic.set_irqline(1, true).unwrap();
        assert_eq!(pic.pending_vector(), None);
    }

    #[test]
    fn level_pin_stays_asserted_until_source_deasserts() {
        let mut pic = Vpic::new();
        init_cascade(&mut pic);
        pic.write_elcr(false, 1 << 3);

        pic.set_irqline(3, true).unwrap();
        pic.ack_pending().unwrap();
        // Still pending: ISR set, but with nothing higher-priority in
        // service it is masked from re-presenting only by ISR itself
        // staying set until EOI.
        assert_eq!(pic.pending_vector(), None);

        pic.io_write(0x20, 0x20, &mut crate::vioapic::NullPinObserver).unwrap(); // non-specific EOI
        assert_eq!(pic.pending_vector(), Some(pic.master.vector_base | 3));
    }

    #[test]
    fn elcr_cannot_reprogram_cascade_or_timer_pins() {
        let mut pic = Vpic::new();
        pic.write_elcr(false, 0xff);
        assert!(!pic.master.is_level_triggered(0));
        assert!(!pic.master.is_level_triggered(1));
        assert!(!pic.master.is_level_triggered(SLAVE_CASCADE_PIN));
        assert!(pic.master.is_level_triggered(3));
    }

    #[test]
    fn wire_mode_latches_once() {
        let mut pic = Vpic::new();
        assert_eq!(pic.wire_mode(), WireMode::Null);
        pic.latch_wire_mode(WireMode::Intr);
        assert_eq!(pic.wire_mode(), WireMode::Intr);
        pic.latch_wire_mode(WireMode::Ioapic);
        assert_eq!(pic.wire_mode(), WireMode::Intr);
    }

    #[test]
    fn ocw2_ack_bit_is_local_to_half() {
        let mut pic = Vpic::new();
        init_cascade(&mut pic);
        pic.write_elcr(true, 1 << 2); // slave local pin 2 (global GSI 10) level-triggered

        pic.set_irqline(10, true).unwrap();
        pic.intx_ack(10).unwrap();

        // The slave's local bit 2 cleared, not some nonexistent global
        // bit 10 aliased via `pin & 0xff` truncation.
        assert_eq!(pic.slave.isr & (1 << 2), 0);
        assert_eq!(pic.master.isr, 0);
    }
}
