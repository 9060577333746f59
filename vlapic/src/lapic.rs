// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A single vCPU's local APIC model (C3): xAPIC/x2APIC register file, LVT,
//! ICR, IRR/ISR/TMR bitmaps, TSC-deadline. Fan-out across the vCPUs of a
//! VM (destination computation, EOI mirroring to vIOAPIC) lives in
//! [`crate::complex::VlapicComplex`]; this module only owns what's true of
//! one local APIC in isolation, the same split `hypervisor::LapicState`
//! (a single vCPU's snapshot) has from whatever owns the full VM.

use bit_field::bitfield;

use crate::error::Error;
use crate::error::Result;

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Fixed = 0b000,
    LowestPriority = 0b001,
    Smi = 0b010,
    RemoteRead = 0b011,
    Nmi = 0b100,
    Init = 0b101,
    Startup = 0b110,
    ExtInt = 0b111,
}

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationMode {
    Physical = 0,
    Logical = 1,
}

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Deassert = 0,
    Assert = 1,
}

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Edge = 0,
    Level = 1,
}

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestShorthand {
    NoShorthand = 0b00,
    SelfOnly = 0b01,
    AllIncludingSelf = 0b10,
    AllExcludingSelf = 0b11,
}

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    OneShot = 0b00,
    Periodic = 0b01,
    TscDeadline = 0b10,
}

/// ICR low dword, written by software to request an IPI; `write_icr_low`
/// decodes this into an [`IcrWrite`] that [`crate::complex::VlapicComplex`]
/// fans out across the VM's vCPUs.
#[bitfield]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct IcrLow {
    pub vector: bit_field::BitField8,
    #[bits = 3]
    pub delivery_mode: DeliveryMode,
    #[bits = 1]
    pub dest_mode: DestinationMode,
    pub delivery_status: bool,
    reserved: bit_field::BitField1,
    #[bits = 1]
    pub level: Level,
    #[bits = 1]
    pub trigger_mode: TriggerMode,
    reserved2: bit_field::BitField2,
    #[bits = 2]
    pub dest_shorthand: DestShorthand,
    reserved3: bit_field::BitField12,
}

/// An LVT entry common to LINT0/LINT1/ERROR/PERFMON/THERMAL/CMCI. The
/// timer's LVT entry has a different bit 17-18 (timer mode) in place of
/// `polarity`/`remote_irr`/`trigger_mode`; see [`LvtTimer`].
#[bitfield]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct LvtEntry {
    pub vector: bit_field::BitField8,
    #[bits = 3]
    pub delivery_mode: DeliveryMode,
    reserved: bit_field::BitField1,
    pub delivery_status: bool,
    pub polarity: bool,
    pub remote_irr: bool,
    #[bits = 1]
    pub trigger_mode: TriggerMode,
    pub mask: bool,
    reserved2: bit_field::BitField15,
}

#[bitfield]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct LvtTimer {
    pub vector: bit_field::BitField8,
    reserved: bit_field::BitField4,
    pub delivery_status: bool,
    reserved2: bit_field::BitField3,
    pub mask: bool,
    #[bits = 2]
    pub timer_mode: TimerMode,
    reserved3: bit_field::BitField13,
}

/// xAPIC/x2APIC mode, spec.md §3's `vlapic` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicMode {
    Disabled,
    XApic,
    X2Apic,
}

const APIC_BASE_ENABLE: u64 = 1 << 11;
const APIC_BASE_EXTD: u64 = 1 << 10;
const APIC_BASE_BSP: u64 = 1 << 8;
const DEFAULT_APIC_BASE_ADDR: u64 = 0xfee0_0000;

const IRR_WORDS: usize = 8;

fn bitmap_set(bitmap: &mut [u32; IRR_WORDS], vector: u8) {
    bitmap[(vector >> 5) as usize] |= 1 << (vector & 0x1f);
}

fn bitmap_clear(bitmap: &mut [u32; IRR_WORDS], vector: u8) {
    bitmap[(vector >> 5) as usize] &= !(1 << (vector & 0x1f));
}

fn bitmap_test(bitmap: &[u32; IRR_WORDS], vector: u8) -> bool {
    bitmap[(vector >> 5) as usize] & (1 << (vector & 0x1f)) != 0
}

/// Index of the highest set bit, scanning from vector 255 down to 16 (the
/// lowest vector APIC hardware will ever deliver through the priority
/// scheme; 0-15 are reserved).
fn bitmap_highest(bitmap: &[u32; IRR_WORDS]) -> Option<u8> {
    for word in (0..IRR_WORDS).rev() {
        if bitmap[word] != 0 {
            let bit = 31 - bitmap[word].leading_zeros();
            return Some((word * 32) as u8 + bit as u8);
        }
    }
    None
}

/// A decoded ICR write, ready for [`crate::complex::VlapicComplex`] to
/// compute a destination mask from and fan out.
#[derive(Debug, Clone, Copy)]
pub struct IcrWrite {
    pub vector: u8,
    pub delivery_mode: DeliveryMode,
    pub dest_mode: DestinationMode,
    pub level: Level,
    pub trigger_mode: TriggerMode,
    pub dest_shorthand: DestShorthand,
    pub dest: u32,
}

/// What a guest LAPIC EOI resolved to: the vector that left the ISR, and
/// whether it was level-triggered (the case spec.md §4.3 says must be
/// mirrored to every vIOAPIC so Remote-IRR can clear).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EoiInfo {
    pub vector: u8,
    pub level_triggered: bool,
}

/// The kick mechanism a vCPU's owning pCPU must use to wake it, per
/// spec.md §4.3's "switches the kick-notification mechanism to NMI"
/// under LAPIC passthrough + x2APIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickMode {
    Ipi,
    Nmi,
}

/// Returned by [`Vlapic::set_apic_base_msr`] so the caller (`hvcore`) can
/// react to a mode change: reprogram the MSR bitmap (C8), and, under LAPIC
/// passthrough, flip the VMCS controls and kick mechanism spec.md §4.3
/// describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTransition {
    pub before: ApicMode,
    pub after: ApicMode,
}

/// Outstanding posted-interrupt bits (PIR) plus the notification state,
/// spec.md §4.3's APICv-advanced path: `vlapic_receive_intr` writes the PID
/// and raises a PI notification instead of an in-hypervisor kick when this
/// is active for the target vCPU.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostedInterruptDescriptor {
    pir: [u64; 4],
    outstanding_notify: bool,
}

impl PostedInterruptDescriptor {
    /// Sets `vector` in the PIR. Returns `true` if a notification must be
    /// raised (no notification was already outstanding), `false` if one
    /// was already pending and this call just merged into it.
    pub fn post(&mut self, vector: u8) -> bool {
        self.pir[(vector >> 6) as usize] |= 1 << (vector & 0x3f);
        if self.outstanding_notify {
            false
        } else {
            self.outstanding_notify = true;
            true
        }
    }

    pub fn has_outstanding(&self) -> bool {
        self.outstanding_notify
    }

    /// Drains the PIR into `irr`, the software stand-in for what real
    /// APICv hardware does automatically on VM-entry. Called by the
    /// run-loop immediately before entry.
    fn drain_into(&mut self, irr: &mut [u32; IRR_WORDS]) {
        for (word_pair, pir_word) in self.pir.iter().enumerate() {
            if *pir_word == 0 {
                continue;
            }
            for bit in 0..64 {
                if pir_word & (1 << bit) != 0 {
                    let vector = (word_pair * 64 + bit) as u8;
                    bitmap_set(irr, vector);
                }
            }
        }
        self.pir = [0; 4];
        self.outstanding_notify = false;
    }
}

/// One vCPU's local APIC: xAPIC/x2APIC register file, LVT, ICR, IRR/ISR/TMR
/// bitmaps, TSC-deadline. Matches spec.md §3's `vLAPIC` attribute list.
pub struct Vlapic {
    vcpu_id: usize,
    apic_id: u32,
    mode: ApicMode,
    apic_base_msr: u64,
    svr: u32,
    tpr: u8,
    ldr: u32,
    dfr: u32,
    lvt_timer: LvtTimer,
    lvt_lint0: LvtEntry,
    lvt_lint1: LvtEntry,
    lvt_error: LvtEntry,
    lvt_thermal: LvtEntry,
    lvt_perfmon: LvtEntry,
    lvt_cmci: LvtEntry,
    tsc_deadline: u64,
    icr_low: IcrLow,
    icr_high: u32,
    irr: [u32; IRR_WORDS],
    isr: [u32; IRR_WORDS],
    tmr: [u32; IRR_WORDS],
    pid: Option<PostedInterruptDescriptor>,
}

const SVR_SOFTWARE_ENABLE: u32 = 1 << 8;

impl Vlapic {
    /// A freshly reset vLAPIC: xAPIC-enabled, software-disabled (SVR bit 8
    /// clear) until the guest's boot firmware/OS programs it, matching
    /// real hardware's post-reset state.
    pub fn new(vcpu_id: usize, is_bsp: bool) -> Self {
        let mut apic_base_msr = DEFAULT_APIC_BASE_ADDR | APIC_BASE_ENABLE;
        if is_bsp {
            apic_base_msr |= APIC_BASE_BSP;
        }
        Vlapic {
            vcpu_id,
            apic_id: vcpu_id as u32,
            mode: ApicMode::XApic,
            apic_base_msr,
            svr: 0xff,
            tpr: 0,
            ldr: 0,
            dfr: 0xffff_ffff,
            lvt_timer: LvtTimer::from_bits(1 << 16),
            lvt_lint0: LvtEntry::from_bits(1 << 16),
            lvt_lint1: LvtEntry::from_bits(1 << 16),
            lvt_error: LvtEntry::from_bits(1 << 16),
            lvt_thermal: LvtEntry::from_bits(1 << 16),
            lvt_perfmon: LvtEntry::from_bits(1 << 16),
            lvt_cmci: LvtEntry::from_bits(1 << 16),
            tsc_deadline: 0,
            icr_low: IcrLow::new(),
            icr_high: 0,
            irr: [0; IRR_WORDS],
            isr: [0; IRR_WORDS],
            tmr: [0; IRR_WORDS],
            pid: None,
        }
    }

    pub fn vcpu_id(&self) -> usize {
        self.vcpu_id
    }

    pub fn apic_id(&self) -> u32 {
        self.apic_id
    }

    pub fn mode(&self) -> ApicMode {
        self.mode
    }

    pub fn apic_base_msr(&self) -> u64 {
        self.apic_base_msr
    }

    pub fn is_software_enabled(&self) -> bool {
        self.svr & SVR_SOFTWARE_ENABLE != 0
    }

    pub fn logical_dest(&self) -> (u32, u32) {
        (self.ldr, self.dfr)
    }

    /// Enables APICv acceleration (posted-interrupt delivery) for this
    /// vCPU. A no-op if already enabled.
    pub fn enable_posted_interrupts(&mut self) {
        if self.pid.is_none() {
            self.pid = Some(PostedInterruptDescriptor::default());
        }
    }

    pub fn disable_posted_interrupts(&mut self) {
        self.pid = None;
    }

    pub fn posted_interrupts_enabled(&self) -> bool {
        self.pid.is_some()
    }

    /// Writes `IA32_APIC_BASE`, transitioning `mode` per the enable/extd
    /// bits (spec.md §4.3: xAPIC <-> x2APIC via this MSR). Returns the
    /// before/after mode so the caller can react to a change.
    pub fn set_apic_base_msr(&mut self, value: u64) -> ModeTransition {
        let before = self.mode;
        self.apic_base_msr = value;
        let enabled = value & APIC_BASE_ENABLE != 0;
        let extd = value & APIC_BASE_EXTD != 0;
        self.mode = match (enabled, extd) {
            (false, _) => ApicMode::Disabled,
            (true, false) => ApicMode::XApic,
            (true, true) => ApicMode::X2Apic,
        };
        if before != self.mode {
            log::debug!("vcpu {}: lapic mode {:?} -> {:?}", self.vcpu_id, before, self.mode);
        }
        ModeTransition { before, after: self.mode }
    }

    /// The kick mode a scheduler must use for this vCPU: NMI when this VM
    /// has LAPIC passthrough enabled and this vCPU is in x2APIC mode
    /// (spec.md §4.3), IPI otherwise.
    pub fn kick_mode(&self, lapic_passthrough: bool) -> KickMode {
        if lapic_passthrough && self.mode == ApicMode::X2Apic {
            KickMode::Nmi
        } else {
            KickMode::Ipi
        }
    }

    pub fn lvt_timer(&self) -> LvtTimer {
        self.lvt_timer
    }

    pub fn set_lvt_timer(&mut self, bits: u32) {
        self.lvt_timer = LvtTimer::from_bits(bits);
    }

    pub fn tsc_deadline(&self) -> u64 {
        self.tsc_deadline
    }

    pub fn set_tsc_deadline(&mut self, value: u64) {
        self.tsc_deadline = value;
    }

    pub fn tpr(&self) -> u8 {
        self.tpr
    }

    pub fn set_tpr(&mut self, value: u8) {
        self.tpr = value;
    }

    /// Processor-priority register: the higher of TPR and the highest ISR
    /// vector's priority class, SDM Vol. 3A §10.8.3.
    pub fn ppr(&self) -> u8 {
        let isr_priority = bitmap_highest(&self.isr).map(|v| v & 0xf0).unwrap_or(0);
        let tpr_priority = self.tpr & 0xf0;
        tpr_priority.max(isr_priority)
    }

    pub fn svr(&self) -> u32 {
        self.svr
    }

    pub fn set_svr(&mut self, value: u32) {
        self.svr = value;
    }

    /// Decodes an ICR-low write. The caller is expected to have already
    /// written `icr_high` (destination) first, matching the real xAPIC's
    /// register order; [`crate::complex::VlapicComplex`] uses the result
    /// to fan out the send.
    pub fn write_icr_low(&mut self, value: u32) -> IcrWrite {
        self.icr_low = IcrLow::from_bits(value);
        IcrWrite {
            vector: self.icr_low.get_vector(),
            delivery_mode: self.icr_low.get_delivery_mode(),
            dest_mode: self.icr_low.get_dest_mode(),
            level: self.icr_low.get_level(),
            trigger_mode: self.icr_low.get_trigger_mode(),
            dest_shorthand: self.icr_low.get_dest_shorthand(),
            dest: self.icr_high,
        }
    }

    pub fn write_icr_high(&mut self, value: u32) {
        // Only bits 24-31 are architecturally defined in xAPIC mode; x2APIC
        // uses the full 32 bits as the destination APIC ID.
        self.icr_high = value;
    }

    /// A single 64-bit ICR write, as x2APIC's combined `IA32_X2APIC_ICR`
    /// MSR presents it (`hi:lo`, destination in the upper 32 bits).
    pub fn write_icr_x2apic(&mut self, value: u64) -> IcrWrite {
        self.icr_high = (value >> 32) as u32;
        self.write_icr_low(value as u32)
    }

    pub fn read_icr(&self) -> u64 {
        ((self.icr_high as u64) << 32) | self.icr_low.into_bits() as u64
    }

    /// Sets `vector` pending in IRR (and, for a level-triggered source,
    /// TMR). This is `vlapic_receive_intr`'s per-target effect (spec.md
    /// §4.3); the destination fan-out itself lives in
    /// [`crate::complex::VlapicComplex::receive_intr`].
    pub fn set_irr(&mut self, vector: u8, level_triggered: bool) {
        bitmap_set(&mut self.irr, vector);
        if level_triggered {
            bitmap_set(&mut self.tmr, vector);
        } else {
            bitmap_clear(&mut self.tmr, vector);
        }
    }

    /// Posts `vector` through the posted-interrupt path if APICv
    /// acceleration is enabled for this vCPU, else falls back to setting
    /// IRR directly. Returns whether a notification (PI IPI, or an
    /// in-hypervisor kick) must be raised.
    pub fn post_or_set_irr(&mut self, vector: u8, level_triggered: bool) -> bool {
        match &mut self.pid {
            Some(pid) => pid.post(vector),
            None => {
                self.set_irr(vector, level_triggered);
                true
            }
        }
    }

    /// Merges any outstanding posted-interrupt bits into IRR. Called once
    /// per vCPU immediately before VM-entry, the software stand-in for
    /// hardware APICv's automatic PIR-to-IRR merge.
    pub fn drain_posted_interrupts(&mut self) {
        if let Some(pid) = &mut self.pid {
            pid.drain_into(&mut self.irr);
        }
    }

    pub fn has_posted_interrupts_outstanding(&self) -> bool {
        self.pid.map(|p| p.has_outstanding()).unwrap_or(false)
    }

    /// The RVI (requested-vector-index): the highest-priority IRR bit,
    /// spec.md §3's vLAPIC invariant `RVI <= highest-priority IRR bit`.
    pub fn highest_irr(&self) -> Option<u8> {
        bitmap_highest(&self.irr)
    }

    pub fn highest_isr(&self) -> Option<u8> {
        bitmap_highest(&self.isr)
    }

    pub fn is_tmr_set(&self, vector: u8) -> bool {
        bitmap_test(&self.tmr, vector)
    }

    /// Accepts the highest-priority pending IRR vector into service: moves
    /// it from IRR to ISR and returns it, only if its priority exceeds the
    /// current PPR. This is the point at which a pending virtual interrupt
    /// becomes the one actually injected on the next VM-entry.
    pub fn pop_highest_irr(&mut self) -> Option<u8> {
        let vector = bitmap_highest(&self.irr)?;
        if vector & 0xf0 <= self.ppr() & 0xf0 && self.ppr() != 0 {
            return None;
        }
        bitmap_clear(&mut self.irr, vector);
        bitmap_set(&mut self.isr, vector);
        Some(vector)
    }

    /// Processes a guest EOI write: the highest ISR vector leaves service.
    /// Returns `None` if ISR is empty (a spurious EOI, legal and ignored).
    pub fn process_eoi(&mut self) -> Option<EoiInfo> {
        let vector = bitmap_highest(&self.isr)?;
        bitmap_clear(&mut self.isr, vector);
        let level_triggered = bitmap_test(&self.tmr, vector);
        bitmap_clear(&mut self.tmr, vector);
        Some(EoiInfo { vector, level_triggered })
    }

    /// Reads a 4-byte xAPIC MMIO register. `offset` is the register's
    /// offset within the 4 KiB xAPIC page (e.g. `0x300` for ICR-low).
    pub fn read_xapic(&self, offset: u32) -> Result<u32> {
        if offset % 4 != 0 {
            return Err(Error::InvalidRegister(offset));
        }
        Ok(match offset {
            0x20 => self.apic_id << 24,
            0x30 => 0x50014, // version register: integrated APIC, max LVT entries 5.
            0x80 => self.tpr as u32,
            0xa0 => self.ppr() as u32,
            0xd0 => self.ldr,
            0xe0 => self.dfr,
            0xf0 => self.svr,
            0x100..=0x170 => self.isr[((offset - 0x100) / 0x10) as usize],
            0x180..=0x1f0 => self.tmr[((offset - 0x180) / 0x10) as usize],
            0x200..=0x270 => self.irr[((offset - 0x200) / 0x10) as usize],
            0x300 => self.icr_low.into_bits(),
            0x310 => self.icr_high,
            0x320 => self.lvt_timer.into_bits(),
            0x330 => self.lvt_thermal.into_bits(),
            0x340 => self.lvt_perfmon.into_bits(),
            0x350 => self.lvt_lint0.into_bits(),
            0x360 => self.lvt_lint1.into_bits(),
            0x370 => self.lvt_error.into_bits(),
            0x2f0 => self.lvt_cmci.into_bits(),
            0x380 => 0, // initial-count; timer-deadline mode (x2APIC only) uses the TSC-deadline MSR.
            0x390 => 0, // current-count.
            _ => return Err(Error::InvalidRegister(offset)),
        })
    }

    pub fn write_xapic(&mut self, offset: u32, value: u32) -> Result<Option<IcrWrite>> {
        if offset % 4 != 0 {
            return Err(Error::InvalidRegister(offset));
        }
        match offset {
            0x80 => self.tpr = value as u8,
            0xd0 => self.ldr = value & 0xff00_0000,
            0xe0 => self.dfr = value,
            0xf0 => self.svr = value,
            0x300 => return Ok(Some(self.write_icr_low(value))),
            0x310 => self.write_icr_high(value),
            0x320 => self.set_lvt_timer(value),
            0x330 => self.lvt_thermal = LvtEntry::from_bits(value),
            0x340 => self.lvt_perfmon = LvtEntry::from_bits(value),
            0x350 => self.lvt_lint0 = LvtEntry::from_bits(value),
            0x360 => self.lvt_lint1 = LvtEntry::from_bits(value),
            0x370 => self.lvt_error = LvtEntry::from_bits(value),
            0x2f0 => self.lvt_cmci = LvtEntry::from_bits(value),
            0xb0 => {
                // EOI register write: any value triggers an EOI. The
                // decoded effect is handled by the caller via `process_eoi`
                // since it needs to notify other subsystems.
            }
            0x380 | 0x390 => {}
            _ => return Err(Error::InvalidWrite(offset, value)),
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_state_is_xapic_software_disabled() {
        let lapic = Vlapic::new(0, true);
        assert_eq!(lapic.mode(), ApicMode::XApic);
        assert!(!lapic.is_software_enabled());
        assert_eq!(lapic.apic_base_msr() & APIC_BASE_BSP, APIC_BASE_BSP);
    }

    #[test]
    fn apic_base_write_transitions_mode() {
        let mut lapic = Vlapic::new(1, false);
        assert_eq!(lapic.mode(), ApicMode::XApic);
        let t = lapic.set_apic_base_msr(DEFAULT_APIC_BASE_ADDR | APIC_BASE_ENABLE | APIC_BASE_EXTD);
        assert_eq!(t.before, ApicMode::XApic);
        assert_eq!(t.after, ApicMode::X2Apic);
        assert_eq!(lapic.mode(), ApicMode::X2Apic);

        let t2 = lapic.set_apic_base_msr(0);
        assert_eq!(t2.after, ApicMode::Disabled);
    }

    #[test]
    fn irr_isr_round_trip_through_pop_and_eoi() {
        let mut lapic = Vlapic::new(0, true);
        lapic.set_irr(0x30, true);
        assert_eq!(lapic.highest_irr(), Some(0x30));
        let popped = lapic.pop_highest_irr();
        assert_eq!(popped, Some(0x30));
        assert_eq!(lapic.highest_irr(), None);
        assert_eq!(lapic.highest_isr(), Some(0x30));

        let eoi = lapic.process_eoi().unwrap();
        assert_eq!(eoi.vector, 0x30);
        assert!(eoi.level_triggered);
        assert_eq!(lapic.highest_isr(), None);
    }

    #[test]
    fn at_most_one_isr_bit_per_priority_class_invariant_is_respected_by_pop() {
        let mut lapic = Vlapic::new(0, true);
        lapic.set_irr(0x31, false);
        lapic.pop_highest_irr();
        // A second vector in the same priority class (0x30) must not also
        // enter service while the first is still there.
        lapic.set_irr(0x32, false);
        assert_eq!(lapic.pop_highest_irr(), None);
    }

    #[test]
    fn posted_interrupt_first_post_requests_notification() {
        let mut lapic = Vlapic::new(0, true);
        lapic.enable_posted_interrupts();
        assert!(lapic.post_or_set_irr(0x40, false));
        assert!(!lapic.post_or_set_irr(0x41, false), "second post before drain coalesces");
        assert_eq!(lapic.highest_irr(), None, "not merged into IRR until drained");
        lapic.drain_posted_interrupts();
        assert_eq!(lapic.highest_irr(), Some(0x41));
    }

    #[test]
    fn kick_mode_is_nmi_only_under_passthrough_x2apic() {
        let mut lapic = Vlapic::new(0, true);
        assert_eq!(lapic.kick_mode(true), KickMode::Ipi);
        lapic.set_apic_base_msr(DEFAULT_APIC_BASE_ADDR | APIC_BASE_ENABLE | APIC_BASE_EXTD);
        assert_eq!(lapic.kick_mode(true), KickMode::Nmi);
        assert_eq!(lapic.kick_mode(false), KickMode::Ipi);
    }
}
