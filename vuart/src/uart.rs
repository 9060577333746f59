// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-UART register file, its TX/RX FIFOs, and the interrupt/cross-VM
//! wiring spec.md §4.9 describes (C9). One [`Vuart`] is either the VM
//! console (backed by the real debug UART, out of scope here — this
//! crate only owns the virtual register file) or one end of a cross-VM
//! channel paired with another VM's `Vuart` through [`CrossVmTarget`].

use crate::fifo::Fifo;
use crate::registers::fcr;
use crate::registers::ier;
use crate::registers::iir;
use crate::registers::lcr;
use crate::registers::lsr;
use crate::registers::mcr;
use crate::registers::msr;
use crate::registers::UART16550_DLL;
use crate::registers::UART16550_DLM;
use crate::registers::UART16550_FCR;
use crate::registers::UART16550_IER;
use crate::registers::UART16550_IIR;
use crate::registers::UART16550_LCR;
use crate::registers::UART16550_LSR;
use crate::registers::UART16550_MCR;
use crate::registers::UART16550_MSR;
use crate::registers::UART16550_RBR;
use crate::registers::UART16550_SCR;

/// The first vUART in a VM's array is always the console; the rest are
/// cross-VM channel endpoints (spec.md §4.9).
pub const MAX_VUART_NUM_PER_VM: usize = 8;
pub const TX_BUF_SIZE: usize = 256;
pub const RX_BUF_SIZE: usize = 256;

/// The far end of a cross-VM channel: writing to this vUART's THR
/// enqueues into the *target*'s RX FIFO instead of this vUART's own TX
/// FIFO (`send_to_target`/`notify_target` in the original).
pub trait CrossVmTarget {
    /// Enqueues `byte` into the target's RX FIFO and toggles its
    /// interrupt. Returns `true` if the target's RX FIFO is now full.
    fn send(&self, byte: u8) -> bool;
    /// Raises the target's THRE interrupt without sending a byte — the
    /// notification a reader issues after draining its own RX FIFO.
    fn notify_thre(&self);
}

/// Where this vUART's interrupt condition is reported: the legacy
/// vIOAPIC/vPIC line it's wired to, or the owning PCI device's MSI.
pub trait InterruptSink {
    /// Legacy vUART: drive the configured `irq` line. `asserted` is the
    /// raw interrupt-pending condition; translating that into
    /// `GSI_SET_HIGH`/`GSI_SET_LOW` against the line's configured
    /// polarity is the caller's job (it owns the vIOAPIC RTE this line
    /// routes through).
    fn set_level(&self, asserted: bool);
    /// PCI vUART: edge-trigger the owning `pci_vdev`'s MSI
    /// unconditionally whenever there's a pending reason (no level
    /// concept for a message-signalled interrupt).
    fn trigger_msi(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VuartConfig {
    pub port_base: u16,
    pub irq: u8,
    pub is_pci: bool,
}

pub struct Vuart {
    pub config: VuartConfig,
    pub active: bool,
    rxfifo: Fifo,
    txfifo: Fifo,
    ier: u8,
    lcr: u8,
    mcr: u8,
    lsr: u8,
    msr: u8,
    fcr: u8,
    scr: u8,
    dll: u8,
    dlh: u8,
    thre_int_pending: bool,
}

impl Vuart {
    pub fn new(config: VuartConfig) -> Self {
        Vuart {
            config,
            active: true,
            rxfifo: Fifo::new(RX_BUF_SIZE),
            txfifo: Fifo::new(TX_BUF_SIZE),
            ier: 0,
            lcr: 0,
            mcr: 0,
            lsr: 0,
            msr: 0,
            fcr: 0,
            scr: 0,
            dll: 0,
            dlh: 0,
            thre_int_pending: false,
        }
    }

    /// `vuart_intr_reason`: the highest-priority pending, enabled
    /// interrupt condition, in the fixed 16550 priority order (line
    /// status > received data > THRE > modem status).
    fn intr_reason(&self) -> u8 {
        if (self.lsr & (lsr::OE | lsr::BI)) != 0 && (self.ier & ier::ELSI) != 0 {
            iir::RLS
        } else if self.rxfifo.len() > 0 && (self.ier & ier::ERBFI) != 0 {
            iir::RXRDY
        } else if self.thre_int_pending && (self.ier & ier::ETBEI) != 0 {
            iir::TXRDY
        } else if (self.msr & msr::DELTA_MASK) != 0 && (self.ier & ier::EMSC) != 0 {
            iir::MLSC
        } else {
            iir::NOPEND
        }
    }

    /// `vuart_toggle_intr`: reports the current interrupt condition to
    /// `sink`, either as an MSI trigger (PCI) or a level change (legacy).
    fn toggle_intr(&self, sink: &dyn InterruptSink) {
        let pending = self.intr_reason() != iir::NOPEND;
        if self.config.is_pci {
            if pending {
                sink.trigger_msi();
            }
        } else {
            sink.set_level(pending);
        }
    }

    fn modem_status(mcr: u8) -> u8 {
        if mcr & crate::registers::mcr::LOOPBACK != 0 {
            let mut status = 0u8;
            if mcr & crate::registers::mcr::RTS != 0 {
                status |= msr::CTS;
            }
            if mcr & crate::registers::mcr::DTR != 0 {
                status |= msr::DSR;
            }
            if mcr & crate::registers::mcr::OUT1 != 0 {
                status |= msr::RI;
            }
            if mcr & crate::registers::mcr::OUT2 != 0 {
                status |= msr::DCD;
            }
            status
        } else {
            msr::DCD | msr::DSR
        }
    }

    fn update_modem_status(new_msr: u8, old_msr: u8) -> u8 {
        let mut update = old_msr;
        if (new_msr & msr::CTS) ^ (old_msr & msr::CTS) != 0 {
            update |= msr::DCTS;
        }
        if (new_msr & msr::DSR) ^ (old_msr & msr::DSR) != 0 {
            update |= msr::DDSR;
        }
        if (new_msr & msr::DCD) ^ (old_msr & msr::DCD) != 0 {
            update |= msr::DDCD;
        }
        if (new_msr & msr::RI) == 0 && (old_msr & msr::RI) != 0 {
            update |= msr::TERI;
        }
        (update & msr::DELTA_MASK) | new_msr
    }

    /// `send_to_target`: enqueues into *this* vUART's RX FIFO (called on
    /// the receiving end of a cross-VM channel) and toggles its
    /// interrupt. Returns `true` if the RX FIFO is now full.
    pub fn receive(&mut self, ch: u8, sink: &dyn InterruptSink) -> bool {
        if !self.active {
            return false;
        }
        self.rxfifo.putchar(ch);
        let full = self.rxfifo.is_full();
        if full {
            log::warn!("vuart rx fifo nearing capacity on port {:#x}", self.config.port_base);
        }
        self.toggle_intr(sink);
        full
    }

    /// `vuart_putchar`: a raw enqueue into the RX FIFO with no
    /// interrupt side effect, used by the hypervisor console's own input
    /// path (not a cross-VM channel).
    pub fn putchar(&mut self, ch: u8) {
        self.rxfifo.putchar(ch);
    }

    /// `vuart_getchar`: a raw dequeue from the TX FIFO, the console
    /// output path's counterpart to `putchar`.
    pub fn getchar(&mut self) -> Option<u8> {
        self.txfifo.getchar()
    }

    /// `write_reg`: the DLAB-aware register decode every MMIO/PIO write
    /// to this vUART goes through.
    fn write_reg(&mut self, offset: u16, value: u8) {
        if self.lcr & lcr::DLAB != 0 && offset == UART16550_DLL {
            self.dll = value;
            return;
        }
        if self.lcr & lcr::DLAB != 0 && offset == UART16550_DLM {
            self.dlh = value;
            return;
        }
        match offset {
            UART16550_IER => {
                if self.ier & ier::ETBEI == 0 && value & ier::ETBEI != 0 {
                    self.thre_int_pending = true;
                }
                self.ier = value & ier::MASK;
            }
            UART16550_FCR => {
                if value & fcr::FIFOE == 0 {
                    self.fcr = 0;
                } else {
                    if value & fcr::RFR != 0 {
                        self.rxfifo.reset();
                    }
                    self.fcr = value & (fcr::FIFOE | fcr::DMA | fcr::RX_MASK);
                }
            }
            UART16550_LCR => self.lcr = value,
            UART16550_MCR => {
                self.mcr = value & mcr::MASK;
                let status = Self::modem_status(self.mcr);
                self.msr = Self::update_modem_status(status, self.msr);
            }
            UART16550_LSR | UART16550_MSR => {
                // Read-only in normal operation; writes are ignored.
            }
            UART16550_SCR => self.scr = value,
            _ => {}
        }
    }

    /// `vuart_write_reg`: the THR special case (enqueue into our own TX
    /// FIFO, or the loopback RX FIFO with `LSR_OE` set if MCR loopback
    /// is enabled) layered over [`Self::write_reg`], plus the
    /// interrupt-toggle side effect every write produces.
    pub fn write(&mut self, offset: u16, value: u8, target: Option<&dyn CrossVmTarget>, sink: &dyn InterruptSink) {
        let dlab = self.lcr & lcr::DLAB != 0;
        if offset == UART16550_RBR && !dlab {
            match (self.mcr & mcr::LOOPBACK != 0, target) {
                (true, _) => {
                    self.rxfifo.putchar(value);
                    self.lsr |= lsr::OE;
                    self.thre_int_pending = true;
                    self.toggle_intr(sink);
                }
                (false, Some(target)) => {
                    if !target.send(value) {
                        self.thre_int_pending = true;
                        self.toggle_intr(sink);
                    }
                }
                (false, None) => {
                    self.txfifo.putchar(value);
                    self.thre_int_pending = true;
                    self.toggle_intr(sink);
                }
            }
            return;
        }
        self.write_reg(offset, value);
        self.toggle_intr(sink);
    }

    /// `vuart_read_reg`: the DLAB-aware register decode for reads, plus
    /// the IIR/RBR side effects (clearing `LSR_OE`, latching
    /// `thre_int_pending` low on an IIR read that reported TXRDY) and the
    /// cross-VM "I just drained my RX FIFO, tell the sender" notify.
    pub fn read(&mut self, offset: u16, target: Option<&dyn CrossVmTarget>, sink: &dyn InterruptSink) -> u8 {
        let dlab = self.lcr & lcr::DLAB != 0;
        if dlab {
            let reg = match offset {
                UART16550_DLL => self.dll,
                UART16550_DLM => self.dlh,
                _ => 0,
            };
            return reg;
        }
        let reg = match offset {
            UART16550_RBR => {
                self.lsr &= !lsr::OE;
                let was_full = self.rxfifo.is_full();
                let byte = self.rxfifo.getchar().unwrap_or(0xff);
                if was_full {
                    if let Some(target) = target {
                        target.notify_thre();
                    }
                }
                byte
            }
            UART16550_IER => self.ier,
            UART16550_IIR => {
                let mut iir_val = if self.fcr & fcr::FIFOE != 0 { iir::FIFO_MASK } else { 0 };
                let reason = self.intr_reason();
                if reason == iir::TXRDY {
                    self.thre_int_pending = false;
                }
                iir_val | reason
            }
            UART16550_LCR => self.lcr,
            UART16550_MCR => self.mcr,
            UART16550_LSR => {
                let mut lsr_val = self.lsr | lsr::THRE | lsr::TEMT;
                if self.rxfifo.len() > 0 {
                    lsr_val |= lsr::DR;
                }
                self.lsr &= !(lsr::OE | lsr::BI | lsr::PE | lsr::FE);
                lsr_val
            }
            UART16550_MSR => {
                let val = self.msr;
                self.msr &= !msr::DELTA_MASK;
                val
            }
            UART16550_SCR => self.scr,
            _ => 0xff,
        };
        self.toggle_intr(sink);
        reg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingSink {
        levels: RefCell<Vec<bool>>,
        msi_count: RefCell<u32>,
    }
    impl InterruptSink for RecordingSink {
        fn set_level(&self, asserted: bool) {
            self.levels.borrow_mut().push(asserted);
        }
        fn trigger_msi(&self) {
            *self.msi_count.borrow_mut() += 1;
        }
    }

    fn legacy() -> Vuart {
        Vuart::new(VuartConfig { port_base: 0x3f8, irq: 4, is_pci: false })
    }

    #[test]
    fn enabling_rx_interrupt_then_receiving_a_byte_asserts_the_line() {
        let mut vu = legacy();
        let sink = RecordingSink::default();
        vu.write(UART16550_IER, ier::ERBFI, None, &sink);
        vu.receive(b'A', &sink);
        assert_eq!(*sink.levels.borrow().last().unwrap(), true);
        let byte = vu.read(UART16550_RBR, None, &sink);
        assert_eq!(byte, b'A');
    }

    #[test]
    fn iir_read_reports_rxrdy_before_txrdy_priority() {
        let mut vu = legacy();
        let sink = RecordingSink::default();
        vu.write(UART16550_IER, ier::ERBFI | ier::ETBEI, None, &sink);
        vu.receive(b'Z', &sink);
        vu.write(UART16550_THR, b'Q', None, &sink);
        let iir_val = vu.read(UART16550_IIR, None, &sink);
        assert_eq!(iir_val & 0x0f, iir::RXRDY);
    }

    #[test]
    fn pci_vuart_triggers_msi_instead_of_a_level_line() {
        let mut vu = Vuart::new(VuartConfig { port_base: 0, irq: 0, is_pci: true });
        let sink = RecordingSink::default();
        vu.write(UART16550_IER, ier::ERBFI, None, &sink);
        vu.receive(b'x', &sink);
        assert!(*sink.msi_count.borrow() > 0);
        assert!(sink.levels.borrow().is_empty());
    }

    struct TargetUart(RefCell<Vuart>);
    impl CrossVmTarget for TargetUart {
        fn send(&self, byte: u8) -> bool {
            let sink = RecordingSink::default();
            self.0.borrow_mut().receive(byte, &sink)
        }
        fn notify_thre(&self) {
            self.0.borrow_mut().thre_int_pending = true;
        }
    }

    #[test]
    fn writing_thr_on_a_channel_endpoint_forwards_to_the_target() {
        let mut vu = legacy();
        let target = TargetUart(RefCell::new(legacy()));
        let sink = RecordingSink::default();
        vu.write(UART16550_THR, b'H', Some(&target), &sink);
        let byte = target.0.borrow_mut().read(UART16550_RBR, None, &sink);
        assert_eq!(byte, b'H');
    }

    #[test]
    fn dlab_set_redirects_offset_zero_and_one_to_the_divisor_latch() {
        let mut vu = legacy();
        let sink = RecordingSink::default();
        vu.write(UART16550_LCR, lcr::DLAB, None, &sink);
        vu.write(UART16550_DLL, 0x01, None, &sink);
        vu.write(UART16550_DLM, 0x02, None, &sink);
        assert_eq!(vu.read(UART16550_DLL, None, &sink), 0x01);
        assert_eq!(vu.read(UART16550_DLM, None, &sink), 0x02);
    }
}
