// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Virtual 16550 UART emulation (C9): the console vUART and any cross-VM
//! channel vUARTs a VM is configured with, up to [`MAX_VUART_NUM_PER_VM`]
//! per VM (spec.md §4.9).

mod error;
mod fifo;
mod registers;
mod uart;

pub use error::Error;
pub use error::Result;
pub use registers::fcr;
pub use registers::ier;
pub use registers::iir;
pub use registers::lcr;
pub use registers::mcr;
pub use registers::msr;
pub use registers::UART16550_DLL;
pub use registers::UART16550_DLM;
pub use registers::UART16550_FCR;
pub use registers::UART16550_IER;
pub use registers::UART16550_IIR;
pub use registers::UART16550_LCR;
pub use registers::UART16550_MCR;
pub use registers::UART16550_MSR;
pub use registers::UART16550_RBR;
pub use registers::UART16550_SCR;
pub use registers::UART16550_THR;
pub use uart::CrossVmTarget;
pub use uart::InterruptSink;
pub use uart::Vuart;
pub use uart::VuartConfig;
pub use uart::MAX_VUART_NUM_PER_VM;
pub use uart::RX_BUF_SIZE;
pub use uart::TX_BUF_SIZE;

/// The fixed-size array of per-VM vUARTs, slot 0 reserved for the
/// console. Mirrors the table-with-fixed-slots idiom used for per-vCPU
/// I/O-request slots: membership is by index, not a freelist, because
/// vUART count is a static VM-config property, not something that grows
/// and shrinks at runtime.
pub struct VuartSet {
    slots: Vec<Option<Vuart>>,
}

impl VuartSet {
    pub fn new() -> Self {
        VuartSet { slots: (0..MAX_VUART_NUM_PER_VM).map(|_| None).collect() }
    }

    pub fn install(&mut self, index: usize, config: VuartConfig) -> Result<()> {
        if index >= MAX_VUART_NUM_PER_VM {
            return Err(Error::IndexOutOfRange(index, MAX_VUART_NUM_PER_VM));
        }
        self.slots[index] = Some(Vuart::new(config));
        Ok(())
    }

    pub fn get(&self, index: usize) -> Result<&Vuart> {
        if index >= MAX_VUART_NUM_PER_VM {
            return Err(Error::IndexOutOfRange(index, MAX_VUART_NUM_PER_VM));
        }
        self.slots[index].as_ref().ok_or(Error::NotActive(index))
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut Vuart> {
        if index >= MAX_VUART_NUM_PER_VM {
            return Err(Error::IndexOutOfRange(index, MAX_VUART_NUM_PER_VM));
        }
        self.slots[index].as_mut().ok_or(Error::NotActive(index))
    }
}

impl Default for VuartSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installing_past_the_per_vm_limit_is_rejected() {
        let mut set = VuartSet::new();
        let config = VuartConfig { port_base: 0x3f8, irq: 4, is_pci: false };
        let err = set.install(MAX_VUART_NUM_PER_VM, config).unwrap_err();
        assert_eq!(err, Error::IndexOutOfRange(MAX_VUART_NUM_PER_VM, MAX_VUART_NUM_PER_VM));
    }

    #[test]
    fn an_uninstalled_slot_reports_not_active() {
        let set = VuartSet::new();
        assert_eq!(set.get(0).unwrap_err(), Error::NotActive(0));
    }

    #[test]
    fn installed_slot_is_reachable_by_index() {
        let mut set = VuartSet::new();
        let config = VuartConfig { port_base: 0x2f8, irq: 3, is_pci: false };
        set.install(1, config).unwrap();
        assert_eq!(set.get(1).unwrap().config, config);
    }
}
