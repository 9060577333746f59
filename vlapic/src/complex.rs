// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-VM collection of vLAPICs: destination-mask computation and
//! fan-out for `vlapic_receive_intr`, and the per-VM aggregate mode
//! spec.md §3 defines (`xAPIC`, `x2APIC`, `Disabled`, `Transition`).

use sync::Mutex;

use crate::error::Error;
use crate::error::Result;
use crate::lapic::ApicMode;
use crate::lapic::DeliveryMode;
use crate::lapic::DestShorthand;
use crate::lapic::DestinationMode;
use crate::lapic::Vlapic;

/// The VM-wide mode spec.md §3 tracks alongside each vCPU's own `mode`:
/// `Transition` while vCPUs disagree, collapsing to a single mode once
/// every running vCPU agrees (scenario S6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlapicAggregateMode {
    Disabled,
    XApic,
    X2Apic,
    Transition,
}

/// A decoded send request ready for destination-mask computation:
/// everything [`crate::lapic::IcrWrite`] carries, already unpacked for the
/// fan-out in [`VlapicComplex::receive_intr`].
#[derive(Debug, Clone, Copy)]
pub struct IntrRequest {
    pub dest: u32,
    pub dest_mode: DestinationMode,
    pub dest_shorthand: DestShorthand,
    pub delivery_mode: DeliveryMode,
    pub vector: u8,
    pub level_triggered: bool,
}

/// A vCPU index that `receive_intr` delivered into and whether a
/// notification (PI IPI or in-hypervisor kick) is owed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub vcpu_idx: usize,
    pub needs_notify: bool,
}

/// The per-VM collection of vLAPICs plus the `vlapic_mode_lock` spec.md §5
/// names explicitly.
pub struct VlapicComplex {
    vlapics: Mutex<Vec<Vlapic>>,
    lapic_passthrough: bool,
}

impl VlapicComplex {
    pub fn new(num_vcpus: usize, lapic_passthrough: bool) -> Self {
        let vlapics = (0..num_vcpus).map(|i| Vlapic::new(i, i == 0)).collect();
        VlapicComplex {
            vlapics: Mutex::new(vlapics),
            lapic_passthrough,
        }
    }

    pub fn lapic_passthrough(&self) -> bool {
        self.lapic_passthrough
    }

    pub fn len(&self) -> usize {
        self.vlapics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with_vlapic<R>(&self, idx: usize, f: impl FnOnce(&mut Vlapic) -> R) -> Result<R> {
        let mut guard = self.vlapics.lock();
        let lapic = guard.get_mut(idx).ok_or(Error::NoSuchVcpu(idx))?;
        Ok(f(lapic))
    }

    /// The VM-wide mode, computed under `vlapic_mode_lock` per spec.md §5.
    pub fn aggregate_mode(&self) -> VlapicAggregateMode {
        let guard = self.vlapics.lock();
        let mut modes = guard.iter().map(|l| l.mode());
        let first = match modes.next() {
            Some(m) => m,
            None => return VlapicAggregateMode::Disabled,
        };
        if modes.all(|m| m == first) {
            match first {
                ApicMode::Disabled => VlapicAggregateMode::Disabled,
                ApicMode::XApic => VlapicAggregateMode::XApic,
                ApicMode::X2Apic => VlapicAggregateMode::X2Apic,
            }
        } else {
            VlapicAggregateMode::Transition
        }
    }

    /// Computes the destination vCPU-index mask for `req.dest`/`dest_mode`
    /// under the current aggregate addressing mode, without delivering
    /// anything. Exposed separately from `receive_intr` so MSI remap (C5)
    /// can reuse the same destination arithmetic spec.md §4.5 calls
    /// `vlapic_calc_dest`.
    pub fn calc_dest_mask(&self, dest: u32, dest_mode: DestinationMode) -> Vec<usize> {
        let guard = self.vlapics.lock();
        match dest_mode {
            DestinationMode::Physical => guard
                .iter()
                .enumerate()
                .filter(|(_, l)| dest == 0xff || dest == 0xffff_ffff || l.apic_id() == dest)
                .map(|(i, _)| i)
                .collect(),
            DestinationMode::Logical => guard
                .iter()
                .enumerate()
                .filter(|(_, l)| {
                    let (ldr, _dfr) = l.logical_dest();
                    let logical_id = ldr >> 24;
                    dest & logical_id != 0
                })
                .map(|(i, _)| i)
                .collect(),
        }
    }

    fn shorthand_targets(&self, shorthand: DestShorthand, source: Option<usize>) -> Option<Vec<usize>> {
        let guard = self.vlapics.lock();
        let all: Vec<usize> = (0..guard.len()).collect();
        match shorthand {
            DestShorthand::NoShorthand => None,
            DestShorthand::SelfOnly => Some(source.into_iter().collect()),
            DestShorthand::AllIncludingSelf => Some(all),
            DestShorthand::AllExcludingSelf => {
                Some(all.into_iter().filter(|i| Some(*i) != source).collect())
            }
        }
    }

    /// `vlapic_receive_intr`, spec.md §4.3: computes the destination vCPU
    /// mask, fans out, and for each target either posts through APICv
    /// (if enabled for that vCPU) or sets IRR directly and reports that a
    /// kick is owed. `source` is the sending vCPU, used only to resolve
    /// the self/all-excluding-self shorthands (e.g. an IPI sent via ICR).
    pub fn receive_intr(&self, source: Option<usize>, req: IntrRequest) -> Vec<DeliveryTarget> {
        let targets = self
            .shorthand_targets(req.dest_shorthand, source)
            .unwrap_or_else(|| self.calc_dest_mask(req.dest, req.dest_mode));

        let mut delivered = Vec::new();
        let mut guard = self.vlapics.lock();
        for idx in targets {
            let Some(lapic) = guard.get_mut(idx) else { continue };
            match req.delivery_mode {
                DeliveryMode::Fixed | DeliveryMode::LowestPriority => {
                    let needs_notify = lapic.post_or_set_irr(req.vector, req.level_triggered);
                    delivered.push(DeliveryTarget { vcpu_idx: idx, needs_notify });
                }
                DeliveryMode::Nmi => {
                    delivered.push(DeliveryTarget { vcpu_idx: idx, needs_notify: true });
                }
                _ => {
                    // SMI/INIT/Startup/RemoteRead: recognized but acted on
                    // by `hvcore`'s lifecycle (C10), not this crate.
                    delivered.push(DeliveryTarget { vcpu_idx: idx, needs_notify: true });
                }
            }
        }
        delivered
    }

    /// Drains posted-interrupt bits for every vCPU. Called once per pCPU
    /// scheduling tick immediately before that vCPU's VM-entry.
    pub fn drain_posted_interrupts(&self, idx: usize) -> Result<()> {
        self.with_vlapic(idx, |l| l.drain_posted_interrupts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_mode_is_transition_until_all_vcpus_agree() {
        let complex = VlapicComplex::new(2, false);
        assert_eq!(complex.aggregate_mode(), VlapicAggregateMode::XApic);

        complex
            .with_vlapic(0, |l| l.set_apic_base_msr(l.apic_base_msr() | (1 << 10)))
            .unwrap();
        assert_eq!(complex.aggregate_mode(), VlapicAggregateMode::Transition);

        complex
            .with_vlapic(1, |l| l.set_apic_base_msr(l.apic_base_msr() | (1 << 10)))
            .unwrap();
        assert_eq!(complex.aggregate_mode(), VlapicAggregateMode::X2Apic);
    }

    #[test]
    fn physical_broadcast_dest_reaches_every_vcpu() {
        let complex = VlapicComplex::new(4, false);
        let targets = complex.calc_dest_mask(0xff, DestinationMode::Physical);
        assert_eq!(targets.len(), 4);
    }

    #[test]
    fn physical_dest_reaches_single_matching_apic_id() {
        let complex = VlapicComplex::new(4, false);
        let targets = complex.calc_dest_mask(2, DestinationMode::Physical);
        assert_eq!(targets, vec![2]);
    }

    #[test]
    fn receive_intr_fixed_delivery_sets_irr_on_target() {
        let complex = VlapicComplex::new(2, false);
        let req = IntrRequest {
            dest: 1,
            dest_mode: DestinationMode::Physical,
            dest_shorthand: DestShorthand::NoShorthand,
            delivery_mode: DeliveryMode::Fixed,
            vector: 0x41,
            level_triggered: false,
        };
        let delivered = complex.receive_intr(None, req);
        assert_eq!(delivered, vec![DeliveryTarget { vcpu_idx: 1, needs_notify: true }]);
        complex
            .with_vlapic(1, |l| assert_eq!(l.highest_irr(), Some(0x41)))
            .unwrap();
    }

    #[test]
    fn all_excluding_self_shorthand_skips_the_source() {
        let complex = VlapicComplex::new(3, false);
        let req = IntrRequest {
            dest: 0,
            dest_mode: DestinationMode::Physical,
            dest_shorthand: DestShorthand::AllExcludingSelf,
            delivery_mode: DeliveryMode::Fixed,
            vector: 0x50,
            level_triggered: false,
        };
        let delivered = complex.receive_intr(Some(0), req);
        let indices: Vec<usize> = delivered.iter().map(|d| d.vcpu_idx).collect();
        assert_eq!(indices, vec![1, 2]);
    }
}
