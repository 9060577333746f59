// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! `acrn_insert_request` and its Service VM-side counterpart (C7,
//! spec.md §4.7): the 16-slot shared page's state machine and the
//! synchronous/polling completion protocol built on top of it.
//!
//! Ownership alternates strictly between "hypervisor" (`Free`,
//! `Complete`) and "Service VM" (`Pending`, `Processing`), so each slot's
//! non-atomic payload is guarded by a [`sync::Mutex`] while the state
//! word itself is a bare `AtomicU32`: the release-store publishing
//! `Pending` and the acquire-load observing `Complete` are the ordering
//! contract spec.md §5 states explicitly, so they're written as
//! `Ordering::Release`/`Ordering::Acquire` rather than left implicit in
//! the mutex's own happens-before edges.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use base::Event;
use enumn::N as _;
use sync::Mutex;

use crate::error::Error;
use crate::error::Result;
use crate::slot::RequestBody;
use crate::slot::SlotState;

/// Raises the platform upcall interrupt that wakes the Service VM's
/// request-scanning thread. The concrete mechanism (an IPI vector into
/// the Service VM) is an out-of-scope external collaborator; this crate
/// only needs the seam, the same decoupling `ptirq::PhysicalDestResolver`
/// uses for its own externally-resolved piece.
pub trait HsmUpcall {
    fn raise(&self);
}

struct Slot {
    state: AtomicU32,
    body: Mutex<Option<RequestBody>>,
}

impl Slot {
    fn new() -> Self {
        Slot {
            state: AtomicU32::new(SlotState::Free as u32),
            body: Mutex::new(None),
        }
    }

    fn load_state(&self) -> SlotState {
        SlotState::n(self.state.load(Ordering::Acquire)).expect("slot state is always a valid SlotState")
    }
}

/// The shared I/O-request page: one [`Slot`] per vCPU, plus one
/// [`Event`] per vCPU for the parking variant of completion wait.
pub struct IoReqChannel {
    slots: Vec<Slot>,
    wake: Vec<Event>,
}

impl IoReqChannel {
    pub fn new(num_vcpus: usize) -> Self {
        IoReqChannel {
            slots: (0..num_vcpus).map(|_| Slot::new()).collect(),
            wake: (0..num_vcpus).map(|_| Event::new()).collect(),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, vcpu_id: usize) -> Result<&Slot> {
        self.slots.get(vcpu_id).ok_or(Error::NoSuchSlot(vcpu_id, self.slots.len()))
    }

    /// `acrn_insert_request`: publishes `body` and transitions
    /// `Free -> Pending`, then raises the upcall. Fails if the slot is
    /// not currently `Free`, per spec.md §4.7's precondition.
    pub fn insert_request(&self, vcpu_id: usize, body: RequestBody, completion_polling: bool, upcall: &dyn HsmUpcall) -> Result<()> {
        let slot = self.slot(vcpu_id)?;
        let prev = slot
            .state
            .compare_exchange(SlotState::Free as u32, SlotState::Pending as u32, Ordering::Relaxed, Ordering::Relaxed);
        if prev.is_err() {
            return Err(Error::SlotNotFree(vcpu_id));
        }
        *slot.body.lock() = Some(body);
        let _ = completion_polling;
        // Release: every field above this line must be visible to
        // whichever thread observes the Pending transition.
        slot.state.store(SlotState::Pending as u32, Ordering::Release);
        upcall.raise();
        Ok(())
    }

    /// The Service VM side: `Pending -> Processing`, returning the
    /// published request. `None` if this slot isn't `Pending`.
    pub fn accept(&self, vcpu_id: usize) -> Result<Option<RequestBody>> {
        let slot = self.slot(vcpu_id)?;
        let ok = slot
            .state
            .compare_exchange(SlotState::Pending as u32, SlotState::Processing as u32, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if !ok {
            return Ok(None);
        }
        Ok(*slot.body.lock())
    }

    /// Every `vcpu_id` currently `Pending`, in ascending order — the
    /// Service VM's scan loop after an upcall.
    pub fn pending_vcpus(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| (slot.load_state() == SlotState::Pending).then_some(id))
            .collect()
    }

    /// The Service VM side: `Processing -> Complete`, publishing the
    /// client's result. Wakes the parked vCPU, if any.
    pub fn complete(&self, vcpu_id: usize, result: RequestBody) -> Result<()> {
        let slot = self.slot(vcpu_id)?;
        let ok = slot
            .state
            .compare_exchange(SlotState::Processing as u32, SlotState::Complete as u32, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok();
        if !ok {
            return Err(Error::SlotNotFree(vcpu_id));
        }
        *slot.body.lock() = Some(result);
        // Release: the result above must be visible to the hypervisor's
        // acquire-load of Complete.
        slot.state.store(SlotState::Complete as u32, Ordering::Release);
        self.wake[vcpu_id].notify();
        Ok(())
    }

    /// Non-blocking: `true` if this slot has reached `Complete`.
    pub fn is_complete(&self, vcpu_id: usize) -> Result<bool> {
        Ok(self.slot(vcpu_id)?.load_state() == SlotState::Complete)
    }

    /// Parks the calling thread on this vCPU's wake event until the
    /// slot reaches `Complete`, then performs the `Complete -> Free`
    /// post-work and returns the completed body. Models
    /// `wait_event(VCPU_EVENT_IOREQ)`, which spec.md §5 calls out as
    /// wait-free by construction: no timeout path here, unlike the
    /// VT-d command-completion polls.
    pub fn wait_complete_parked(&self, vcpu_id: usize) -> Result<RequestBody> {
        loop {
            if self.is_complete(vcpu_id)? {
                return self.release(vcpu_id);
            }
            self.wake[vcpu_id].wait();
        }
    }

    /// The cooperative-poll variant `acrn_insert_request` uses when
    /// `completion_polling` is set: calls `yield_once` (which should
    /// invoke the scheduler) between polls instead of blocking on the
    /// event.
    pub fn poll_complete(&self, vcpu_id: usize, mut yield_once: impl FnMut()) -> Result<RequestBody> {
        loop {
            if self.is_complete(vcpu_id)? {
                return self.release(vcpu_id);
            }
            yield_once();
        }
    }

    /// `Complete -> Free`: reads back the result with an acquire-load
    /// (spec.md §5's ordering guarantee) and releases the slot.
    fn release(&self, vcpu_id: usize) -> Result<RequestBody> {
        let slot = self.slot(vcpu_id)?;
        // Acquire: pairs with `complete`'s release-store; everything
        // written before that store must be visible here.
        let state = slot.state.load(Ordering::Acquire);
        if state != SlotState::Complete as u32 {
            return Err(Error::SlotNotFree(vcpu_id));
        }
        let body = slot.body.lock().take().expect("Complete slot always has a body");
        slot.state.store(SlotState::Free as u32, Ordering::Relaxed);
        Ok(body)
    }

    /// A vCPU torn down to `Zombie` ignores any in-flight completion:
    /// the slot is forced back to `Free` with no post-work, regardless
    /// of its current state (spec.md §5's cancellation rule).
    pub fn abandon(&self, vcpu_id: usize) -> Result<()> {
        let slot = self.slot(vcpu_id)?;
        *slot.body.lock() = None;
        slot.state.store(SlotState::Free as u32, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::Direction;
    use crate::slot::PioRequest;
    use std::sync::Arc;
    use std::thread;

    struct CountingUpcall(std::sync::atomic::AtomicUsize);
    impl HsmUpcall for CountingUpcall {
        fn raise(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn pio(value: u32) -> RequestBody {
        RequestBody::Pio(PioRequest { address: 0x3f8, direction: Direction::Write, size: 1, value })
    }

    #[test]
    fn insert_requires_a_free_slot() {
        let chan = IoReqChannel::new(1);
        let upcall = CountingUpcall(Default::default());
        chan.insert_request(0, pio(b'A' as u32), false, &upcall).unwrap();
        assert_eq!(chan.insert_request(0, pio(0), false, &upcall), Err(Error::SlotNotFree(0)));
        assert_eq!(upcall.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn full_round_trip_through_every_state() {
        let chan = IoReqChannel::new(1);
        let upcall = CountingUpcall(Default::default());
        chan.insert_request(0, pio(b'A' as u32), false, &upcall).unwrap();
        assert_eq!(chan.pending_vcpus(), vec![0]);

        let req = chan.accept(0).unwrap().unwrap();
        assert_eq!(req, pio(b'A' as u32));
        assert!(chan.pending_vcpus().is_empty());

        chan.complete(0, pio(b'A' as u32)).unwrap();
        assert!(chan.is_complete(0).unwrap());

        let result = chan.wait_complete_parked(0).unwrap();
        assert_eq!(result, pio(b'A' as u32));
        assert_eq!(chan.slot(0).unwrap().load_state(), SlotState::Free);
    }

    #[test]
    fn poll_complete_spins_until_the_other_side_completes() {
        let chan = Arc::new(IoReqChannel::new(1));
        let upcall = CountingUpcall(Default::default());
        chan.insert_request(0, pio(1), true, &upcall).unwrap();
        chan.accept(0).unwrap();

        let chan2 = chan.clone();
        let handle = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(5));
            chan2.complete(0, pio(2)).unwrap();
        });
        let mut spins = 0;
        let result = chan.poll_complete(0, || {
            spins += 1;
            thread::yield_now();
        });
        handle.join().unwrap();
        assert_eq!(result.unwrap(), pio(2));
        assert!(spins > 0);
    }

    #[test]
    fn abandon_short_circuits_to_free_from_any_state() {
        let chan = IoReqChannel::new(1);
        let upcall = CountingUpcall(Default::default());
        chan.insert_request(0, pio(1), false, &upcall).unwrap();
        chan.accept(0).unwrap();
        chan.abandon(0).unwrap();
        assert_eq!(chan.slot(0).unwrap().load_state(), SlotState::Free);
    }

    #[test]
    fn an_unknown_vcpu_id_is_rejected() {
        let chan = IoReqChannel::new(1);
        assert_eq!(chan.accept(5), Err(Error::NoSuchSlot(5, 1)));
    }
}
