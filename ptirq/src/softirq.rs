// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-pCPU softirq queues: the deferred-delivery path a physical
//! interrupt's top-half hands off to, so the actual vIOAPIC/vPIC/vLAPIC
//! injection happens at the next softirq boundary rather than in
//! interrupt context.

use std::collections::VecDeque;

use sync::Mutex;

use crate::entry::PtirqEntryId;

/// One pCPU's softirq-pending queue. A real top-half runs with
/// interrupts disabled on its own pCPU, so the donor's per-pCPU lock is
/// IRQ-saving; this crate models that with a plain mutex since it owns no
/// interrupt-context code of its own to race with.
#[derive(Default)]
pub struct SoftirqQueue {
    pending: Mutex<VecDeque<PtirqEntryId>>,
}

impl SoftirqQueue {
    pub fn new() -> Self {
        SoftirqQueue::default()
    }

    /// `ptdev_enqueue_softirq`: unlinks the entry if it's already queued
    /// (so a fast re-fire before the softirq runs doesn't duplicate it),
    /// then appends it at the back.
    pub fn enqueue(&self, id: PtirqEntryId) {
        let mut pending = self.pending.lock();
        pending.retain(|&queued| queued != id);
        pending.push_back(id);
    }

    /// `ptirq_dequeue_softirq`: pops the next entry for `ptdev_softirq`
    /// to process, or `None` once the queue drains.
    pub fn dequeue(&self) -> Option<PtirqEntryId> {
        self.pending.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// One queue per pCPU, indexed by pCPU id.
pub struct SoftirqQueues {
    queues: Vec<SoftirqQueue>,
}

impl SoftirqQueues {
    pub fn new(num_pcpus: usize) -> Self {
        SoftirqQueues {
            queues: (0..num_pcpus).map(|_| SoftirqQueue::new()).collect(),
        }
    }

    pub fn enqueue(&self, pcpu_id: usize, id: PtirqEntryId) {
        if let Some(queue) = self.queues.get(pcpu_id) {
            queue.enqueue(id);
        }
    }

    pub fn dequeue(&self, pcpu_id: usize) -> Option<PtirqEntryId> {
        self.queues.get(pcpu_id).and_then(SoftirqQueue::dequeue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueueing_an_already_queued_entry_does_not_duplicate_it() {
        let queue = SoftirqQueue::new();
        queue.enqueue(PtirqEntryId(3));
        queue.enqueue(PtirqEntryId(3));
        assert_eq!(queue.dequeue(), Some(PtirqEntryId(3)));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn dequeue_is_fifo_across_distinct_entries() {
        let queue = SoftirqQueue::new();
        queue.enqueue(PtirqEntryId(1));
        queue.enqueue(PtirqEntryId(2));
        assert_eq!(queue.dequeue(), Some(PtirqEntryId(1)));
        assert_eq!(queue.dequeue(), Some(PtirqEntryId(2)));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn queues_are_isolated_per_pcpu() {
        let queues = SoftirqQueues::new(2);
        queues.enqueue(0, PtirqEntryId(1));
        queues.enqueue(1, PtirqEntryId(2));
        assert_eq!(queues.dequeue(0), Some(PtirqEntryId(1)));
        assert_eq!(queues.dequeue(1), Some(PtirqEntryId(2)));
    }
}
