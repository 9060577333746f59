// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The async-IO ring (spec.md §6): a per-VM ring buffer of
//! completed-fd descriptors the hypervisor produces and the Service VM
//! consumes, tagged with the wire magic `0x5aa5_7aa7_1aa1_3aa3` so a
//! consumer can sanity-check it's reading the right structure before
//! trusting the head/tail indices that follow it.

use std::collections::VecDeque;

use crate::wire::ASYNCIO_RING_MAGIC;

/// One completed fast-path access: which fd finished and, for a read,
/// the value it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncIoCompletion {
    pub fd: i32,
    pub value: u64,
}

/// A single-producer/single-consumer ring of pending completions. The
/// hypervisor is the sole producer (`push`); the Service VM the sole
/// consumer (`pop`); both already run strictly alternating with respect
/// to any one fd through the [`crate::asyncio::AsyncIoRegistry`] lookup
/// that feeds this ring, so a `sync::Mutex` is enough synchronization
/// without needing a lock-free SPSC queue.
pub struct AsyncIoRing {
    magic: u64,
    capacity: usize,
    queue: sync::Mutex<VecDeque<AsyncIoCompletion>>,
}

impl AsyncIoRing {
    pub fn new(capacity: usize) -> Self {
        AsyncIoRing {
            magic: ASYNCIO_RING_MAGIC,
            capacity,
            queue: sync::Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn magic(&self) -> u64 {
        self.magic
    }

    /// Pushes a completion, dropping the oldest entry if the ring is
    /// full rather than blocking the producer — a lagging consumer must
    /// not be able to stall the hypervisor's fast path.
    pub fn push(&self, completion: AsyncIoCompletion) {
        let mut queue = self.queue.lock();
        if queue.len() == self.capacity {
            queue.pop_front();
        }
        queue.push_back(completion);
    }

    pub fn pop(&self) -> Option<AsyncIoCompletion> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_matches_the_wire_contract() {
        let ring = AsyncIoRing::new(4);
        assert_eq!(ring.magic(), 0x5aa5_7aa7_1aa1_3aa3);
    }

    #[test]
    fn fifo_order_is_preserved() {
        let ring = AsyncIoRing::new(4);
        ring.push(AsyncIoCompletion { fd: 1, value: 10 });
        ring.push(AsyncIoCompletion { fd: 2, value: 20 });
        assert_eq!(ring.pop(), Some(AsyncIoCompletion { fd: 1, value: 10 }));
        assert_eq!(ring.pop(), Some(AsyncIoCompletion { fd: 2, value: 20 }));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn a_full_ring_drops_the_oldest_entry() {
        let ring = AsyncIoRing::new(2);
        ring.push(AsyncIoCompletion { fd: 1, value: 1 });
        ring.push(AsyncIoCompletion { fd: 2, value: 2 });
        ring.push(AsyncIoCompletion { fd: 3, value: 3 });
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.pop(), Some(AsyncIoCompletion { fd: 2, value: 2 }));
    }
}
