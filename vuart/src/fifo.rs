// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The TX/RX ring buffers behind each vUART (spec.md §4.9). Sized as a
//! plain `Vec<u8>` ring rather than a power-of-two mask-indexed buffer —
//! the FIFO depths this crate uses (64/1024 bytes) aren't required to be
//! powers of two by anything downstream, so a modulo index keeps the
//! size configurable without the power-of-two constraint the original's
//! fixed `#define`d buffer sizes happened to satisfy.
//!
//! `is_full`'s "fewer than 64 bytes free" threshold is deliberate, not an
//! off-by-one: the Linux 16550 driver sends a full 16-byte burst on a
//! single THRE interrupt without checking LSR first, so the FIFO must
//! report full a full burst (here, 4x that, for margin) before it
//! actually overflows.

/// A full FIFO's `putchar` doesn't drop the new byte — it evicts the
/// oldest one instead, matching `fifo_putchar`'s overwrite behavior
/// (advance `rindex` along with `windex` rather than refusing the write).
pub struct Fifo {
    buf: Vec<u8>,
    capacity: usize,
    rindex: usize,
    windex: usize,
    num: usize,
}

impl Fifo {
    pub fn new(capacity: usize) -> Self {
        Fifo {
            buf: vec![0; capacity],
            capacity,
            rindex: 0,
            windex: 0,
            num: 0,
        }
    }

    pub fn reset(&mut self) {
        self.rindex = 0;
        self.windex = 0;
        self.num = 0;
    }

    pub fn len(&self) -> usize {
        self.num
    }

    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    /// Reports full once fewer than 64 bytes remain free, not only when
    /// completely out of room (spec.md §4.9).
    pub fn is_full(&self) -> bool {
        self.capacity - self.num < 64
    }

    pub fn putchar(&mut self, ch: u8) {
        self.buf[self.windex] = ch;
        if self.num < self.capacity {
            self.windex = (self.windex + 1) % self.capacity;
            self.num += 1;
        } else {
            self.rindex = (self.rindex + 1) % self.capacity;
            self.windex = (self.windex + 1) % self.capacity;
        }
    }

    pub fn getchar(&mut self) -> Option<u8> {
        if self.num == 0 {
            return None;
        }
        let c = self.buf[self.rindex];
        self.rindex = (self.rindex + 1) % self.capacity;
        self.num -= 1;
        Some(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_is_empty_full_round_trip() {
        let mut fifo = Fifo::new(8);
        assert!(fifo.is_empty());
        fifo.putchar(b'a');
        assert_eq!(fifo.getchar(), Some(b'a'));
        assert!(fifo.is_empty());
        assert_eq!(fifo.getchar(), None);
    }

    #[test]
    fn full_threshold_trips_well_before_physical_capacity() {
        let mut fifo = Fifo::new(64);
        for _ in 0..10 {
            fifo.putchar(b'x');
        }
        assert!(!fifo.is_full());
        for _ in 10..64 {
            fifo.putchar(b'x');
        }
        assert!(fifo.is_full());
    }

    #[test]
    fn overflow_evicts_the_oldest_byte_rather_than_the_new_one() {
        let mut fifo = Fifo::new(4);
        fifo.putchar(1);
        fifo.putchar(2);
        fifo.putchar(3);
        fifo.putchar(4);
        fifo.putchar(5);
        assert_eq!(fifo.getchar(), Some(2));
        assert_eq!(fifo.getchar(), Some(3));
        assert_eq!(fifo.getchar(), Some(4));
        assert_eq!(fifo.getchar(), Some(5));
        assert_eq!(fifo.getchar(), None);
    }
}
