// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The optional asynchronous-I/O descriptor registry (spec.md §3's
//! "Asynchronous I/O descriptor", `acrn_asyncio_info` in the original):
//! a per-VM table keyed by `(address, type, fd)` that shortcuts matching
//! accesses to a notification-only path instead of a synchronous slot
//! round-trip. Registration/lookup only — the ring buffer the fast path
//! notifies through is [`crate::ring::AsyncIoRing`].

use crate::error::Error;
use crate::error::Result;
use crate::slot::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsyncIoKind {
    Pio,
    Mmio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AsyncIoKey {
    kind: AsyncIoKind,
    address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncIoDescriptor {
    pub kind: AsyncIoKind,
    pub address: u64,
    pub fd: i32,
    pub direction: Direction,
}

/// A per-VM registry of fast-path descriptors. Plain linear storage: the
/// number of registered fast-path addresses per VM is small (a handful
/// of virtio-style notify registers), so a `Vec` scan beats a hash map's
/// bookkeeping at this scale.
#[derive(Default)]
pub struct AsyncIoRegistry {
    entries: Vec<AsyncIoDescriptor>,
}

impl AsyncIoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: AsyncIoDescriptor) -> Result<()> {
        let key = AsyncIoKey { kind: descriptor.kind, address: descriptor.address };
        if self.entries.iter().any(|e| AsyncIoKey { kind: e.kind, address: e.address } == key) {
            return Err(Error::DuplicateAsyncIo);
        }
        self.entries.push(descriptor);
        Ok(())
    }

    pub fn unregister(&mut self, kind: AsyncIoKind, address: u64) -> Option<AsyncIoDescriptor> {
        let idx = self.entries.iter().position(|e| e.kind == kind && e.address == address)?;
        Some(self.entries.remove(idx))
    }

    /// Looks up a matching fast-path descriptor for an incoming access,
    /// if one is registered; the caller uses this to decide between the
    /// synchronous slot path and a bare ring-buffer notification.
    pub fn lookup(&self, kind: AsyncIoKind, address: u64) -> Option<&AsyncIoDescriptor> {
        self.entries.iter().find(|e| e.kind == kind && e.address == address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(address: u64, fd: i32) -> AsyncIoDescriptor {
        AsyncIoDescriptor { kind: AsyncIoKind::Mmio, address, fd, direction: Direction::Write }
    }

    #[test]
    fn register_then_lookup_finds_the_entry() {
        let mut reg = AsyncIoRegistry::new();
        reg.register(desc(0x1000, 3)).unwrap();
        assert_eq!(reg.lookup(AsyncIoKind::Mmio, 0x1000).unwrap().fd, 3);
        assert!(reg.lookup(AsyncIoKind::Mmio, 0x2000).is_none());
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let mut reg = AsyncIoRegistry::new();
        reg.register(desc(0x1000, 3)).unwrap();
        assert_eq!(reg.register(desc(0x1000, 4)), Err(Error::DuplicateAsyncIo));
    }

    #[test]
    fn unregister_removes_the_entry() {
        let mut reg = AsyncIoRegistry::new();
        reg.register(desc(0x1000, 3)).unwrap();
        assert!(reg.unregister(AsyncIoKind::Mmio, 0x1000).is_some());
        assert!(reg.lookup(AsyncIoKind::Mmio, 0x1000).is_none());
    }
}
