// Copyright 2021 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A wait/notify primitive standing in for the donor workspace's
//! `Event` (there, an eventfd shared with the host kernel). Nothing below
//! this crate is a separate process to signal across an fd with — a pCPU
//! blocked on `VCPU_EVENT_IOREQ` or parked by `sleep_thread` is modeled as
//! an OS thread for testability (spec.md §5's pCPU/vCPU scheduling model is
//! out of scope; this crate only needs "some thread can block here and
//! another can wake it"), so a condvar-backed primitive gives the same
//! `wait`/`notify`/`try_wait` surface without inventing an fd-based
//! transport nobody below hvcore would exercise.

use std::time::Duration;

use sync::Condvar;
use sync::Mutex;

/// A single-slot wait/notify primitive. Multiple `notify` calls before a
/// matching `wait` coalesce into at most one pending wakeup, matching
/// eventfd's counting-but-edge-triggered-enough-for-our-purposes semantics
/// closely enough for the one-VCPU-at-a-time consumers in this workspace.
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Event {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Marks the event signaled and wakes every waiter.
    pub fn notify(&self) {
        let mut signaled = self.state.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    /// Blocks until signaled, then clears the signal.
    pub fn wait(&self) {
        let mut signaled = self.state.lock();
        while !*signaled {
            signaled = self.cond.wait(signaled);
        }
        *signaled = false;
    }

    /// Blocks until signaled or `timeout` elapses. Returns `true` if it was
    /// signaled, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        while !*signaled {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, timed_out) = self.cond.wait_timeout(signaled, remaining);
            signaled = guard;
            if timed_out && !*signaled {
                return false;
            }
        }
        *signaled = false;
        true
    }

    /// Non-blocking poll: clears and returns the pending signal, if any.
    pub fn try_wait(&self) -> bool {
        let mut signaled = self.state.lock();
        let was = *signaled;
        *signaled = false;
        was
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_blocks_until_notified() {
        let ev = Arc::new(Event::new());
        let ev2 = ev.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            ev2.notify();
        });
        ev.wait();
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires_without_notify() {
        let ev = Event::new();
        assert!(!ev.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn try_wait_is_non_blocking() {
        let ev = Event::new();
        assert!(!ev.try_wait());
        ev.notify();
        assert!(ev.try_wait());
        assert!(!ev.try_wait());
    }
}
