// Copyright 2021 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Thin wrappers around `std::sync` primitives that drop lock poisoning.
//!
//! A poisoned lock in this codebase almost always means a handler panicked
//! while holding the lock across an emulation boundary (e.g. a ptirq softirq
//! handler, an MMIO trap). Propagating the poison to every subsequent locker
//! would turn one bad exit into every vCPU on the box taking a fatal path;
//! recovering the guarded state and moving on is what every ambient locking
//! macro in the original did by construction (none of them understood
//! poisoning to begin with), so this wrapper keeps that behavior explicit.

use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Condvar as StdCondvar;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard as StdMutexGuard;
use std::sync::TryLockError as StdTryLockError;
use std::time::Duration;

/// A `std::sync::Mutex` that never poisons: on a panicked guard, the next
/// locker just recovers the inner value instead of propagating the poison.
#[derive(Debug, Default)]
pub struct Mutex<T: ?Sized>(StdMutex<T>);

impl<T> Mutex<T> {
    pub fn new(val: T) -> Self {
        Mutex(StdMutex::new(val))
    }

    pub fn into_inner(self) -> T {
        self.0.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<T> {
        MutexGuard(self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn try_lock(&self) -> Option<MutexGuard<T>> {
        match self.0.try_lock() {
            Ok(guard) => Some(MutexGuard(guard)),
            Err(StdTryLockError::Poisoned(e)) => Some(MutexGuard(e.into_inner())),
            Err(StdTryLockError::WouldBlock) => None,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.0.get_mut().unwrap_or_else(|e| e.into_inner())
    }
}

/// A guard for `Mutex`, which dereferences to the protected value.
#[derive(Debug)]
pub struct MutexGuard<'a, T: ?Sized>(StdMutexGuard<'a, T>);

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.0.deref()
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.0.deref_mut()
    }
}

/// A `std::sync::Condvar` usable with [`Mutex`]/[`MutexGuard`].
#[derive(Debug, Default)]
pub struct Condvar(StdCondvar);

impl Condvar {
    pub fn new() -> Self {
        Condvar(StdCondvar::new())
    }

    pub fn notify_one(&self) {
        self.0.notify_one();
    }

    pub fn notify_all(&self) {
        self.0.notify_all();
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        MutexGuard(self.0.wait(guard.0).unwrap_or_else(|e| e.into_inner()))
    }

    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        dur: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        match self.0.wait_timeout(guard.0, dur) {
            Ok((guard, res)) => (MutexGuard(guard), res.timed_out()),
            Err(e) => {
                let (guard, res) = e.into_inner();
                (MutexGuard(guard), res.timed_out())
            }
        }
    }
}

/// A marker alias for locks guarding data also touched from interrupt
/// context. On real hardware, acquiring one of these requires saving and
/// restoring `RFLAGS.IF` around the critical section so a nested interrupt
/// cannot reenter the same lock on the same pCPU; that save/restore is a
/// property of the call site (it must already be running with interrupts
/// disabled, or disable them itself), not of the lock implementation, so
/// this is the same `Mutex` with a name that documents the calling
/// convention expected of it.
pub type IrqMutex<T> = Mutex<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_panic_while_held() {
        let m = std::sync::Arc::new(Mutex::new(0i32));
        let m2 = m.clone();
        let _ = std::thread::spawn(move || {
            let mut guard = m2.lock();
            *guard = 1;
            panic!("boom");
        })
        .join();
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn condvar_wakes_waiter() {
        use std::sync::Arc;
        use std::thread;

        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let pair2 = pair.clone();

        thread::spawn(move || {
            let (lock, cvar) = &*pair2;
            let mut ready = lock.lock();
            *ready = true;
            cvar.notify_one();
        });

        let (lock, cvar) = &*pair;
        let mut ready = lock.lock();
        while !*ready {
            ready = cvar.wait(ready);
        }
        assert!(*ready);
    }
}
