//! Guarded shared state: a monitor combining data, a mutex and a condition
//! variable.
//!
//! [`Guarded`] is the only synchronization primitive used by the dispatch
//! core. Every handler's bookkeeping (connection sets, in-flight counters,
//! tag maps) lives inside one `Guarded` value, and all cross-thread waiting
//! goes through [`Guarded::wait_with`] or its bounded variant.
//!
//! Re-entering any of these operations while already holding the lock is a
//! programmer error and deadlocks; it is not a runtime-checked condition.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A value of type `T` paired with a mutex and a condition variable.
pub struct Guarded<T> {
    data: Mutex<T>,
    cond: Condvar,
}

impl<T> Guarded<T> {
    pub const fn new(value: T) -> Self {
        Self {
            data: Mutex::new(value),
            cond: Condvar::new(),
        }
    }

    /// Runs `f` with exclusive access to the guarded value.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.data.lock();
        f(&mut guard)
    }

    /// Blocks until `pred` holds, then runs `f` atomically with respect to
    /// other holders and waiters.
    ///
    /// Waiters are woken by [`notify_one`](Self::notify_one) /
    /// [`notify_all`](Self::notify_all) and re-check their predicate on every
    /// wakeup.
    pub fn wait_with<R>(&self, mut pred: impl FnMut(&T) -> bool, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.data.lock();
        while !pred(&guard) {
            self.cond.wait(&mut guard);
        }
        f(&mut guard)
    }

    /// Bounded variant of [`wait_with`](Self::wait_with).
    ///
    /// Returns `None` when `pred` was not satisfied before the deadline; `f`
    /// is not run in that case.
    pub fn wait_with_timeout<R>(
        &self,
        timeout: Duration,
        mut pred: impl FnMut(&T) -> bool,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.data.lock();
        while !pred(&guard) {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                if pred(&guard) {
                    break;
                }
                return None;
            }
        }
        Some(f(&mut guard))
    }

    /// Wakes one waiter so it re-checks its predicate.
    pub fn notify_one(&self) {
        self.cond.notify_one();
    }

    /// Wakes every waiter so each re-checks its predicate.
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}
