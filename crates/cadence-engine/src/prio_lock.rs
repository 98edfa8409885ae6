//! Mutual exclusion with two waiter classes.
//!
//! [`PrioLock::lock_priority`] callers overtake ordinary [`PrioLock::lock`]
//! callers: while any priority waiter is queued, ordinary waiters keep waiting
//! even when the lock is released. It is one lock with a fairness policy on the
//! gate, not two locks.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Gate {
    locked: bool,
    priority_waiting: usize,
}

pub struct PrioLock<T> {
    gate: Mutex<Gate>,
    cv: Condvar,
    data: Mutex<T>,
}

impl<T> PrioLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            gate: Mutex::new(Gate::default()),
            cv: Condvar::new(),
            data: Mutex::new(value),
        }
    }

    /// Acquire with ordinary priority.
    pub fn lock(&self) -> PrioLockGuard<'_, T> {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        while gate.locked || gate.priority_waiting > 0 {
            gate = self.cv.wait(gate).unwrap_or_else(PoisonError::into_inner);
        }
        gate.locked = true;
        drop(gate);
        self.enter()
    }

    /// Acquire ahead of every ordinary waiter.
    pub fn lock_priority(&self) -> PrioLockGuard<'_, T> {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        gate.priority_waiting += 1;
        while gate.locked {
            gate = self.cv.wait(gate).unwrap_or_else(PoisonError::into_inner);
        }
        gate.priority_waiting -= 1;
        gate.locked = true;
        drop(gate);
        self.enter()
    }

    /// Priority waiters currently queued.
    pub fn priority_waiters(&self) -> usize {
        self.gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .priority_waiting
    }

    fn enter(&self) -> PrioLockGuard<'_, T> {
        // The gate admits one holder at a time, so this never contends.
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        PrioLockGuard {
            lock: self,
            data: Some(data),
        }
    }

    fn release(&self) {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        gate.locked = false;
        drop(gate);
        self.cv.notify_all();
    }
}

impl<T: Default> Default for PrioLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Held access to the value in a [`PrioLock`]; released on drop, including unwinds.
pub struct PrioLockGuard<'a, T> {
    lock: &'a PrioLock<T>,
    data: Option<MutexGuard<'a, T>>,
}

impl<T> Deref for PrioLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.data {
            Some(data) => data,
            None => unreachable!("guard accessed after release"),
        }
    }
}

impl<T> DerefMut for PrioLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.data {
            Some(data) => data,
            None => unreachable!("guard accessed after release"),
        }
    }
}

impl<T> Drop for PrioLockGuard<'_, T> {
    fn drop(&mut self) {
        self.data.take();
        self.lock.release();
    }
}
