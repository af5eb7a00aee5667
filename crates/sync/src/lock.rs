//! Non-recursive, owner-tracked lock (spec.md §4.1).

use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::{Scheduler, raw_spin::RawSpin, semaphore::Semaphore};

/// Error returned by [`Lock::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The calling thread already holds this lock.
    AlreadyHeld,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyHeld => write!(f, "lock already held by the calling thread"),
        }
    }
}

/// A mutual-exclusion lock with a tracked owner.
///
/// Unlike [`Semaphore`], acquiring a `Lock` the calling thread already holds
/// is a programming error, not a legitimate wait: it fails fast with
/// [`LockError::AlreadyHeld`] instead of deadlocking.
pub struct Lock<S: Scheduler, T> {
    sem: Semaphore<S>,
    owner: RawSpin<Option<S::ThreadId>>,
    value: core::cell::UnsafeCell<T>,
}

unsafe impl<S: Scheduler, T: Send> Sync for Lock<S, T> {}

impl<S: Scheduler, T> Lock<S, T> {
    /// Creates an unheld lock guarding `value`.
    pub const fn new(value: T) -> Self {
        Self {
            sem: Semaphore::new(1),
            owner: RawSpin::new(None),
            value: core::cell::UnsafeCell::new(value),
        }
    }

    /// Returns whether the calling thread currently holds this lock.
    pub fn held_by_current(&self) -> bool {
        *self.owner.lock() == Some(S::current())
    }

    /// Blocks until the lock is free, then acquires it.
    ///
    /// Fails immediately, without blocking, if the calling thread already
    /// holds the lock.
    pub fn acquire(&self) -> Result<LockGuard<'_, S, T>, LockError> {
        if self.held_by_current() {
            return Err(LockError::AlreadyHeld);
        }
        self.sem.down();
        *self.owner.lock() = Some(S::current());
        Ok(LockGuard { lock: self })
    }

    /// Acquires the lock without blocking.
    ///
    /// Returns `None` if the lock is held (including by the calling
    /// thread — recursive acquisition is never granted).
    pub fn try_acquire(&self) -> Option<LockGuard<'_, S, T>> {
        if self.held_by_current() {
            return None;
        }
        if !self.sem.try_down() {
            return None;
        }
        *self.owner.lock() = Some(S::current());
        Some(LockGuard { lock: self })
    }

    fn release(&self) {
        *self.owner.lock() = None;
        self.sem.up();
    }
}

/// RAII guard returned by [`Lock::acquire`]; releases the lock on drop.
pub struct LockGuard<'a, S: Scheduler, T> {
    pub(crate) lock: &'a Lock<S, T>,
}

impl<S: Scheduler, T> Deref for LockGuard<'_, S, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<S: Scheduler, T> DerefMut for LockGuard<'_, S, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<S: Scheduler, T> Drop for LockGuard<'_, S, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::StdScheduler;

    #[test]
    fn acquire_release_roundtrip() {
        let lock: Lock<StdScheduler, u32> = Lock::new(0);
        {
            let mut guard = lock.acquire().unwrap();
            *guard += 1;
        }
        let guard = lock.acquire().unwrap();
        assert_eq!(*guard, 1);
    }

    #[test]
    fn recursive_acquire_fails() {
        let lock: Lock<StdScheduler, u32> = Lock::new(0);
        let _guard = lock.acquire().unwrap();
        assert_eq!(lock.acquire().unwrap_err(), LockError::AlreadyHeld);
    }

    #[test]
    fn try_acquire_fails_while_held() {
        let lock: Lock<StdScheduler, u32> = Lock::new(0);
        let _guard = lock.acquire().unwrap();
        assert!(lock.try_acquire().is_none());
    }

    #[test]
    fn contended_increments_are_serialized() {
        let lock = Arc::new(Lock::<StdScheduler, u64>::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.acquire().unwrap() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.acquire().unwrap(), 8000);
    }
}
