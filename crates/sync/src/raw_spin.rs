//! A minimal spinlock used internally to protect the small bookkeeping
//! state (counters, wait queues) behind each primitive in this crate.
//!
//! This is plumbing, not one of the spec's named primitives: on real
//! hardware the kernel would disable interrupts around the critical
//! section the way `kernel/src/sync/spin_lock.rs` in the teacher does;
//! here the sections are a handful of instructions (push/pop a queue,
//! inc/dec a counter) so a bare spin loop is sufficient and keeps this
//! crate interrupt-agnostic.

use core::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

pub(crate) struct RawSpin<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for RawSpin<T> {}

impl<T> RawSpin<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub(crate) fn lock(&self) -> RawSpinGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        RawSpinGuard { lock: self }
    }
}

pub(crate) struct RawSpinGuard<'a, T> {
    lock: &'a RawSpin<T>,
}

impl<T> Deref for RawSpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for RawSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for RawSpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
