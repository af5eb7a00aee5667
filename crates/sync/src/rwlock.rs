//! Writer-preferring reader/writer lock with bounded reader starvation
//! (spec.md §4.1).

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::{Scheduler, raw_spin::RawSpin};

struct Inner<S: Scheduler> {
    readers: usize,
    writer_active: bool,
    /// Readers that arrived while a writer held or was waiting for the
    /// lock, queued in arrival order.
    reader_waiters: VecDeque<S::ThreadId>,
    writer_waiters: VecDeque<S::ThreadId>,
    /// Set by `write_release` to the number of readers that were queued at
    /// that moment; that exact cohort is allowed to proceed as a group
    /// ahead of any writer that arrives afterward, and is decremented as
    /// each one is admitted.
    readers_permitted: usize,
}

/// A reader/writer lock that prevents writer starvation without starving
/// readers outright.
///
/// Writers are preferred over readers that arrive after them: a reader that
/// shows up while a writer is active or waiting queues up. But on
/// `write_release`, every reader queued at that instant — the cohort that
/// arrived during the write — is admitted as a group before a second writer
/// is allowed to cut back in, so a steady stream of writers cannot lock
/// queued readers out forever.
pub struct RwLock<S: Scheduler, T> {
    inner: RawSpin<Inner<S>>,
    value: UnsafeCell<T>,
}

unsafe impl<S: Scheduler, T: Send + Sync> Sync for RwLock<S, T> {}

impl<S: Scheduler, T> RwLock<S, T> {
    /// Creates an unlocked rwlock guarding `value`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: RawSpin::new(Inner {
                readers: 0,
                writer_active: false,
                reader_waiters: VecDeque::new(),
                writer_waiters: VecDeque::new(),
                readers_permitted: 0,
            }),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock for reading, blocking while a writer holds it or is
    /// waiting (unless the calling thread is part of the just-released
    /// cohort, see the type-level docs).
    pub fn read(&self) -> RwLockReadGuard<'_, S, T> {
        let mut registered = false;
        loop {
            let mut inner = self.inner.lock();
            let blocked = inner.writer_active
                || (!inner.writer_waiters.is_empty() && inner.readers_permitted == 0);
            if !blocked {
                if inner.readers_permitted > 0 {
                    inner.readers_permitted -= 1;
                }
                inner.readers += 1;
                return RwLockReadGuard { lock: self };
            }
            if !registered {
                inner.reader_waiters.push_back(S::current());
                registered = true;
            }
            drop(inner);
            S::park();
        }
    }

    /// Acquires the lock for writing, blocking while any reader holds it or
    /// a writer is active.
    pub fn write(&self) -> RwLockWriteGuard<'_, S, T> {
        let mut registered = false;
        loop {
            let mut inner = self.inner.lock();
            let blocked = inner.readers > 0 || inner.writer_active;
            if !blocked {
                inner.writer_active = true;
                return RwLockWriteGuard { lock: self };
            }
            if !registered {
                inner.writer_waiters.push_back(S::current());
                registered = true;
            }
            drop(inner);
            S::park();
        }
    }

    fn release_read(&self) {
        let mut inner = self.inner.lock();
        inner.readers -= 1;
        if inner.readers == 0 {
            let next = inner.writer_waiters.pop_front();
            drop(inner);
            if let Some(thread) = next {
                S::unpark(thread);
            }
        }
    }

    fn release_write(&self) {
        let mut inner = self.inner.lock();
        inner.writer_active = false;
        inner.readers_permitted = inner.reader_waiters.len();
        let cohort: alloc::vec::Vec<_> = inner.reader_waiters.drain(..).collect();
        let next_writer = if cohort.is_empty() {
            inner.writer_waiters.pop_front()
        } else {
            None
        };
        drop(inner);
        for thread in cohort {
            S::unpark(thread);
        }
        if let Some(thread) = next_writer {
            S::unpark(thread);
        }
    }
}

/// RAII read guard returned by [`RwLock::read`].
pub struct RwLockReadGuard<'a, S: Scheduler, T> {
    lock: &'a RwLock<S, T>,
}

impl<S: Scheduler, T> Deref for RwLockReadGuard<'_, S, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<S: Scheduler, T> Drop for RwLockReadGuard<'_, S, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// RAII write guard returned by [`RwLock::write`].
pub struct RwLockWriteGuard<'a, S: Scheduler, T> {
    lock: &'a RwLock<S, T>,
}

impl<S: Scheduler, T> Deref for RwLockWriteGuard<'_, S, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<S: Scheduler, T> DerefMut for RwLockWriteGuard<'_, S, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<S: Scheduler, T> Drop for RwLockWriteGuard<'_, S, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::StdScheduler;

    #[test]
    fn concurrent_readers_see_each_other() {
        let lock = Arc::new(RwLock::<StdScheduler, u32>::new(7));
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a, 7);
        assert_eq!(*b, 7);
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(RwLock::<StdScheduler, u32>::new(0));
        {
            let mut w = lock.write();
            *w = 5;
        }
        assert_eq!(*lock.read(), 5);
    }

    #[test]
    fn many_writers_serialize_increments() {
        let lock = Arc::new(RwLock::<StdScheduler, u64>::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    *lock.write() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.read(), 4000);
    }

    #[test]
    fn readers_queued_during_write_proceed_as_a_cohort_before_next_writer() {
        let lock = Arc::new(RwLock::<StdScheduler, u32>::new(0));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let reader_count = Arc::new(AtomicUsize::new(0));

        let w = lock.write();

        let mut reader_handles = Vec::new();
        for i in 0..4 {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            let reader_count = Arc::clone(&reader_count);
            reader_handles.push(std::thread::spawn(move || {
                let _r = lock.read();
                reader_count.fetch_add(1, Ordering::SeqCst);
                order.lock().unwrap().push(format!("reader{i}"));
            }));
        }
        std::thread::sleep(std::time::Duration::from_millis(20));

        let lock2 = Arc::clone(&lock);
        let order2 = Arc::clone(&order);
        let writer_handle = std::thread::spawn(move || {
            let _w = lock2.write();
            order2.lock().unwrap().push("writer2".to_string());
        });
        std::thread::sleep(std::time::Duration::from_millis(20));

        drop(w);

        for h in reader_handles {
            h.join().unwrap();
        }
        writer_handle.join().unwrap();

        assert_eq!(reader_count.load(Ordering::SeqCst), 4);
        let order = order.lock().unwrap();
        let writer_pos = order.iter().position(|e| e == "writer2").unwrap();
        assert_eq!(
            writer_pos, 4,
            "second writer must follow the full cohort of 4 queued readers: {order:?}"
        );
    }
}
