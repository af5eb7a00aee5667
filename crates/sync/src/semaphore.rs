//! Counting semaphore with fair FIFO wakeup (spec.md §4.1).

use alloc::collections::VecDeque;

use crate::{Scheduler, raw_spin::RawSpin};

struct Inner<S: Scheduler> {
    count: usize,
    waiters: VecDeque<S::ThreadId>,
}

/// A counting semaphore.
///
/// `down` blocks until the value is positive, then decrements it. `up`
/// increments the value and wakes the longest-waiting blocked thread, if
/// any.
pub struct Semaphore<S: Scheduler> {
    inner: RawSpin<Inner<S>>,
}

impl<S: Scheduler> Semaphore<S> {
    /// Creates a semaphore initialized with `value` permits.
    pub const fn new(value: usize) -> Self {
        Self {
            inner: RawSpin::new(Inner {
                count: value,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Blocks until a permit is available, then takes it.
    pub fn down(&self) {
        loop {
            let mut inner = self.inner.lock();
            if inner.count > 0 {
                inner.count -= 1;
                return;
            }
            inner.waiters.push_back(S::current());
            drop(inner);
            S::park();
        }
    }

    /// Takes a permit without blocking.
    ///
    /// Returns `true` if a permit was available and taken.
    pub fn try_down(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            true
        } else {
            false
        }
    }

    /// Releases a permit, waking the longest-waiting blocked thread if any.
    pub fn up(&self) {
        let mut inner = self.inner.lock();
        inner.count += 1;
        let next = inner.waiters.pop_front();
        drop(inner);
        if let Some(thread) = next {
            S::unpark(thread);
        }
    }

    /// Returns the current permit count.
    ///
    /// Racy the instant it's observed under contention; intended for
    /// diagnostics and tests, not for making acquire/release decisions.
    pub fn value(&self) -> usize {
        self.inner.lock().count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::StdScheduler;

    #[test]
    fn down_takes_available_permit_without_blocking() {
        let sem: Semaphore<StdScheduler> = Semaphore::new(1);
        sem.down();
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn try_down_fails_when_exhausted() {
        let sem: Semaphore<StdScheduler> = Semaphore::new(0);
        assert!(!sem.try_down());
        sem.up();
        assert!(sem.try_down());
    }

    #[test]
    fn up_wakes_a_blocked_waiter() {
        let sem = Arc::new(Semaphore::<StdScheduler>::new(0));
        let woken = Arc::new(AtomicUsize::new(0));

        let sem2 = Arc::clone(&sem);
        let woken2 = Arc::clone(&woken);
        let handle = std::thread::spawn(move || {
            sem2.down();
            woken2.fetch_add(1, Ordering::SeqCst);
        });

        // Give the spawned thread a chance to register as a waiter before
        // we signal; a spurious miss here would just make the test flaky,
        // not wrong, because `up` retries are unnecessary: `park`/`unpark`
        // never lose a wakeup once the thread has called `current()`.
        std::thread::sleep(std::time::Duration::from_millis(20));
        sem.up();
        handle.join().unwrap();
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn producer_consumer_bounded_buffer() {
        const CAP: usize = 4;
        let empty = Arc::new(Semaphore::<StdScheduler>::new(CAP));
        let filled = Arc::new(Semaphore::<StdScheduler>::new(0));
        let produced = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..10 {
            let empty = Arc::clone(&empty);
            let filled = Arc::clone(&filled);
            let produced = Arc::clone(&produced);
            handles.push(std::thread::spawn(move || {
                empty.down();
                produced.lock().unwrap().push(i);
                filled.up();
            }));
        }
        let mut consumed = Vec::new();
        for _ in 0..10 {
            filled.down();
            consumed.push(());
            empty.up();
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(consumed.len(), 10);
        assert_eq!(produced.lock().unwrap().len(), 10);
    }
}
