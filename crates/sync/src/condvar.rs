//! Condition variable with Mesa-style wait/signal semantics (spec.md §4.1).

use alloc::collections::VecDeque;

use crate::{Scheduler, lock::LockGuard, raw_spin::RawSpin};

/// A condition variable associated with a [`Lock`].
///
/// Follows Mesa semantics, like the textbook/Pintos condvar this mirrors: a
/// woken waiter only gets a chance to recheck its condition, not a guarantee
/// it still holds, so callers must loop:
///
/// ```ignore
/// let mut guard = lock.acquire().unwrap();
/// while !condition(&guard) {
///     guard = condvar.wait(guard);
/// }
/// ```
pub struct CondVar<S: Scheduler> {
    waiters: RawSpin<VecDeque<S::ThreadId>>,
}

impl<S: Scheduler> CondVar<S> {
    /// Creates a condition variable with no waiters.
    pub const fn new() -> Self {
        Self {
            waiters: RawSpin::new(VecDeque::new()),
        }
    }

    /// Atomically releases `guard`'s lock and blocks the calling thread,
    /// then reacquires the lock before returning.
    ///
    /// The caller must recheck its wait condition after this returns: a
    /// spurious or broadcast wakeup does not imply the condition holds.
    pub fn wait<'a, T>(&self, guard: LockGuard<'a, S, T>) -> LockGuard<'a, S, T> {
        let lock = guard.lock;
        self.waiters.lock().push_back(S::current());
        drop(guard);
        S::park();
        lock.acquire().unwrap_or_else(|_| {
            unreachable!("condvar waiter cannot already hold the lock it just released")
        })
    }

    /// Wakes one waiting thread, if any, in FIFO order.
    pub fn signal(&self) {
        let next = self.waiters.lock().pop_front();
        if let Some(thread) = next {
            S::unpark(thread);
        }
    }

    /// Wakes every currently waiting thread.
    pub fn broadcast(&self) {
        let mut waiters = self.waiters.lock();
        let drained: alloc::vec::Vec<_> = waiters.drain(..).collect();
        drop(waiters);
        for thread in drained {
            S::unpark(thread);
        }
    }
}

impl<S: Scheduler> Default for CondVar<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{StdScheduler, lock::Lock};

    #[test]
    fn signal_wakes_a_waiter_past_its_condition() {
        let lock = Arc::new(Lock::<StdScheduler, (bool, u32)>::new((false, 0)));
        let cvar = Arc::new(CondVar::<StdScheduler>::new());

        let lock2 = Arc::clone(&lock);
        let cvar2 = Arc::clone(&cvar);
        let handle = std::thread::spawn(move || {
            let mut guard = lock2.acquire().unwrap();
            while !guard.0 {
                guard = cvar2.wait(guard);
            }
            guard.1
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        {
            let mut guard = lock.acquire().unwrap();
            guard.0 = true;
            guard.1 = 42;
        }
        cvar.signal();

        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn broadcast_wakes_every_waiter() {
        let lock = Arc::new(Lock::<StdScheduler, bool>::new(false));
        let cvar = Arc::new(CondVar::<StdScheduler>::new());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let lock = Arc::clone(&lock);
            let cvar = Arc::clone(&cvar);
            handles.push(std::thread::spawn(move || {
                let mut guard = lock.acquire().unwrap();
                while !*guard {
                    guard = cvar.wait(guard);
                }
            }));
        }

        std::thread::sleep(std::time::Duration::from_millis(20));
        {
            let mut guard = lock.acquire().unwrap();
            *guard = true;
        }
        cvar.broadcast();

        for h in handles {
            h.join().unwrap();
        }
    }
}
