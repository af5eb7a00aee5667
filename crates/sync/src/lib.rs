//! Synchronization primitives (spec.md §4.1).
//!
//! The kernel these primitives are meant for schedules cooperatively on a
//! single CPU, suspending a thread only at well-defined points: a semaphore
//! `down`, a lock acquisition, a condition-variable wait, or disk I/O. The
//! scheduler itself is out of scope here (spec.md §1 treats it as an
//! external collaborator) and is represented abstractly by the
//! [`Scheduler`] trait: `park` suspends the calling thread until a matching
//! `unpark`, with the same "wake-before-sleep still wakes" guarantee
//! `std::thread::park`/`unpark` gives, which is what the `std`-backed test
//! scheduler below uses directly.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod condvar;
mod lock;
mod raw_spin;
mod rwlock;
mod semaphore;

pub use condvar::CondVar;
pub use lock::{Lock, LockError, LockGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;

/// The scheduler contract assumed by every primitive in this crate.
///
/// A real kernel implements this on top of its thread control blocks and
/// ready queue. `park` must suspend the calling thread until a later (or
/// already-pending) `unpark` targeting the same thread id wakes it;
/// crucially, an `unpark` that happens before the matching `park` must not
/// be lost (this is exactly `std::thread::Thread::unpark`'s contract).
pub trait Scheduler {
    /// Opaque identity of a schedulable thread.
    type ThreadId: Copy + Eq;

    /// Returns the identity of the calling thread.
    fn current() -> Self::ThreadId;

    /// Blocks the calling thread until `unpark(Self::current())` is called,
    /// including a call that raced ahead of this one.
    fn park();

    /// Wakes `thread` if it is parked, or arms a pending wakeup if it parks
    /// later before observing this call.
    fn unpark(thread: Self::ThreadId);
}

/// A [`Scheduler`] backed by real OS threads, for host-side tests.
///
/// Not part of the kernel's production configuration: the kernel provides
/// its own `Scheduler` impl atop its thread control blocks. This exists so
/// every primitive here can be exercised under genuine concurrency without
/// a real scheduler.
#[cfg(any(test, feature = "std-scheduler"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct StdScheduler;

#[cfg(any(test, feature = "std-scheduler"))]
impl Scheduler for StdScheduler {
    type ThreadId = std::thread::ThreadId;

    fn current() -> Self::ThreadId {
        std_scheduler::registry().register_current();
        std::thread::current().id()
    }

    fn park() {
        std_scheduler::registry().register_current();
        std::thread::park();
    }

    fn unpark(thread: Self::ThreadId) {
        std_scheduler::registry().unpark(thread);
    }
}

#[cfg(any(test, feature = "std-scheduler"))]
extern crate std;

#[cfg(any(test, feature = "std-scheduler"))]
mod std_scheduler {
    use std::{
        collections::HashMap,
        sync::{Mutex, OnceLock},
        thread::{Thread, ThreadId},
    };

    /// Maps thread ids back to `Thread` handles so `unpark(id)` is possible;
    /// `std::thread` only exposes "unpark the handle you already have".
    pub(super) struct Registry(Mutex<HashMap<ThreadId, Thread>>);

    impl Registry {
        pub(super) fn register_current(&self) {
            let cur = std::thread::current();
            self.0.lock().unwrap().entry(cur.id()).or_insert(cur);
        }

        pub(super) fn unpark(&self, id: ThreadId) {
            if let Some(t) = self.0.lock().unwrap().get(&id) {
                t.unpark();
            }
        }
    }

    pub(super) fn registry() -> &'static Registry {
        static REG: OnceLock<Registry> = OnceLock::new();
        REG.get_or_init(|| Registry(Mutex::new(HashMap::new())))
    }
}
