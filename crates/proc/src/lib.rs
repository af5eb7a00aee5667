//! Process / thread lifecycle glue: contract types only (spec.md §4.9).
//!
//! Thread scheduling itself is out of scope (the same `Scheduler` boundary
//! `sync` and `frame_table` use); what lives here is the bookkeeping a
//! kernel hangs off each schedulable thread — its children, its file
//! descriptors, its current directory, its address-space tables — and the
//! `exec`/`wait` handshake between a parent and a child it spawned.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use sync::{Lock, Scheduler, Semaphore};
use vm::{BackingFile, MmapTable, SupplementalTable};

/// A process's file-descriptor number, assigned starting at 2 (0 and 1 are
/// conventionally reserved for stdin/stdout by the syscall layer above this
/// crate; this crate just hands out unique numbers).
pub type Fd = u32;

/// The lowest fd this crate will ever assign via [`Thread::alloc_fd`].
pub const FIRST_FD: Fd = 2;

/// The record a parent keeps for each child it has spawned (spec.md §4.9
/// "a child-process record").
///
/// Lives as long as either the parent or the child needs it: the parent
/// holds it in [`Thread::children`] until `wait` consumes it; the child
/// reports into it via [`Self::report_load`] and [`Self::report_exit`]
/// without needing a pointer back to the parent (spec.md §9 "specify this
/// as an explicit message-passing teardown, not shared mutable pointers").
pub struct ChildProcess<S: Scheduler, Id> {
    pub child_id: Id,
    exit_status: Lock<S, Option<i32>>,
    load_completion: Semaphore<S>,
    parent_ack: Semaphore<S>,
    load_success: AtomicBool,
    zombie_signal: Semaphore<S>,
}

impl<S: Scheduler, Id> ChildProcess<S, Id> {
    pub fn new(child_id: Id) -> Self {
        Self {
            child_id,
            exit_status: Lock::new(None),
            load_completion: Semaphore::new(0),
            parent_ack: Semaphore::new(0),
            load_success: AtomicBool::new(false),
            zombie_signal: Semaphore::new(0),
        }
    }

    /// Called by the child once its executable has finished (or failed)
    /// loading, unblocking the parent's [`Self::await_load`].
    pub fn report_load(&self, success: bool) {
        self.load_success.store(success, Ordering::Release);
        if !success {
            log::warn!("proc: exec load failed, reporting -1 to the parent");
        }
        self.load_completion.up();
    }

    /// Blocks until the child reports load completion (spec.md §4.9:
    /// "`exec` downs the child's load-completion semaphore after thread
    /// creation"), returning whether the load succeeded.
    pub fn await_load(&self) -> bool {
        self.load_completion.down();
        self.load_success.load(Ordering::Acquire)
    }

    /// Called by the child when it exits, recording its status and waking
    /// a parent blocked in [`Self::await_exit`].
    pub fn report_exit(&self, status: i32) {
        *self.exit_status.acquire().unwrap() = Some(status);
        log::trace!("proc: child exited with status {status}");
        self.zombie_signal.up();
    }

    /// Blocks until the child exits, then returns its status exactly once
    /// (spec.md §4.9: "`wait` downs the zombie semaphore and returns the
    /// child's exit status exactly once"). Callers must drop the record
    /// after this returns; a second call would block forever.
    pub fn await_exit(&self) -> i32 {
        self.zombie_signal.down();
        self.exit_status
            .acquire()
            .unwrap()
            .expect("zombie_signal only fires after report_exit sets the status")
    }

    /// Releases the child, which is blocked in [`Self::wait_for_parent_ack`]
    /// until its exit status has been read, so it cannot tear down its
    /// resources (and this record along with them, if the parent drops its
    /// `Arc` on return from `wait`) before the parent has actually consumed
    /// the status.
    pub fn send_ack(&self) {
        self.parent_ack.up();
    }

    /// Called by the child after it has posted its exit status, before
    /// tearing down; blocks until the parent calls [`Self::send_ack`].
    pub fn wait_for_parent_ack(&self) {
        self.parent_ack.down();
    }
}

/// A schedulable thread's process-level bookkeeping (spec.md §4.9: "a
/// thread carries: id, parent pointer, list of immediate children, list of
/// file descriptors, current working directory handle, next-fd and
/// next-mapping counters, a supplemental page table, an mmap table").
///
/// There is no separate "next-mapping counter" field: `mmap_table` already
/// self-assigns mapping ids, so it doubles as the counter spec.md names.
pub struct Thread<S: Scheduler, Id, F: BackingFile> {
    pub id: Id,
    pub parent: Option<Id>,
    children: Lock<S, Vec<Arc<ChildProcess<S, Id>>>>,
    fds: Lock<S, BTreeMap<Fd, Arc<F>>>,
    next_fd: AtomicU32,
    /// Inode sector of the current working directory. A bare sector number
    /// rather than an `fs`-typed handle, so this crate doesn't depend on
    /// `fs`.
    cwd: Lock<S, u32>,
    pub sup_table: Arc<SupplementalTable<S, F>>,
    pub mmap_table: MmapTable<S, F>,
}

impl<S: Scheduler, Id: Copy + Eq, F: BackingFile> Thread<S, Id, F> {
    pub fn new(id: Id, parent: Option<Id>, cwd_sector: u32, sup_table: Arc<SupplementalTable<S, F>>) -> Self {
        Self {
            id,
            parent,
            children: Lock::new(Vec::new()),
            fds: Lock::new(BTreeMap::new()),
            next_fd: AtomicU32::new(FIRST_FD),
            cwd: Lock::new(cwd_sector),
            sup_table,
            mmap_table: MmapTable::new(),
        }
    }

    pub fn cwd(&self) -> u32 {
        *self.cwd.acquire().unwrap()
    }

    pub fn set_cwd(&self, sector: u32) {
        *self.cwd.acquire().unwrap() = sector;
    }

    /// Records a freshly spawned child, returning the shared record the
    /// caller hands to the new thread (to call [`ChildProcess::report_load`]
    /// / [`ChildProcess::report_exit`] on) and keeps for itself (to call
    /// [`ChildProcess::await_load`] / [`ChildProcess::await_exit`] on).
    pub fn spawn_child(&self, child_id: Id) -> Arc<ChildProcess<S, Id>> {
        let record = Arc::new(ChildProcess::new(child_id));
        self.children.acquire().unwrap().push(record.clone());
        record
    }

    /// Removes and returns the child record for `child_id`, if this thread
    /// is its parent and hasn't already waited on it (spec.md: "returns the
    /// child's exit status exactly once" — taking the record out of
    /// `children` here is what enforces that a second `wait(child_id)`
    /// finds nothing to wait on).
    pub fn take_child(&self, child_id: Id) -> Option<Arc<ChildProcess<S, Id>>> {
        let mut children = self.children.acquire().unwrap();
        let index = children.iter().position(|c| c.child_id == child_id)?;
        Some(children.remove(index))
    }

    /// Assigns the next never-before-used fd to `file`.
    pub fn alloc_fd(&self, file: Arc<F>) -> Fd {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.fds.acquire().unwrap().insert(fd, file);
        fd
    }

    pub fn file(&self, fd: Fd) -> Option<Arc<F>> {
        self.fds.acquire().unwrap().get(&fd).cloned()
    }

    pub fn close_fd(&self, fd: Fd) -> Option<Arc<F>> {
        self.fds.acquire().unwrap().remove(&fd)
    }

    /// Every currently open fd's file, for process exit to close each in
    /// turn without holding `fds`'s lock across the close calls.
    pub fn open_files(&self) -> Vec<(Fd, Arc<F>)> {
        self.fds
            .acquire()
            .unwrap()
            .iter()
            .map(|(&fd, file)| (fd, file.clone()))
            .collect()
    }
}

/// Process-wide registry of every live thread's bookkeeping, analogous to
/// [`vm::VmRegistry`]'s per-owner supplemental-table map.
pub struct ProcessTable<S: Scheduler, Id: Copy + Eq + Ord, F: BackingFile> {
    threads: Lock<S, BTreeMap<Id, Arc<Thread<S, Id, F>>>>,
}

impl<S: Scheduler, Id: Copy + Eq + Ord, F: BackingFile> ProcessTable<S, Id, F> {
    pub fn new() -> Self {
        Self {
            threads: Lock::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, thread: Arc<Thread<S, Id, F>>) {
        self.threads.acquire().unwrap().insert(thread.id, thread);
    }

    pub fn get(&self, id: Id) -> Option<Arc<Thread<S, Id, F>>> {
        self.threads.acquire().unwrap().get(&id).cloned()
    }

    /// Removes `id`'s bookkeeping. Callers must have already torn down its
    /// supplemental table and mmap table.
    pub fn remove(&self, id: Id) -> Option<Arc<Thread<S, Id, F>>> {
        self.threads.acquire().unwrap().remove(&id)
    }
}

impl<S: Scheduler, Id: Copy + Eq + Ord, F: BackingFile> Default for ProcessTable<S, Id, F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use sync::StdScheduler;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Unreachable;

    #[derive(Default)]
    struct FakeFile {
        data: RefCell<Vec<u8>>,
    }

    impl BackingFile for FakeFile {
        type Error = Unreachable;

        fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Unreachable> {
            let data = self.data.borrow();
            let offset = offset as usize;
            let n = buf.len().min(data.len().saturating_sub(offset));
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }

        fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, Unreachable> {
            let mut data = self.data.borrow_mut();
            let offset = offset as usize;
            if data.len() < offset + buf.len() {
                data.resize(offset + buf.len(), 0);
            }
            data[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    type TestThread = Thread<StdScheduler, u32, FakeFile>;

    fn thread(id: u32, parent: Option<u32>) -> TestThread {
        Thread::new(id, parent, 2, Arc::new(SupplementalTable::new()))
    }

    #[test]
    fn exec_handshake_reports_load_failure() {
        let parent = thread(1, None);
        let record = parent.spawn_child(2);
        record.report_load(false);
        assert!(!record.await_load());
    }

    #[test]
    fn exec_handshake_reports_load_success() {
        let parent = thread(1, None);
        let record = parent.spawn_child(2);
        record.report_load(true);
        assert!(record.await_load());
    }

    #[test]
    fn wait_returns_exit_status_exactly_once() {
        let parent = thread(1, None);
        let record = parent.spawn_child(2);
        record.report_exit(7);
        assert_eq!(record.await_exit(), 7);

        // The record is no longer reachable from `parent` after `take_child`
        // consumes it: a second `wait` on the same child id finds nothing.
        assert!(parent.take_child(2).is_none());
    }

    #[test]
    fn take_child_removes_the_record_so_a_second_wait_finds_nothing() {
        let parent = thread(1, None);
        let record = parent.spawn_child(2);
        record.report_exit(0);

        let taken = parent.take_child(2).unwrap();
        assert_eq!(taken.await_exit(), 0);
        assert!(parent.take_child(2).is_none());
    }

    #[test]
    fn parent_ack_unblocks_child_teardown_only_after_send_ack() {
        let parent = thread(1, None);
        let record = parent.spawn_child(2);
        record.report_exit(3);
        assert_eq!(record.await_exit(), 3);

        let child_record = record.clone();
        let child = std::thread::spawn(move || {
            child_record.wait_for_parent_ack();
            "torn down"
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(!child.is_finished());

        record.send_ack();
        assert_eq!(child.join().unwrap(), "torn down");
    }

    #[test]
    fn fd_allocation_starts_at_first_fd_and_is_unique() {
        let t = thread(1, None);
        let a = t.alloc_fd(Arc::new(FakeFile::default()));
        let b = t.alloc_fd(Arc::new(FakeFile::default()));
        assert_eq!(a, FIRST_FD);
        assert_eq!(b, FIRST_FD + 1);
        assert!(t.file(a).is_some());
        assert!(t.close_fd(a).is_some());
        assert!(t.file(a).is_none());
    }

    #[test]
    fn cwd_starts_at_constructed_sector_and_is_mutable() {
        let t = thread(1, None);
        assert_eq!(t.cwd(), 2);
        t.set_cwd(42);
        assert_eq!(t.cwd(), 42);
    }

    #[test]
    fn process_table_round_trips_by_id() {
        let table: ProcessTable<StdScheduler, u32, FakeFile> = ProcessTable::new();
        table.insert(Arc::new(thread(1, None)));
        assert_eq!(table.get(1).map(|t| t.id), Some(1));
        assert!(table.get(2).is_none());
        table.remove(1);
        assert!(table.get(1).is_none());
    }
}
