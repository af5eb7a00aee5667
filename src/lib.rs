//! `pintos-core`: wires the primitive crates in this workspace behind one
//! facade (spec.md §2 "system overview" describes the pieces; this module
//! is where they actually compose). Grounded on `kernel/src/lib.rs`'s
//! top-level module list and its `main()` boot sequence, re-expressed as a
//! library a real kernel's syscall layer calls into rather than a
//! `no_mangle extern "C" fn main`.
//!
//! Scheduling, the page-fault trap itself, the syscall dispatch table, and
//! the hardware page directory remain external collaborators (spec.md
//! §1): this crate supplies the data structures and the glue between them,
//! not a bootable kernel.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod error;
mod file;
mod global;
mod ids;
pub mod testing;

use alloc::sync::Arc;

use block_device::BlockDevice;
use fs::{FileSystem, FsError, Resolved};
use frame_table::FrameTable;
use proc::{ChildProcess, Fd, ProcessTable, Thread};
use sync::Scheduler;
use vm::{Installer, VmRegistry};

pub use error::KernelError;
pub use file::FileHandle;
pub use global::KernelCell;
pub use ids::{Pid, PidAllocator};

/// The assembled kernel data plane: one file system, one frame table, one
/// virtual-memory registry (supplemental tables plus the swap area), and
/// one process table.
///
/// Field order is declaration order, which is also struct-field drop
/// order in Rust; it's written here as the *reverse* of
/// [`Kernel::new`]'s construction order, so an ordinary drop tears
/// everything down in the order spec.md §9 requires ("initialize in a
/// well-defined startup order ... and tear down in reverse") without any
/// explicit teardown code beyond [`Kernel::shutdown`]'s final flush.
pub struct Kernel<S: Scheduler, D: BlockDevice, W: BlockDevice> {
    pub procs: ProcessTable<S, Pid, FileHandle<S, D>>,
    pub frame_table: FrameTable<S, Pid>,
    pub vm: VmRegistry<S, Pid, W, FileHandle<S, D>>,
    pub fs: Arc<FileSystem<S, D>>,
    pids: PidAllocator,
}

/// Downs `record`'s load-completion semaphore and turns the result into
/// the `exec` return value spec.md §6 names: the child's pid on success,
/// `-1` on load failure. A free function, not a `Kernel` method, since
/// only `S` (carried by `record`) matters here — pinning `D`/`W` as well
/// would force every caller to spell out device types the call doesn't
/// use, the same reason `vm::route_fault` and `vm::should_grow_stack`
/// live outside any `impl` block.
#[must_use]
pub fn await_exec<S: Scheduler>(child_id: Pid, record: &ChildProcess<S, Pid>) -> i32 {
    if record.await_load() {
        i32::try_from(child_id.get()).unwrap_or(i32::MAX)
    } else {
        -1
    }
}

impl<S: Scheduler, D: BlockDevice, W: BlockDevice> Kernel<S, D, W> {
    /// Formats a fresh file system on `fs_device` and assembles a kernel
    /// around it, a `frame_count`-frame table, and an empty swap area on
    /// `swap_device`.
    #[must_use]
    pub fn new(fs_device: D, swap_device: W, frame_count: usize) -> Self {
        let fs = Arc::new(FileSystem::format(fs_device));
        let vm = VmRegistry::new(swap_device);
        let frame_table = FrameTable::new(frame_count);
        let procs = ProcessTable::new();
        Self {
            procs,
            frame_table,
            vm,
            fs,
            pids: PidAllocator::new(),
        }
    }

    /// Mounts an existing file system from `fs_device` instead of
    /// formatting a fresh one.
    pub fn load(fs_device: D, swap_device: W, frame_count: usize) -> Result<Self, KernelError> {
        let fs = Arc::new(FileSystem::load(fs_device)?);
        let vm = VmRegistry::new(swap_device);
        let frame_table = FrameTable::new(frame_count);
        let procs = ProcessTable::new();
        Ok(Self {
            procs,
            frame_table,
            vm,
            fs,
            pids: PidAllocator::new(),
        })
    }

    /// Flushes the cache and logs the outcome; callers drop `self`
    /// afterward to run the rest of the reverse-teardown sequence.
    pub fn shutdown(self) {
        if let Err(err) = self.fs.flush() {
            log::warn!("pintos-core: flush during shutdown failed: {err}");
        }
    }

    /// Registers the first thread of a fresh process tree (no parent,
    /// e.g. the initial user process), rooted at `cwd_sector`.
    pub fn spawn_root(&self, cwd_sector: u32) -> Pid {
        let id = self.pids.alloc();
        let sup_table = self.vm.table(id);
        self.procs.insert(Arc::new(Thread::new(id, None, cwd_sector, sup_table)));
        id
    }

    /// Registers a new child of `parent`, returning its id and the shared
    /// [`ChildProcess`] record spec.md §4.9's `exec`/`wait` handshake runs
    /// over. The caller hands the record to whatever drives the new
    /// thread (to call `report_load`/`report_exit` on) and keeps using
    /// `parent`'s copy (via [`Kernel::await_exec`] / [`Kernel::wait`]).
    pub fn spawn_child(&self, parent: Pid, cwd_sector: u32) -> Result<(Pid, Arc<ChildProcess<S, Pid>>), KernelError> {
        let parent_thread = self.procs.get(parent).ok_or(KernelError::NoSuchProcess)?;
        let child_id = self.pids.alloc();
        let record = parent_thread.spawn_child(child_id);
        let sup_table = self.vm.table(child_id);
        self.procs
            .insert(Arc::new(Thread::new(child_id, Some(parent), cwd_sector, sup_table)));
        Ok((child_id, record))
    }

    /// Downs the zombie semaphore for `child`, returns its exit status
    /// exactly once, then acks so the child's own `exit` call (blocked in
    /// `wait_for_parent_ack`) can finish tearing down.
    pub fn wait(&self, parent: Pid, child: Pid) -> Option<i32> {
        let parent_thread = self.procs.get(parent)?;
        let record = parent_thread.take_child(child)?;
        let status = record.await_exit();
        record.send_ack();
        Some(status)
    }

    /// Tears down `id`'s address space and open files, then — if
    /// `own_record` is `Some` (this thread has a parent watching it) —
    /// reports `status` and blocks until [`Kernel::wait`] acks it, per
    /// spec.md §4.9's parent-ack handshake, before removing `id` from the
    /// process table.
    pub fn exit<Dir>(&self, dir: &Dir, id: Pid, status: i32, own_record: Option<&ChildProcess<S, Pid>>) -> Result<(), KernelError>
    where
        Dir: frame_table::PageDirectory<Pid>,
    {
        let thread = self.procs.get(id).ok_or(KernelError::NoSuchProcess)?;

        if let Err(err) = thread.mmap_table.exit(&thread.sup_table, &self.frame_table, dir, id) {
            log::warn!("pintos-core: mmap write-back during exit of {id} failed: {err}");
        }
        thread.sup_table.exit(&self.frame_table, dir);
        self.vm.forget(id);

        for (_, file) in thread.open_files() {
            drop(file);
        }

        if let Some(record) = own_record {
            record.report_exit(status);
            record.wait_for_parent_ack();
        }

        self.procs.remove(id);
        Ok(())
    }

    /// Routes a page fault through `vm::route_fault`. Returns `false` if
    /// the access was illegal (spec.md §7: the caller should exit the
    /// faulting process with status `-1`).
    pub fn handle_page_fault<Dir>(&self, dir: &Dir, owner: Pid, fault_addr: usize, esp: usize, is_user_fault: bool) -> bool
    where
        Dir: frame_table::PageDirectory<Pid> + Installer<Pid>,
    {
        match vm::route_fault(&self.vm, &self.frame_table, dir, owner, fault_addr, esp, is_user_fault) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("pintos-core: page fault for {owner} at {fault_addr:#x} unresolved: {err:?}");
                false
            }
        }
    }

    pub fn create(&self, dir_sector: u32, name: &str, size: u32) -> bool {
        self.fs.create(dir_sector, name, size).is_ok()
    }

    pub fn open(&self, owner: Pid, dir_sector: u32, name: &str) -> Result<Fd, KernelError> {
        let thread = self.procs.get(owner).ok_or(KernelError::NoSuchProcess)?;
        let file = self.fs.open_file(dir_sector, name)?;
        Ok(thread.alloc_fd(FileHandle::new(file)))
    }

    pub fn remove(&self, dir_sector: u32, name: &str) -> bool {
        self.fs.remove(dir_sector, name).is_ok()
    }

    pub fn mkdir(&self, dir_sector: u32, name: &str) -> bool {
        self.fs.mkdir(dir_sector, name).is_ok()
    }

    pub fn read(&self, owner: Pid, fd: Fd, buf: &mut [u8]) -> Result<usize, KernelError> {
        Ok(self.file(owner, fd)?.read(buf)?)
    }

    pub fn write(&self, owner: Pid, fd: Fd, buf: &[u8]) -> Result<usize, KernelError> {
        Ok(self.file(owner, fd)?.write(buf)?)
    }

    pub fn seek(&self, owner: Pid, fd: Fd, position: u64) -> Result<(), KernelError> {
        self.file(owner, fd)?.seek(position);
        Ok(())
    }

    pub fn tell(&self, owner: Pid, fd: Fd) -> Result<u64, KernelError> {
        Ok(self.file(owner, fd)?.tell())
    }

    pub fn filesize(&self, owner: Pid, fd: Fd) -> Result<u64, KernelError> {
        Ok(self.file(owner, fd)?.length()?)
    }

    pub fn isdir(&self, owner: Pid, fd: Fd) -> Result<bool, KernelError> {
        Ok(self.file(owner, fd)?.isdir()?)
    }

    pub fn inumber(&self, owner: Pid, fd: Fd) -> Result<u32, KernelError> {
        Ok(self.file(owner, fd)?.inumber())
    }

    pub fn close(&self, owner: Pid, fd: Fd) -> Result<(), KernelError> {
        let thread = self.procs.get(owner).ok_or(KernelError::NoSuchProcess)?;
        thread.close_fd(fd).ok_or(KernelError::BadFd)?;
        Ok(())
    }

    pub fn chdir(&self, owner: Pid, path: &str) -> Result<(), KernelError> {
        let thread = self.procs.get(owner).ok_or(KernelError::NoSuchProcess)?;
        match self.fs.resolve(thread.cwd(), path)? {
            Resolved::Dir { sector } => {
                thread.set_cwd(sector);
                Ok(())
            }
            Resolved::File { .. } => Err(KernelError::Fs(FsError::NotADirectory)),
        }
    }

    /// Lists the next live entry of the directory at `dir_sector`. Callers
    /// holding an open fd on a directory get its sector from
    /// [`Kernel::inumber`] first (spec.md §6's `readdir` acts on an open
    /// directory fd; `inumber` is how this facade recovers the sector that
    /// identifies without threading a directory-shaped fd type through
    /// `fs::FileSystem`, which only knows sectors).
    pub fn readdir(&self, dir_sector: u32, cursor: &mut u64) -> Result<Option<fs::DirEntry>, KernelError> {
        Ok(self.fs.readdir(dir_sector, cursor)?)
    }

    pub fn mmap(&self, owner: Pid, fd: Fd, start_addr: usize) -> Result<u32, KernelError> {
        let thread = self.procs.get(owner).ok_or(KernelError::NoSuchProcess)?;
        let file = thread.file(fd).ok_or(KernelError::BadFd)?;
        let size = file.length()?;
        Ok(thread.mmap_table.mmap(&thread.sup_table, file, size, start_addr)?)
    }

    pub fn munmap<Dir>(&self, dir: &Dir, owner: Pid, mapping_id: u32) -> Result<(), KernelError>
    where
        Dir: frame_table::PageDirectory<Pid>,
    {
        let thread = self.procs.get(owner).ok_or(KernelError::NoSuchProcess)?;
        thread
            .mmap_table
            .munmap(&thread.sup_table, &self.frame_table, dir, owner, mapping_id)?;
        Ok(())
    }

    fn file(&self, owner: Pid, fd: Fd) -> Result<Arc<FileHandle<S, D>>, KernelError> {
        let thread = self.procs.get(owner).ok_or(KernelError::NoSuchProcess)?;
        thread.file(fd).ok_or(KernelError::BadFd)
    }
}

#[cfg(test)]
mod tests {
    use block_device::MemBlockDevice;
    use sync::StdScheduler;

    use super::*;
    use crate::testing::InMemoryPageDirectory;

    type TestKernel = Kernel<StdScheduler, MemBlockDevice, MemBlockDevice>;

    fn fresh() -> TestKernel {
        Kernel::new(MemBlockDevice::new(256), MemBlockDevice::new(64), 8)
    }

    #[test]
    fn create_write_close_reopen_read_roundtrips_through_the_facade() {
        let kernel = fresh();
        let owner = kernel.spawn_root(fs::ROOT_DIR_SECTOR);

        assert!(kernel.create(fs::ROOT_DIR_SECTOR, "a", 0));
        let fd = kernel.open(owner, fs::ROOT_DIR_SECTOR, "a").unwrap();
        assert_eq!(kernel.write(owner, fd, b"hello").unwrap(), 5);
        kernel.close(owner, fd).unwrap();

        let fd = kernel.open(owner, fs::ROOT_DIR_SECTOR, "a").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(kernel.read(owner, fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(kernel.filesize(owner, fd).unwrap(), 5);
    }

    #[test]
    fn mkdir_chdir_create_readdir_round_trips() {
        let kernel = fresh();
        let owner = kernel.spawn_root(fs::ROOT_DIR_SECTOR);

        assert!(kernel.mkdir(fs::ROOT_DIR_SECTOR, "d"));
        kernel.chdir(owner, "/d").unwrap();
        let cwd = kernel.procs.get(owner).unwrap().cwd();
        assert!(kernel.create(cwd, "x", 0));

        let mut cursor = 0;
        let mut names = alloc::vec::Vec::new();
        while let Some(entry) = kernel.readdir(cwd, &mut cursor).unwrap() {
            names.push(entry.name);
        }
        assert_eq!(names, alloc::vec![alloc::string::String::from("x")]);
    }

    #[test]
    fn wait_returns_exit_status_once_and_unblocks_child_teardown() {
        let kernel = fresh();
        let parent = kernel.spawn_root(fs::ROOT_DIR_SECTOR);
        let (child_id, record) = kernel.spawn_child(parent, fs::ROOT_DIR_SECTOR).unwrap();
        record.report_load(true);
        assert_eq!(await_exec(child_id, &record), i32::try_from(child_id.get()).unwrap());

        let dir = InMemoryPageDirectory::<StdScheduler, Pid>::new();
        let handle = std::thread::scope(|scope| {
            let kernel = &kernel;
            let record = &record;
            let h = scope.spawn(move || {
                kernel.exit(&dir, child_id, 7, Some(record)).unwrap();
            });
            std::thread::sleep(std::time::Duration::from_millis(10));
            assert!(!h.is_finished(), "child must block on parent ack before tearing down");
            h
        });
        assert_eq!(kernel.wait(parent, child_id), Some(7));
        handle.join().unwrap();
        assert_eq!(kernel.wait(parent, child_id), None);
    }

    #[test]
    fn page_fault_grows_the_stack_and_is_resident_afterward() {
        let kernel = fresh();
        let owner = kernel.spawn_root(fs::ROOT_DIR_SECTOR);
        let dir = InMemoryPageDirectory::<StdScheduler, Pid>::new();

        let esp = 0x8048000;
        assert!(kernel.handle_page_fault(&dir, owner, esp - 4, esp, true));
        assert!(dir.is_writable(owner, (esp - 4) & !(frame_table::PAGE_SIZE - 1)));
    }

    #[test]
    fn mmap_then_munmap_round_trips_file_contents() {
        let kernel = fresh();
        let owner = kernel.spawn_root(fs::ROOT_DIR_SECTOR);
        let dir = InMemoryPageDirectory::<StdScheduler, Pid>::new();

        assert!(kernel.create(fs::ROOT_DIR_SECTOR, "m", 0));
        let fd = kernel.open(owner, fs::ROOT_DIR_SECTOR, "m").unwrap();
        kernel.write(owner, fd, &[b'x'; 6000]).unwrap();

        let mapping = kernel.mmap(owner, fd, 0x4000_0000).unwrap();
        assert!(kernel.handle_page_fault(&dir, owner, 0x4000_0000 + 10, 0, false));
        dir.mark_dirty(owner, 0x4000_0000);
        kernel.munmap(&dir, owner, mapping).unwrap();

        let fd2 = kernel.open(owner, fs::ROOT_DIR_SECTOR, "m").unwrap();
        let mut buf = [0u8; 6000];
        kernel.read(owner, fd2, &mut buf).unwrap();
        assert_eq!(buf[10], b'x');
    }
}
