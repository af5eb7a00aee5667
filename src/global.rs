//! A `static KERNEL: KernelCell<...> = KernelCell::new();` home for the
//! single [`crate::Kernel`] a real kernel binary assembles once at boot
//! and never tears down except at shutdown (spec.md §9: "the free-sector
//! bitmap, swap bitmap, open-inode list, block cache, frame table, and
//! swap lock are process-wide singletons").
//!
//! [`Kernel`] itself stays a plain value so every host test can build as
//! many independent instances as it wants (see `crates/fs`'s own
//! `fresh_fs` pattern); this wrapper is only for the one binary-wide
//! instance a real kernel's `main` would publish.

use block_device::BlockDevice;
use once_init::OnceInit;
use sync::Scheduler;

use crate::Kernel;

/// A write-once cell holding the kernel singleton. `init` is meant to run
/// exactly once, from the boot path, after the scheduler and any device
/// drivers are up; every later call — interrupt handlers, syscall
/// dispatch — reaches the same instance through [`KernelCell::get`].
pub struct KernelCell<S: Scheduler, D: BlockDevice, W: BlockDevice>(OnceInit<Kernel<S, D, W>>);

impl<S: Scheduler, D: BlockDevice, W: BlockDevice> KernelCell<S, D, W> {
    #[must_use]
    pub const fn new() -> Self {
        Self(OnceInit::new())
    }

    /// Publishes `kernel` as the singleton. Panics if called twice —
    /// a second boot-time initialization is a kernel bug, not a
    /// recoverable condition, the same way `OnceInit::init` treats it.
    pub fn init(&self, kernel: Kernel<S, D, W>) {
        self.0.init(kernel);
    }

    /// Borrows the singleton. Panics if [`KernelCell::init`] hasn't run
    /// yet — there is no code path before boot completes that should be
    /// calling this.
    pub fn get(&self) -> &Kernel<S, D, W> {
        self.0.get()
    }
}

impl<S: Scheduler, D: BlockDevice, W: BlockDevice> Default for KernelCell<S, D, W> {
    fn default() -> Self {
        Self::new()
    }
}
