//! # libthread-core
//!
//! User-space threads and blocking synchronization built over a minimal
//! kernel interface: start a context, suspend self, wake a context, yield,
//! grow/shrink a memory region and install a fault handler.
//!
//! Layering, leaves first:
//!
//! - [`sync::atomic`] and [`sync::spinlock`]: the only busy-waiting code.
//! - [`sync::Mutex`], [`sync::Cond`], [`sync::Semaphore`], [`sync::RwLock`]:
//!   sleep-based primitives that block through [`kernel::Kernel`].
//! - [`thread::Runtime`]: thread create/join/exit/yield, the bucketed TCB
//!   registry, stack slot reuse and fault-driven stack growth.
//!
//! [`kernel::host::HostKernel`] implements the kernel interface on top of
//! OS threads so the whole runtime runs (and is tested) in a normal process.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod events;
#[allow(unsafe_code)]
pub mod kernel;
#[allow(unsafe_code)]
pub mod sync;
pub mod thread;

pub use config::RuntimeConfig;
pub use error::{ConfigError, KernelError, RuntimeError, SyncError, WakeError};
pub use kernel::{ContextId, Kernel, KernelRef};
pub use sync::{Cond, Mutex, MutexGuard, RwLock, RwLockMode, Semaphore, SpinLock};
pub use thread::{
    ExitStatus, PANIC_EXIT_STATUS, ROOT_THREAD, Runtime, StackInfo, ThreadId, ThreadState,
};
