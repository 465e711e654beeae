//! Synchronization primitives.
//!
//! Only [`atomic`] and [`spinlock`] busy-wait. Everything else blocks by
//! queueing the caller and suspending it through the kernel.

pub mod atomic;
pub mod cond;
pub mod mutex;
pub mod rwlock;
pub mod sem;
pub mod spinlock;
pub(crate) mod wait_queue;

pub use cond::Cond;
pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockMode, RwLockSnapshot};
pub use sem::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
