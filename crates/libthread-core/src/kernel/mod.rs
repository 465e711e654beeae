//! The kernel collaborator interface.
//!
//! Everything above this module is written against [`Kernel`]: a handful of
//! scheduling and memory operations that a minimal kernel exposes to user
//! space. The runtime never makes scheduling decisions; it only asks for a
//! specific context to be suspended, woken or yielded to.
//!
//! [`host::HostKernel`] backs the interface with OS threads and a simulated
//! page-granular address space.

pub mod address_space;
pub mod host;
mod park;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, WakeError};

/// Kernel-level identity of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Code a new context starts executing.
pub type ContextEntry = Box<dyn FnOnce() + Send + 'static>;

/// Shared handle to the kernel collaborator.
pub type KernelRef = Arc<dyn Kernel>;

/// Why a fault was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCause {
    /// Access to an address with no backing page.
    PageFault,
    /// Any other trap (arithmetic, protection, illegal instruction).
    Other(u32),
}

/// Register state handed to a fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    /// Context that took the fault.
    pub context: ContextId,
    /// Faulting address.
    pub addr: usize,
    pub cause: FaultCause,
}

/// One-shot fault handler. After it returns the kernel reissues the faulting
/// access. A handler that wants future faults must install itself again.
pub type FaultHandler = Arc<dyn Fn(&dyn Kernel, &FaultInfo) + Send + Sync + 'static>;

/// Address range `[low, high)` of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRange {
    pub low: usize,
    pub high: usize,
}

impl StackRange {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.high - self.low
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.high == self.low
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.low && addr < self.high
    }
}

/// Unwind payload used by kernels that implement [`Kernel::terminate_self`]
/// by unwinding to the top of the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextExit;

/// Operations the runtime consumes from the underlying kernel.
pub trait Kernel: Send + Sync + 'static {
    /// Start a new context running `entry` with its stack pointer at
    /// `stack_top`. The page below `stack_top` must already be backed.
    fn start_context(&self, entry: ContextEntry, stack_top: usize)
    -> Result<ContextId, KernelError>;

    /// Suspend the caller until another context wakes it. Returns at once if
    /// `guard` is already false when the kernel commits to sleeping, so a
    /// wake that raced ahead of the suspension is never lost. May return
    /// early on a stale wake; callers loop on their own condition.
    fn suspend_self(&self, guard: &AtomicBool);

    /// Wake a context parked in [`Kernel::suspend_self`].
    fn wake(&self, target: ContextId) -> Result<(), WakeError>;

    /// Give up the processor, preferably to `target`.
    fn yield_to(&self, target: Option<ContextId>) -> Result<(), KernelError>;

    /// Back `[low, low + len)` with fresh zeroed pages.
    fn grow_region(&self, low: usize, len: usize) -> Result<(), KernelError>;

    /// Release the mapping created by a [`Kernel::grow_region`] at `base`.
    fn shrink_region(&self, base: usize) -> Result<(), KernelError>;

    /// Arm `handler` for the calling context, to run on `handler_stack`.
    fn install_fault_handler(
        &self,
        handler_stack: usize,
        handler: FaultHandler,
    ) -> Result<(), KernelError>;

    /// End the calling context.
    fn terminate_self(&self) -> !;

    /// End every context of the task with `status`.
    fn terminate_task(&self, status: i32) -> !;

    /// Identity of the calling context.
    fn current_kernel_identity(&self) -> ContextId;

    /// Granularity of [`Kernel::grow_region`].
    fn page_size(&self) -> usize;

    /// Stack the loader set up for the first context of the task.
    fn initial_stack(&self) -> StackRange;
}

/// Round `value` down to a multiple of `page`.
#[must_use]
pub const fn page_floor(value: usize, page: usize) -> usize {
    value & !(page - 1)
}

/// Round `value` up to a multiple of `page`; `None` if that overflows.
#[must_use]
pub const fn page_ceil(value: usize, page: usize) -> Option<usize> {
    match value.checked_add(page - 1) {
        Some(v) => Some(page_floor(v, page)),
        None => None,
    }
}
