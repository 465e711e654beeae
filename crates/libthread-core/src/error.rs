//! Error types.
//!
//! Only recoverable conditions are values here: invalid arguments to
//! `init`-style calls and resource exhaustion. Protocol violations
//! (destroy while busy, use before init, double unlock) panic at the call
//! site, and unrecoverable faults end the task through the kernel.

use thiserror::Error;

use crate::kernel::ContextId;
use crate::thread::ThreadId;

/// Failure reported by a [`crate::kernel::Kernel`] operation.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("region [{low:#x}, +{len:#x}) is not page aligned")]
    Misaligned { low: usize, len: usize },
    #[error("region [{low:#x}, +{len:#x}) overlaps an existing mapping")]
    Overlap { low: usize, len: usize },
    #[error("memory limit reached: {requested} bytes requested, {available} available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("no mapping starts at {addr:#x}")]
    NotMapped { addr: usize },
    #[error("address {addr:#x} is not backed")]
    Unbacked { addr: usize },
    #[error("page size {0:#x} is not a power of two")]
    BadPageSize(usize),
    #[error("no such context: {0}")]
    NoSuchContext(ContextId),
    #[error("context limit of {limit} reached")]
    ContextLimit { limit: usize },
    #[error("failed to spawn host context: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Result of [`crate::kernel::Kernel::wake`] when the target is not parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WakeError {
    #[error("target context has not suspended yet")]
    NotYetSuspended,
}

/// Failure from an `init`-style call on a synchronization primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("primitive is already initialized")]
    AlreadyInitialized,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Rejected runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
    #[error("{field} ({value:#x}) does not fit in the address space")]
    TooLarge { field: &'static str, value: usize },
    #[error("max_stack_size ({max:#x}) is smaller than stack_size ({stack:#x})")]
    MaxBelowInitial { stack: usize, max: usize },
    #[error("invalid value {value:?} for {key}")]
    Parse { key: &'static str, value: String },
    #[error("malformed configuration document: {0}")]
    Document(String),
}

/// Failure from a thread lifecycle operation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no stack slot left below {frontier:#x}")]
    StackExhausted { frontier: usize },
    #[error("failed to back stack for new thread")]
    StackBacking(#[source] KernelError),
    #[error("kernel refused to start context")]
    ContextCreation(#[source] KernelError),
    #[error("no such thread: {0}")]
    NoSuchThread(ThreadId),
    #[error("thread {0} already has a joiner")]
    AlreadyJoined(ThreadId),
    #[error("thread {0} cannot join itself")]
    JoinSelf(ThreadId),
    #[error("calling context {0} is not a thread of this runtime")]
    UnknownContext(ContextId),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}
