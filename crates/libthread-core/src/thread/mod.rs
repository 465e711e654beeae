//! Thread lifecycle: create, exit, join, yield and identity lookup.
//!
//! A [`Runtime`] is the whole task's threading state: the kernel handle, the
//! TCB registry, the context index used to find the caller's own TCB, the
//! stack allocator and the id counter. It is created once with
//! [`Runtime::init`] by the task's first context, which becomes thread 0.
//!
//! ## Exit/join hand-over
//!
//! Each TCB has a private mutex + condvar. Whichever of `exit` and `join`
//! arrives second completes the hand-over: a late joiner collects the
//! pending status at once, a late exit signals the sleeping joiner. At most
//! one joiner is accepted. The joiner reclaims the TCB and returns the stack
//! slot to the free-list.

pub mod autostack;
pub mod registry;
pub mod stack;
pub mod tcb;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use self::registry::Registry;
use self::stack::{StackAllocator, StackLayout, StackSlot};
use self::tcb::Tcb;
pub use self::tcb::{StackInfo, ThreadState};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::events::{EventKind, EventLog};
use crate::kernel::{ContextEntry, ContextExit, ContextId, KernelRef};
use crate::sync::Mutex;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Opaque pointer-sized value a thread hands to its joiner.
pub type ExitStatus = usize;

/// Status recorded for a thread whose entry panicked.
pub const PANIC_EXIT_STATUS: ExitStatus = usize::MAX;

/// Library-level thread identity. Never reused within one runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub u32);

/// The context that called [`Runtime::init`].
pub const ROOT_THREAD: ThreadId = ThreadId(0);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TaskState {
    next_tid: u32,
    live_threads: usize,
}

struct Inner {
    kernel: KernelRef,
    config: RuntimeConfig,
    threads: Registry<ThreadId, Arc<Tcb>>,
    contexts: Registry<ContextId, ThreadId>,
    stacks: StackAllocator,
    task: Mutex<TaskState>,
    events: Arc<EventLog>,
}

/// Handle to a task's threading runtime. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    /// Set up the runtime from the calling context, which becomes
    /// [`ROOT_THREAD`]. Its stack is the kernel's initial stack, with the
    /// same growth limit as every other thread.
    pub fn init(kernel: KernelRef, config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let page = kernel.page_size();
        let config = config.validate(page)?;
        let root_stack = kernel.initial_stack();
        let root_floor = root_stack
            .high
            .saturating_sub(config.max_stack_size.max(root_stack.len()));
        let frontier = root_floor
            .checked_sub(page)
            .ok_or(RuntimeError::StackExhausted {
                frontier: root_floor,
            })?;
        let layout = StackLayout {
            page_size: page,
            stack_size: config.stack_size,
            max_stack_size: config.max_stack_size,
        };

        let root = Arc::new(Tcb::root(&kernel, ROOT_THREAD, root_stack, root_floor));
        let root_context = kernel.current_kernel_identity();
        root.publish_kernel_id(root_context);

        let threads = Registry::new(config.registry_buckets);
        let contexts = Registry::new(config.registry_buckets);
        let fresh = threads.insert(ROOT_THREAD, Arc::clone(&root)).is_ok()
            && contexts.insert(root_context, ROOT_THREAD).is_ok();
        debug_assert!(fresh, "empty registries rejected the root thread");

        let events = Arc::new(EventLog::new(config.event_capacity));
        autostack::install(&*kernel, &root, &events, root_stack.high)?;
        events.record(
            Some(ROOT_THREAD.0),
            EventKind::RuntimeStarted {
                root_context,
                stack_high: root_stack.high,
            },
        );
        debug!(
            "runtime up: root {root_context}, stack [{:#x}, {:#x}), slots from {frontier:#x}",
            root_stack.low, root_stack.high
        );

        Ok(Self {
            inner: Arc::new(Inner {
                stacks: StackAllocator::new(&kernel, layout, frontier),
                task: Mutex::new(
                    KernelRef::clone(&kernel),
                    TaskState {
                        next_tid: ROOT_THREAD.0 + 1,
                        live_threads: 1,
                    },
                ),
                kernel,
                config,
                threads,
                contexts,
                events,
            }),
        })
    }

    /// [`Runtime::init`] with defaults and the given initial stack size.
    pub fn with_stack_size(kernel: KernelRef, stack_size: usize) -> Result<Self, RuntimeError> {
        Self::init(kernel, RuntimeConfig::with_stack_size(stack_size))
    }

    /// Start a thread running `entry(arg)`. If `entry` returns, its value
    /// becomes the exit status.
    pub fn create<F, A>(&self, entry: F, arg: A) -> Result<ThreadId, RuntimeError>
    where
        F: FnOnce(A) -> ExitStatus + Send + 'static,
        A: Send + 'static,
    {
        let inner = &self.inner;
        let (slot, reused) = inner.stacks.acquire()?;
        let tid = {
            let mut task = inner.task.lock();
            let tid = ThreadId(task.next_tid);
            task.next_tid += 1;
            task.live_threads += 1;
            tid
        };

        if let Err(err) = inner.kernel.grow_region(slot.initial_low, slot.initial_len()) {
            self.abandon(tid, slot, false, &err);
            return Err(RuntimeError::StackBacking(err));
        }

        let tcb = Arc::new(Tcb::child(&inner.kernel, tid, slot));
        let fresh = inner.threads.insert(tid, Arc::clone(&tcb)).is_ok();
        debug_assert!(fresh, "thread id {tid} handed out twice");

        let runtime = self.clone();
        let child = Arc::clone(&tcb);
        let start: ContextEntry = Box::new(move || runtime.trampoline(&child, entry, arg));
        match inner.kernel.start_context(start, slot.stack_high) {
            Ok(context) => {
                tcb.publish_kernel_id(context);
                inner.events.record(
                    Some(tid.0),
                    EventKind::ThreadCreated {
                        stack_high: slot.stack_high,
                        reused_stack: reused,
                    },
                );
                debug!("thread {tid} created on {context}, stack top {:#x}", slot.top);
                Ok(tid)
            }
            Err(err) => {
                inner.threads.remove(&tid);
                tcb.abandon();
                self.abandon(tid, slot, true, &err);
                Err(RuntimeError::ContextCreation(err))
            }
        }
    }

    /// Undo a `create` that failed after taking a slot and an id.
    fn abandon(&self, tid: ThreadId, slot: StackSlot, backed: bool, cause: &dyn fmt::Display) {
        let inner = &self.inner;
        if backed {
            if let Err(err) = inner.kernel.shrink_region(slot.initial_low) {
                warn!("thread {tid}: releasing stack after failed create: {err}");
            }
        }
        inner.stacks.release(slot);
        inner.task.lock().live_threads -= 1;
        inner.events.record(
            Some(tid.0),
            EventKind::CreateFailed {
                reason: cause.to_string(),
            },
        );
        warn!("thread {tid}: create failed: {cause}");
    }

    fn trampoline<F, A>(&self, tcb: &Arc<Tcb>, entry: F, arg: A)
    where
        F: FnOnce(A) -> ExitStatus,
    {
        let inner = &self.inner;
        let tid = tcb.tid();
        let context = inner.kernel.current_kernel_identity();
        tcb.publish_kernel_id(context);
        if inner.contexts.insert(context, tid).is_err() {
            warn!("thread {tid}: {context} is still mapped to an exited thread");
        }
        inner
            .events
            .record(Some(tid.0), EventKind::ContextStarted { context });

        let handler_stack = tcb.slot().map_or(tcb.stack().high, |slot| slot.top);
        if let Err(err) = autostack::install(&*inner.kernel, tcb, &inner.events, handler_stack) {
            warn!("thread {tid}: running without stack growth: {err}");
        }

        let status = match panic::catch_unwind(AssertUnwindSafe(|| entry(arg))) {
            Ok(status) => status,
            Err(payload) if payload.is::<ContextExit>() => panic::resume_unwind(payload),
            Err(_) => {
                error!("thread {tid} panicked, exiting with {PANIC_EXIT_STATUS:#x}");
                PANIC_EXIT_STATUS
            }
        };
        self.exit(status)
    }

    /// End the calling thread with `status`.
    ///
    /// # Panics
    /// If the caller is not a thread of this runtime.
    pub fn exit(&self, status: ExitStatus) -> ! {
        let inner = &self.inner;
        let context = inner.kernel.current_kernel_identity();
        let Some(tcb) = inner
            .contexts
            .get(&context)
            .and_then(|tid| inner.threads.get(&tid))
        else {
            panic!("exit from {context}, which is not a thread of this runtime");
        };
        let tid = tcb.tid();
        inner.contexts.remove(&context);
        inner.task.lock().live_threads -= 1;
        inner
            .events
            .record(Some(tid.0), EventKind::ThreadExited { status });
        debug!("thread {tid} exited with {status:#x}");
        // The joiner may reclaim the stack as soon as the status is out.
        tcb.publish_exit(status);
        drop(tcb);
        inner.kernel.terminate_self()
    }

    /// Wait for `tid` to exit and collect its status.
    pub fn join(&self, tid: ThreadId) -> Result<ExitStatus, RuntimeError> {
        let inner = &self.inner;
        if self.getid().is_ok_and(|me| me == tid) {
            return Err(RuntimeError::JoinSelf(tid));
        }
        let tcb = inner
            .threads
            .get(&tid)
            .ok_or(RuntimeError::NoSuchThread(tid))?;
        let status = tcb.join()?;
        inner.threads.remove(&tid);
        self.reclaim(&tcb);
        inner
            .events
            .record(Some(tid.0), EventKind::ThreadJoined { status });
        debug!("thread {tid} joined with {status:#x}");
        Ok(status)
    }

    fn reclaim(&self, tcb: &Tcb) {
        let Some(slot) = tcb.slot() else {
            return;
        };
        for base in tcb.take_mappings() {
            if let Err(err) = self.inner.kernel.shrink_region(base) {
                warn!("thread {}: releasing stack region {base:#x}: {err}", tcb.tid());
            }
        }
        self.inner.stacks.release(slot);
    }

    /// Identity of the calling thread.
    pub fn getid(&self) -> Result<ThreadId, RuntimeError> {
        let context = self.inner.kernel.current_kernel_identity();
        self.inner
            .contexts
            .get(&context)
            .ok_or(RuntimeError::UnknownContext(context))
    }

    /// Kernel identity of `tid`, waiting for it to be published if the
    /// thread has not started yet.
    pub fn get_kernel_id(&self, tid: ThreadId) -> Result<ContextId, RuntimeError> {
        let tcb = self
            .inner
            .threads
            .get(&tid)
            .ok_or(RuntimeError::NoSuchThread(tid))?;
        tcb.wait_kernel_id()
    }

    /// Yield, preferably to `target`; `None` lets the kernel pick.
    pub fn yield_to(&self, target: Option<ThreadId>) -> Result<(), RuntimeError> {
        let context = target.map(|tid| self.get_kernel_id(tid)).transpose()?;
        self.inner.kernel.yield_to(context)?;
        Ok(())
    }

    #[must_use]
    pub fn thread_state(&self, tid: ThreadId) -> Option<ThreadState> {
        self.inner.threads.get(&tid).map(|tcb| tcb.state())
    }

    #[must_use]
    pub fn stack_info(&self, tid: ThreadId) -> Option<StackInfo> {
        self.inner.threads.get(&tid).map(|tcb| tcb.stack())
    }

    /// Threads that have not exited yet, the root included.
    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.inner.task.lock().live_threads
    }

    /// Threads still registered: live ones plus exited ones not yet joined.
    #[must_use]
    pub fn registered_threads(&self) -> usize {
        self.inner.threads.len()
    }

    /// Reclaimed stack slots waiting for reuse.
    #[must_use]
    pub fn stack_pool_len(&self) -> usize {
        self.inner.stacks.free_len()
    }

    #[must_use]
    pub fn stack_layout(&self) -> StackLayout {
        self.inner.stacks.layout()
    }

    /// Top of the next never-used stack slot.
    #[must_use]
    pub fn stack_frontier(&self) -> usize {
        self.inner.stacks.frontier()
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn kernel(&self) -> &KernelRef {
        &self.inner.kernel
    }

    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.inner.events
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("registered_threads", &self.registered_threads())
            .field("stack_pool", &self.stack_pool_len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::host::{HostKernel, HostKernelConfig};
    use std::sync::mpsc;

    fn runtime() -> Runtime {
        let kernel: KernelRef = Arc::new(HostKernel::new(HostKernelConfig::for_tests()).unwrap());
        Runtime::init(kernel, RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn init_registers_root() {
        let rt = runtime();
        assert_eq!(rt.getid().unwrap(), ROOT_THREAD);
        assert_eq!(
            rt.get_kernel_id(ROOT_THREAD).unwrap(),
            rt.kernel().current_kernel_identity()
        );
        assert_eq!(rt.live_threads(), 1);
        assert_eq!(rt.thread_state(ROOT_THREAD), Some(ThreadState::Running));
    }

    #[test]
    fn init_rejects_zero_stack() {
        let kernel: KernelRef = Arc::new(HostKernel::new(HostKernelConfig::for_tests()).unwrap());
        assert!(matches!(
            Runtime::with_stack_size(kernel, 0),
            Err(RuntimeError::Config(_))
        ));
    }

    #[test]
    fn returning_entry_exits_with_its_value() {
        let rt = runtime();
        let tid = rt.create(|x: usize| x * 2, 21).unwrap();
        assert_eq!(tid, ThreadId(1));
        assert_eq!(rt.join(tid).unwrap(), 42);
        assert!(matches!(rt.join(tid), Err(RuntimeError::NoSuchThread(_))));
    }

    #[test]
    fn explicit_exit_skips_the_rest_of_entry() {
        let rt = runtime();
        let inner = rt.clone();
        let tid = rt
            .create(move |_: ()| inner.exit(7), ())
            .unwrap();
        assert_eq!(rt.join(tid).unwrap(), 7);
    }

    #[test]
    fn child_sees_its_own_identity() {
        let rt = runtime();
        let (tx, rx) = mpsc::channel();
        let inner = rt.clone();
        let tid = rt
            .create(
                move |tx: mpsc::Sender<_>| {
                    tx.send((inner.getid().unwrap(), inner.kernel().current_kernel_identity()))
                        .unwrap();
                    0
                },
                tx,
            )
            .unwrap();
        let (seen, context) = rx.recv().unwrap();
        assert_eq!(seen, tid);
        assert_eq!(rt.get_kernel_id(tid).unwrap(), context);
        rt.join(tid).unwrap();
    }

    #[test]
    fn panicking_entry_is_reported_as_exit() {
        let rt = runtime();
        let tid = rt
            .create(|_: ()| -> ExitStatus { panic!("boom") }, ())
            .unwrap();
        assert_eq!(rt.join(tid).unwrap(), PANIC_EXIT_STATUS);
    }

    #[test]
    fn join_self_is_rejected() {
        let rt = runtime();
        assert!(matches!(
            rt.join(ROOT_THREAD),
            Err(RuntimeError::JoinSelf(ROOT_THREAD))
        ));
    }

    #[test]
    fn unknown_thread_lookups_fail() {
        let rt = runtime();
        assert!(matches!(
            rt.join(ThreadId(99)),
            Err(RuntimeError::NoSuchThread(ThreadId(99)))
        ));
        assert!(rt.get_kernel_id(ThreadId(99)).is_err());
        assert!(rt.yield_to(Some(ThreadId(99))).is_err());
        rt.yield_to(None).unwrap();
    }

    #[test]
    fn foreign_context_has_no_id() {
        let rt = runtime();
        let other = rt.clone();
        let result = std::thread::spawn(move || other.getid()).join().unwrap();
        assert!(matches!(result, Err(RuntimeError::UnknownContext(_))));
    }

    #[test]
    fn stack_slot_is_recycled() {
        let rt = runtime();
        let first = rt.create(|_: ()| 0, ()).unwrap();
        let high = rt.stack_info(first).unwrap().high;
        rt.join(first).unwrap();
        assert_eq!(rt.stack_pool_len(), 1);
        let second = rt.create(|_: ()| 0, ()).unwrap();
        assert_eq!(rt.stack_info(second).map(|s| s.high), Some(high));
        rt.join(second).unwrap();
        assert_eq!(rt.stack_pool_len(), 1);
    }
}
