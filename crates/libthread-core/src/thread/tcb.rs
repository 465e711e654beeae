//! Thread control block.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use super::stack::StackSlot;
use super::{ExitStatus, ThreadId};
use crate::error::RuntimeError;
use crate::kernel::{ContextId, KernelRef, StackRange};
use crate::sync::{Cond, Mutex, SpinLock};

/// Where a thread is in its exit/join hand-over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    Running,
    /// Exited before anyone joined; the status waits here.
    ExitPending(ExitStatus),
    /// A joiner is attached and sleeping (or about to collect).
    JoinWaiting,
    Reclaimed,
}

#[derive(Debug, Clone, Copy)]
enum KernelIdSlot {
    Pending,
    Known(ContextId),
    /// The context never started.
    Abandoned,
}

#[derive(Debug)]
struct Lifecycle {
    state: ThreadState,
    status: Option<ExitStatus>,
}

/// Current extent of a thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StackInfo {
    pub high: usize,
    pub low: usize,
    pub floor: usize,
}

pub struct Tcb {
    tid: ThreadId,
    /// `None` for the root thread, whose stack the loader owns.
    slot: Option<StackSlot>,
    stack_high: usize,
    floor: usize,
    /// Written only by this thread's own fault handler.
    stack_low: AtomicUsize,
    /// Bases of every region backed for this stack.
    mappings: SpinLock<Vec<usize>>,
    lifecycle: Mutex<Lifecycle>,
    exited: Cond,
    kernel_id: Mutex<KernelIdSlot>,
    kernel_id_known: Cond,
}

impl Tcb {
    fn new(
        kernel: &KernelRef,
        tid: ThreadId,
        slot: Option<StackSlot>,
        stack: StackRange,
        floor: usize,
        mappings: Vec<usize>,
    ) -> Self {
        Self {
            tid,
            slot,
            stack_high: stack.high,
            floor,
            stack_low: AtomicUsize::new(stack.low),
            mappings: SpinLock::new(mappings),
            lifecycle: Mutex::new(
                KernelRef::clone(kernel),
                Lifecycle {
                    state: ThreadState::Running,
                    status: None,
                },
            ),
            exited: Cond::new(KernelRef::clone(kernel)),
            kernel_id: Mutex::new(KernelRef::clone(kernel), KernelIdSlot::Pending),
            kernel_id_known: Cond::new(KernelRef::clone(kernel)),
        }
    }

    /// TCB for a created thread whose slot's initial region is backed.
    pub(crate) fn child(kernel: &KernelRef, tid: ThreadId, slot: StackSlot) -> Self {
        let stack = StackRange {
            low: slot.initial_low,
            high: slot.stack_high,
        };
        Self::new(kernel, tid, Some(slot), stack, slot.floor, vec![slot.initial_low])
    }

    pub(crate) fn root(kernel: &KernelRef, tid: ThreadId, stack: StackRange, floor: usize) -> Self {
        Self::new(kernel, tid, None, stack, floor, Vec::new())
    }

    #[must_use]
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    #[must_use]
    pub fn slot(&self) -> Option<StackSlot> {
        self.slot
    }

    #[must_use]
    pub fn stack(&self) -> StackInfo {
        StackInfo {
            high: self.stack_high,
            low: self.stack_low.load(Ordering::Acquire),
            floor: self.floor,
        }
    }

    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.lifecycle.lock().state
    }

    /// Kernel identity if already known, without waiting.
    #[must_use]
    pub fn kernel_id(&self) -> Option<ContextId> {
        match *self.kernel_id.lock() {
            KernelIdSlot::Known(id) => Some(id),
            KernelIdSlot::Pending | KernelIdSlot::Abandoned => None,
        }
    }

    /// Record the kernel identity; the first publisher wins.
    pub(crate) fn publish_kernel_id(&self, id: ContextId) {
        let mut slot = self.kernel_id.lock();
        if matches!(*slot, KernelIdSlot::Pending) {
            *slot = KernelIdSlot::Known(id);
            self.kernel_id_known.broadcast();
        }
    }

    /// Kernel identity, sleeping until the creator or the thread publishes
    /// it. Fails with `NoSuchThread` if the thread is abandoned meanwhile.
    pub(crate) fn wait_kernel_id(&self) -> Result<ContextId, RuntimeError> {
        let mut slot = self.kernel_id.lock();
        loop {
            let current = *slot;
            match current {
                KernelIdSlot::Known(id) => return Ok(id),
                KernelIdSlot::Abandoned => return Err(RuntimeError::NoSuchThread(self.tid)),
                KernelIdSlot::Pending => slot = self.kernel_id_known.wait(slot),
            }
        }
    }

    /// Mark a thread whose context could not be started. Everyone waiting
    /// on its identity or its exit wakes up with `NoSuchThread`.
    pub(crate) fn abandon(&self) {
        {
            let mut slot = self.kernel_id.lock();
            if matches!(*slot, KernelIdSlot::Pending) {
                *slot = KernelIdSlot::Abandoned;
            }
            self.kernel_id_known.broadcast();
        }
        let mut life = self.lifecycle.lock();
        life.state = ThreadState::Reclaimed;
        self.exited.broadcast();
    }

    pub(crate) fn record_growth(&self, new_low: usize) {
        self.mappings.lock().push(new_low);
        self.stack_low.store(new_low, Ordering::Release);
    }

    pub(crate) fn take_mappings(&self) -> Vec<usize> {
        std::mem::take(&mut *self.mappings.lock())
    }

    /// Publish the exit status, handing it to a waiting joiner if there is one.
    /// Returns whether a joiner was waiting.
    pub(crate) fn publish_exit(&self, status: ExitStatus) -> bool {
        let mut life = self.lifecycle.lock();
        assert!(
            life.status.is_none(),
            "thread {} exited more than once",
            self.tid
        );
        life.status = Some(status);
        match life.state {
            ThreadState::Running => {
                life.state = ThreadState::ExitPending(status);
                false
            }
            ThreadState::JoinWaiting => {
                self.exited.signal();
                true
            }
            ThreadState::ExitPending(_) | ThreadState::Reclaimed => {
                unreachable!("status was unset, so the thread had not exited")
            }
        }
    }

    /// Become the thread's only joiner and wait for its status.
    pub(crate) fn join(&self) -> Result<ExitStatus, RuntimeError> {
        let mut life = self.lifecycle.lock();
        match life.state {
            ThreadState::JoinWaiting => return Err(RuntimeError::AlreadyJoined(self.tid)),
            ThreadState::Reclaimed => return Err(RuntimeError::NoSuchThread(self.tid)),
            ThreadState::Running => life.state = ThreadState::JoinWaiting,
            ThreadState::ExitPending(_) => {}
        }
        let status = loop {
            if let Some(status) = life.status {
                break status;
            }
            if life.state == ThreadState::Reclaimed {
                return Err(RuntimeError::NoSuchThread(self.tid));
            }
            life = self.exited.wait(life);
        };
        life.state = ThreadState::Reclaimed;
        Ok(status)
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("tid", &self.tid)
            .field("state", &self.state())
            .field("kernel_id", &self.kernel_id())
            .field("stack", &self.stack())
            .finish_non_exhaustive()
    }
}
