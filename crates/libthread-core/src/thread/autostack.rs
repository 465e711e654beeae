//! Fault-driven stack growth.
//!
//! Each thread arms a handler for itself. A page fault between the thread's
//! growth floor and its current low-water mark is answered with a single
//! `grow_region` covering every page from the faulting one up to the old
//! low-water mark; the kernel then reissues the access. Anything else ends
//! the task.

use std::sync::{Arc, Weak};

use log::{debug, error};

use super::tcb::Tcb;
use crate::error::KernelError;
use crate::events::{EventKind, EventLog};
use crate::kernel::{FaultCause, FaultInfo, Kernel, page_floor};

/// Task status after an unrecoverable fault.
pub const FAULT_EXIT_STATUS: i32 = -1;

/// What to do about one fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Growth {
    /// Back `[low, low + len)`; `low` becomes the new low-water mark.
    Grow { low: usize, len: usize },
    Fatal,
}

/// Decide how to answer `fault` for a stack currently backed down to
/// `stack_low` and allowed to grow down to `floor`.
#[must_use]
pub fn plan(fault: &FaultInfo, stack_low: usize, floor: usize, page_size: usize) -> Growth {
    if fault.cause != FaultCause::PageFault || fault.addr < floor || fault.addr >= stack_low {
        return Growth::Fatal;
    }
    let low = page_floor(fault.addr, page_size);
    Growth::Grow {
        low,
        len: stack_low - low,
    }
}

/// Arm the growth handler for the calling context.
pub(crate) fn install(
    kernel: &dyn Kernel,
    tcb: &Arc<Tcb>,
    events: &Arc<EventLog>,
    handler_stack: usize,
) -> Result<(), KernelError> {
    let owner = Arc::downgrade(tcb);
    let events = Arc::clone(events);
    kernel.install_fault_handler(
        handler_stack,
        Arc::new(move |kernel: &dyn Kernel, fault: &FaultInfo| {
            on_fault(kernel, &owner, &events, handler_stack, fault);
        }),
    )
}

fn on_fault(
    kernel: &dyn Kernel,
    owner: &Weak<Tcb>,
    events: &Arc<EventLog>,
    handler_stack: usize,
    fault: &FaultInfo,
) {
    let Some(tcb) = owner.upgrade() else {
        error!("{}: fault at {:#x} after its thread was reclaimed", fault.context, fault.addr);
        kernel.terminate_task(FAULT_EXIT_STATUS);
    };
    let tid = tcb.tid();
    let stack = tcb.stack();
    match plan(fault, stack.low, stack.floor, kernel.page_size()) {
        Growth::Grow { low, len } => {
            if let Err(err) = kernel.grow_region(low, len) {
                error!("thread {tid}: cannot grow stack to {low:#x}: {err}");
                events.record(Some(tid.0), EventKind::FatalFault { addr: fault.addr });
                kernel.terminate_task(FAULT_EXIT_STATUS);
            }
            tcb.record_growth(low);
            events.record(Some(tid.0), EventKind::StackGrown { new_low: low, bytes: len });
            debug!("thread {tid}: stack grown by {len:#x} to {low:#x}");
            if let Err(err) = install(kernel, &tcb, events, handler_stack) {
                error!("thread {tid}: cannot re-arm fault handler: {err}");
                kernel.terminate_task(FAULT_EXIT_STATUS);
            }
        }
        Growth::Fatal => {
            error!(
                "thread {tid}: {:?} at {:#x} outside growable stack [{:#x}, {:#x})",
                fault.cause, fault.addr, stack.floor, stack.low
            );
            events.record(Some(tid.0), EventKind::FatalFault { addr: fault.addr });
            kernel.terminate_task(FAULT_EXIT_STATUS);
        }
    }
}
