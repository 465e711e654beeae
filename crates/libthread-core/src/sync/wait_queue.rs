//! FIFO of blocked contexts plus the suspend/wake handshake.
//!
//! A blocking call creates a [`Waiter`] with `pending` set, pushes it while
//! holding the primitive's spinlock, drops the spinlock and then calls
//! [`Waiter::block`]. The waker pops the entry under the same spinlock,
//! drops it, and calls [`Waiter::release`].
//!
//! `pending` is the kernel's reject guard: once the waker clears it the
//! sleeper either never commits to sleeping or is woken. A wake aimed at a
//! context that has not committed yet gets one directed yield and is then
//! left alone; the sleeper will see the cleared flag. Kernel wakes left over
//! from an earlier wait only cause another pass of the `block` loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::WakeError;
use crate::kernel::{ContextId, Kernel};

#[derive(Debug)]
pub(crate) struct Waiter {
    context: ContextId,
    pending: AtomicBool,
}

impl Waiter {
    pub(crate) fn new(context: ContextId) -> Arc<Self> {
        Arc::new(Self {
            context,
            pending: AtomicBool::new(true),
        })
    }

    /// Sleep until [`Waiter::release`] has run for this entry.
    pub(crate) fn block(&self, kernel: &dyn Kernel) {
        while self.pending.load(Ordering::Acquire) {
            kernel.suspend_self(&self.pending);
        }
    }

    pub(crate) fn release(&self, kernel: &dyn Kernel) {
        self.pending.store(false, Ordering::Release);
        match kernel.wake(self.context) {
            Ok(()) => {}
            Err(WakeError::NotYetSuspended) => {
                // Best effort: the target may already be gone from the kernel.
                let _ = kernel.yield_to(Some(self.context));
            }
        }
    }
}

/// Ordered waiters of one primitive. Always accessed under its spinlock.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    entries: VecDeque<Arc<Waiter>>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, waiter: Arc<Waiter>) {
        self.entries.push_back(waiter);
    }

    pub(crate) fn pop(&mut self) -> Option<Arc<Waiter>> {
        self.entries.pop_front()
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<Waiter>> {
        self.entries.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
