//! Condition variable over [`Mutex`].
//!
//! `wait` queues the caller under the condvar's spinlock *before* it gives
//! up the mutex, so a signaller that takes the mutex afterwards always finds
//! the entry. Each wait entry is released by exactly one `signal` or
//! `broadcast`, and the waiter only returns once its own entry is released:
//! there are no spurious wakeups.

use std::fmt;

use super::mutex::MutexGuard;
use super::spinlock::SpinLock;
use super::wait_queue::{WaitQueue, Waiter};
use crate::error::SyncError;
use crate::kernel::KernelRef;

struct CondState {
    initialized: bool,
    waiters: WaitQueue,
}

pub struct Cond {
    kernel: KernelRef,
    state: SpinLock<CondState>,
}

impl Cond {
    pub fn new(kernel: KernelRef) -> Self {
        Self::with_state(kernel, true)
    }

    pub fn new_uninit(kernel: KernelRef) -> Self {
        Self::with_state(kernel, false)
    }

    fn with_state(kernel: KernelRef, initialized: bool) -> Self {
        Self {
            kernel,
            state: SpinLock::new(CondState {
                initialized,
                waiters: WaitQueue::new(),
            }),
        }
    }

    pub fn init(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        if state.initialized {
            return Err(SyncError::AlreadyInitialized);
        }
        state.initialized = true;
        state.waiters = WaitQueue::new();
        Ok(())
    }

    /// Release `guard`'s mutex, sleep until signalled, re-acquire the mutex.
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = MutexGuard::mutex(&guard);
        let waiter = Waiter::new(self.kernel.current_kernel_identity());
        {
            let mut state = self.state.lock();
            if !state.initialized {
                drop(state);
                drop(guard);
                panic!("wait on an uninitialized or destroyed condition variable");
            }
            state.waiters.push(waiter.clone());
        }
        drop(guard);
        waiter.block(&*self.kernel);
        mutex.lock()
    }

    /// Wait until `condition` returns false.
    pub fn wait_while<'a, T: ?Sized, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: F,
    ) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Wake the longest-waiting context, if any.
    pub fn signal(&self) {
        let next = {
            let mut state = self.state.lock();
            self.assert_initialized(state.initialized, "signal");
            state.waiters.pop()
        };
        if let Some(waiter) = next {
            waiter.release(&*self.kernel);
        }
    }

    /// Wake every waiting context.
    pub fn broadcast(&self) {
        let all = {
            let mut state = self.state.lock();
            self.assert_initialized(state.initialized, "broadcast");
            state.waiters.drain()
        };
        for waiter in all {
            waiter.release(&*self.kernel);
        }
    }

    /// Retire the condition variable.
    ///
    /// # Panics
    /// If it is not initialized or still has waiters.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        self.assert_initialized(state.initialized, "destroy");
        let waiters = state.waiters.len();
        if waiters != 0 {
            drop(state);
            panic!("destroy of a condition variable with {waiters} waiters");
        }
        state.initialized = false;
    }

    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn assert_initialized(&self, initialized: bool, op: &str) {
        assert!(
            initialized,
            "{op} on an uninitialized or destroyed condition variable"
        );
    }
}

impl fmt::Debug for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Cond")
            .field("initialized", &state.initialized)
            .field("waiters", &state.waiters.len())
            .finish_non_exhaustive()
    }
}
