//! Sleeping mutex with direct hand-off.
//!
//! The lock word and the wait queue sit behind one [`SpinLock`]. A contended
//! `lock` queues the caller, drops the spinlock and suspends. `unlock` with
//! waiters never passes through `Free`: the head waiter is dequeued and
//! woken already owning the lock, so a barging locker cannot steal it.
//!
//! Lifecycle: `Uninitialized -> Free <-> Held`. Locking an uninitialized
//! mutex, or destroying one that is held or waited on, is a protocol
//! violation and panics.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};

use super::spinlock::SpinLock;
use super::wait_queue::{WaitQueue, Waiter};
use crate::error::SyncError;
use crate::kernel::KernelRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Uninitialized,
    Free,
    Held,
}

struct MutexState {
    lock: LockState,
    waiters: WaitQueue,
}

/// Sleeping lock around a `T`, unlocked by dropping its [`MutexGuard`].
///
/// Contended lockers sleep in the kernel and are served in arrival order.
pub struct Mutex<T: ?Sized = ()> {
    kernel: KernelRef,
    state: SpinLock<MutexState>,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reachable through a guard, and at most one guard
// exists at a time.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
// SAFETY: as above.
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// An initialized, unlocked mutex.
    pub fn new(kernel: KernelRef, value: T) -> Self {
        Self::with_state(kernel, value, LockState::Free)
    }

    /// A mutex that must be [`Mutex::init`]ed before first use.
    pub fn new_uninit(kernel: KernelRef, value: T) -> Self {
        Self::with_state(kernel, value, LockState::Uninitialized)
    }

    fn with_state(kernel: KernelRef, value: T, lock: LockState) -> Self {
        Self {
            kernel,
            state: SpinLock::new(MutexState {
                lock,
                waiters: WaitQueue::new(),
            }),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Move an uninitialized or destroyed mutex to `Free`.
    pub fn init(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        if state.lock != LockState::Uninitialized {
            return Err(SyncError::AlreadyInitialized);
        }
        state.lock = LockState::Free;
        state.waiters = WaitQueue::new();
        Ok(())
    }

    /// Acquire the lock, sleeping while another thread holds it.
    ///
    /// # Panics
    /// If the mutex is uninitialized or destroyed.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let mut state = self.state.lock();
        match state.lock {
            LockState::Free => {
                state.lock = LockState::Held;
                drop(state);
            }
            LockState::Held => {
                let waiter = Waiter::new(self.kernel.current_kernel_identity());
                state.waiters.push(waiter.clone());
                drop(state);
                waiter.block(&*self.kernel);
                // Woken by `unlock`, which left the lock held for us.
            }
            LockState::Uninitialized => {
                drop(state);
                panic!("lock of an uninitialized or destroyed mutex");
            }
        }
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut state = self.state.lock();
        match state.lock {
            LockState::Free => {
                state.lock = LockState::Held;
                Some(MutexGuard { mutex: self })
            }
            LockState::Held => None,
            LockState::Uninitialized => {
                drop(state);
                panic!("try_lock of an uninitialized or destroyed mutex");
            }
        }
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        if state.lock != LockState::Held {
            let observed = state.lock;
            drop(state);
            panic!("unlock of a mutex in state {observed:?}");
        }
        let next = state.waiters.pop();
        if next.is_none() {
            state.lock = LockState::Free;
        }
        drop(state);
        if let Some(waiter) = next {
            waiter.release(&*self.kernel);
        }
    }

    /// Return the mutex to `Uninitialized`.
    ///
    /// # Panics
    /// If it is held, has waiters or was never initialized.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        let busy = state.lock == LockState::Held || !state.waiters.is_empty();
        let uninit = state.lock == LockState::Uninitialized;
        if busy || uninit {
            let waiters = state.waiters.len();
            drop(state);
            if uninit {
                panic!("destroy of an uninitialized mutex");
            }
            panic!("destroy of a busy mutex ({waiters} waiters)");
        }
        state.lock = LockState::Uninitialized;
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.lock().lock != LockState::Uninitialized
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.lock().lock == LockState::Held
    }

    /// Number of contexts queued for the lock.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mutex")
            .field("state", &state.lock)
            .field("waiters", &state.waiters.len())
            .finish_non_exhaustive()
    }
}

/// Ownership of a locked [`Mutex`]. Dropping it unlocks.
#[must_use = "dropping the guard unlocks the mutex at once"]
pub struct MutexGuard<'a, T: ?Sized> {
    pub(crate) mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub fn unlock(self) {
        drop(self);
    }

    /// The mutex this guard holds.
    pub fn mutex(guard: &Self) -> &'a Mutex<T> {
        guard.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means holding the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means holding the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
