//! Counting semaphore on top of [`Mutex`] + [`Cond`].
//!
//! `available` goes negative while contexts wait; its magnitude is the
//! number of blocked waiters. A `signal` that finds waiters grants one
//! runnable credit and signals the condvar; a woken waiter proceeds only by
//! consuming a credit, so two signals landing together cannot let more than
//! two waiters through.

use std::fmt;

use super::cond::Cond;
use super::mutex::Mutex;
use crate::error::SyncError;
use crate::kernel::KernelRef;

#[derive(Debug)]
struct SemState {
    initialized: bool,
    available: isize,
    runnable: usize,
}

pub struct Semaphore {
    state: Mutex<SemState>,
    woken: Cond,
}

impl Semaphore {
    /// Semaphore with `count` initial permits. `count` must be positive.
    pub fn new(kernel: KernelRef, count: usize) -> Result<Self, SyncError> {
        let sem = Self::new_uninit(kernel);
        sem.init(count)?;
        Ok(sem)
    }

    pub fn new_uninit(kernel: KernelRef) -> Self {
        Self {
            state: Mutex::new(
                KernelRef::clone(&kernel),
                SemState {
                    initialized: false,
                    available: 0,
                    runnable: 0,
                },
            ),
            woken: Cond::new(kernel),
        }
    }

    pub fn init(&self, count: usize) -> Result<(), SyncError> {
        let count = isize::try_from(count)
            .ok()
            .filter(|&c| c > 0)
            .ok_or(SyncError::InvalidArgument("semaphore count must be positive"))?;
        let mut state = self.state.lock();
        if state.initialized {
            return Err(SyncError::AlreadyInitialized);
        }
        state.initialized = true;
        state.available = count;
        state.runnable = 0;
        Ok(())
    }

    /// Take one permit, sleeping while none is available.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        assert!(
            state.initialized,
            "wait on an uninitialized or destroyed semaphore"
        );
        state.available -= 1;
        if state.available < 0 {
            loop {
                state = self.woken.wait(state);
                if state.runnable > 0 {
                    break;
                }
            }
            state.runnable -= 1;
        }
    }

    /// Return one permit, waking a waiter if any is blocked.
    pub fn signal(&self) {
        let mut state = self.state.lock();
        assert!(
            state.initialized,
            "signal on an uninitialized or destroyed semaphore"
        );
        let before = state.available;
        state.available += 1;
        if before < 0 {
            state.runnable += 1;
            self.woken.signal();
        }
    }

    pub fn destroy(&self) {
        let mut state = self.state.lock();
        assert!(
            state.initialized,
            "destroy of an uninitialized semaphore"
        );
        if state.available < 0 {
            let waiters = state.available.unsigned_abs();
            drop(state);
            panic!("destroy of a semaphore with {waiters} waiters");
        }
        state.initialized = false;
    }

    /// Permits currently available; negative when contexts are waiting.
    #[must_use]
    pub fn available(&self) -> isize {
        self.state.lock().available
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Semaphore")
            .field("available", &state.available)
            .field("runnable", &state.runnable)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::host::{HostKernel, HostKernelConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn kernel() -> KernelRef {
        Arc::new(HostKernel::new(HostKernelConfig::for_tests()).unwrap())
    }

    #[test]
    fn zero_count_is_rejected() {
        assert_eq!(
            Semaphore::new(kernel(), 0).unwrap_err(),
            SyncError::InvalidArgument("semaphore count must be positive")
        );
    }

    #[test]
    fn double_init_is_rejected() {
        let sem = Semaphore::new(kernel(), 1).unwrap();
        assert_eq!(sem.init(1), Err(SyncError::AlreadyInitialized));
    }

    #[test]
    fn uncontended_wait_and_signal() {
        let sem = Semaphore::new(kernel(), 2).unwrap();
        sem.wait();
        sem.wait();
        assert_eq!(sem.available(), 0);
        sem.signal();
        sem.signal();
        assert_eq!(sem.available(), 2);
        sem.destroy();
    }

    #[test]
    fn waiter_blocks_until_signal() {
        let sem = Arc::new(Semaphore::new(kernel(), 1).unwrap());
        sem.wait();
        let passed = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let (sem, passed) = (Arc::clone(&sem), Arc::clone(&passed));
            thread::spawn(move || {
                sem.wait();
                passed.store(1, Ordering::SeqCst);
            })
        };
        while sem.available() >= 0 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(10));
        assert_eq!(passed.load(Ordering::SeqCst), 0);
        sem.signal();
        waiter.join().unwrap();
        assert_eq!(passed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn at_most_k_holders() {
        const K: usize = 3;
        const THREADS: usize = 10;
        const ITERS: usize = 50;
        let sem = Arc::new(Semaphore::new(kernel(), K).unwrap());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let (sem, inside, peak, barrier) = (
                    Arc::clone(&sem),
                    Arc::clone(&inside),
                    Arc::clone(&peak),
                    Arc::clone(&barrier),
                );
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..ITERS {
                        sem.wait();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        assert!(now <= K);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        sem.signal();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= K);
        assert_eq!(sem.available(), K as isize);
    }

    #[test]
    fn destroy_with_waiters_panics() {
        let sem = Arc::new(Semaphore::new(kernel(), 1).unwrap());
        sem.wait();
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait())
        };
        while sem.available() >= 0 {
            thread::sleep(Duration::from_millis(1));
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sem.destroy()));
        assert!(result.is_err());
        sem.signal();
        waiter.join().unwrap();
    }
}
