//! Writer-priority reader/writer lock with downgrade.
//!
//! Readers wait while any writer is active *or waiting*; writers wait while
//! anyone is active. A stream of writers therefore starves readers; that is
//! the chosen policy. The lock protects no data of its own and is released
//! with [`RwLock::unlock`], which uses the current-mode tag to tell a read
//! release from a write release.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::cond::Cond;
use super::mutex::Mutex;
use crate::error::SyncError;
use crate::kernel::KernelRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RwLockMode {
    Read,
    Write,
}

/// Point-in-time counters, for assertions and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RwLockSnapshot {
    pub waiting_readers: usize,
    pub active_readers: usize,
    pub waiting_writers: usize,
    pub active_writers: usize,
    pub mode: Option<RwLockMode>,
}

#[derive(Debug)]
struct RwState {
    initialized: bool,
    counts: RwLockSnapshot,
}

pub struct RwLock {
    state: Mutex<RwState>,
    readers: Cond,
    writers: Cond,
}

impl RwLock {
    pub fn new(kernel: KernelRef) -> Self {
        Self::with_state(kernel, true)
    }

    pub fn new_uninit(kernel: KernelRef) -> Self {
        Self::with_state(kernel, false)
    }

    fn with_state(kernel: KernelRef, initialized: bool) -> Self {
        Self {
            state: Mutex::new(
                KernelRef::clone(&kernel),
                RwState {
                    initialized,
                    counts: RwLockSnapshot::default(),
                },
            ),
            readers: Cond::new(KernelRef::clone(&kernel)),
            writers: Cond::new(kernel),
        }
    }

    pub fn init(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        if state.initialized {
            return Err(SyncError::AlreadyInitialized);
        }
        state.initialized = true;
        state.counts = RwLockSnapshot::default();
        Ok(())
    }

    pub fn lock(&self, mode: RwLockMode) {
        let mut state = self.state.lock();
        assert!(
            state.initialized,
            "lock of an uninitialized or destroyed rwlock"
        );
        match mode {
            RwLockMode::Read => {
                state.counts.waiting_readers += 1;
                while state.counts.active_writers > 0 || state.counts.waiting_writers > 0 {
                    state = self.readers.wait(state);
                }
                state.counts.waiting_readers -= 1;
                state.counts.active_readers += 1;
            }
            RwLockMode::Write => {
                state.counts.waiting_writers += 1;
                while state.counts.active_readers > 0 || state.counts.active_writers > 0 {
                    state = self.writers.wait(state);
                }
                state.counts.waiting_writers -= 1;
                state.counts.active_writers += 1;
            }
        }
        state.counts.mode = Some(mode);
    }

    pub fn unlock(&self) {
        let mut state = self.state.lock();
        assert!(
            state.initialized,
            "unlock of an uninitialized or destroyed rwlock"
        );
        match state.counts.mode {
            Some(RwLockMode::Read) => {
                let counts = &mut state.counts;
                assert!(counts.active_readers > 0, "read unlock with no active reader");
                counts.active_readers -= 1;
                if counts.active_readers == 0 {
                    counts.mode = None;
                    if counts.waiting_writers > 0 {
                        self.writers.signal();
                    }
                }
            }
            Some(RwLockMode::Write) => {
                let counts = &mut state.counts;
                counts.active_writers -= 1;
                assert_eq!(counts.active_writers, 0, "more than one active writer");
                counts.mode = None;
                if counts.waiting_writers > 0 {
                    self.writers.signal();
                } else {
                    self.readers.broadcast();
                }
            }
            None => panic!("unlock of an rwlock that is not held"),
        }
    }

    /// Turn the caller's write hold into a read hold without releasing.
    pub fn downgrade(&self) {
        let mut state = self.state.lock();
        if state.counts.mode != Some(RwLockMode::Write) {
            drop(state);
            panic!("downgrade without holding the write lock");
        }
        state.counts.active_writers = 0;
        state.counts.active_readers += 1;
        state.counts.mode = Some(RwLockMode::Read);
        self.readers.broadcast();
    }

    pub fn destroy(&self) {
        let mut state = self.state.lock();
        let c = state.counts;
        if !state.initialized
            || c.active_readers + c.active_writers + c.waiting_readers + c.waiting_writers != 0
        {
            drop(state);
            panic!("destroy of an uninitialized or busy rwlock: {c:?}");
        }
        state.initialized = false;
    }

    #[must_use]
    pub fn snapshot(&self) -> RwLockSnapshot {
        self.state.lock().counts
    }
}

impl fmt::Debug for RwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("counts", &self.snapshot())
            .finish_non_exhaustive()
    }
}
