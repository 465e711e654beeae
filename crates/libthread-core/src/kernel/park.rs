//! Per-context park slots backing suspend/wake on the host.
//!
//! Every OS thread that touches the hosted kernel gets a [`ContextId`] and a
//! slot. Threads started by the kernel are registered before they run so a
//! wake or yield aimed at them resolves immediately; foreign threads (the
//! process main thread, test threads) register lazily on first use.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::{Condvar, Mutex, RwLock};

use super::ContextId;
use crate::error::WakeError;

pub(crate) struct ParkSlot {
    suspended: Mutex<bool>,
    wakeup: Condvar,
}

impl ParkSlot {
    fn new() -> Self {
        Self {
            suspended: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    /// Sleep until [`ParkSlot::unpark`], unless `guard` was already cleared.
    pub(crate) fn park(&self, guard: &AtomicBool) {
        let mut suspended = self.suspended.lock();
        if !guard.load(Ordering::Acquire) {
            return;
        }
        *suspended = true;
        while *suspended {
            self.wakeup.wait(&mut suspended);
        }
    }

    pub(crate) fn unpark(&self) -> Result<(), WakeError> {
        let mut suspended = self.suspended.lock();
        if !*suspended {
            return Err(WakeError::NotYetSuspended);
        }
        *suspended = false;
        self.wakeup.notify_one();
        Ok(())
    }
}

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

static SLOTS: LazyLock<RwLock<HashMap<ContextId, Arc<ParkSlot>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Identity of the OS thread; dropping it (thread exit) retires the slot.
struct Current {
    id: ContextId,
    slot: Arc<ParkSlot>,
}

impl Drop for Current {
    fn drop(&mut self) {
        SLOTS.write().remove(&self.id);
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
}

/// Allocate an id and slot for a context that has not started yet.
pub(crate) fn register() -> (ContextId, Arc<ParkSlot>) {
    let id = ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed));
    let slot = Arc::new(ParkSlot::new());
    SLOTS.write().insert(id, Arc::clone(&slot));
    (id, slot)
}

/// Drop a registration whose context never ran.
pub(crate) fn unregister(id: ContextId) {
    SLOTS.write().remove(&id);
}

/// Bind a pre-registered identity to the calling OS thread.
pub(crate) fn adopt(id: ContextId, slot: Arc<ParkSlot>) {
    CURRENT.with(|current| {
        *current.borrow_mut() = Some(Current { id, slot });
    });
}

/// Identity and slot of the calling OS thread, registering it if needed.
pub(crate) fn current() -> (ContextId, Arc<ParkSlot>) {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        let entry = current.get_or_insert_with(|| {
            let (id, slot) = register();
            Current { id, slot }
        });
        (entry.id, Arc::clone(&entry.slot))
    })
}

pub(crate) fn lookup(id: ContextId) -> Option<Arc<ParkSlot>> {
    SLOTS.read().get(&id).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn identity_is_stable_per_thread() {
        let (a, _) = current();
        let (b, _) = current();
        assert_eq!(a, b);
        let other = thread::spawn(|| current().0).join().unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn slot_retires_when_thread_ends() {
        let id = thread::spawn(|| current().0).join().unwrap();
        assert!(lookup(id).is_none());
    }

    #[test]
    fn unpark_before_park_is_rejected() {
        let (id, slot) = register();
        assert_eq!(slot.unpark(), Err(WakeError::NotYetSuspended));
        unregister(id);
        assert!(lookup(id).is_none());
    }

    #[test]
    fn cleared_guard_skips_sleep() {
        let (_, slot) = current();
        let guard = AtomicBool::new(false);
        slot.park(&guard);
    }

    #[test]
    fn park_then_unpark() {
        let guard = Arc::new(AtomicBool::new(true));
        let (tx, rx) = std::sync::mpsc::channel();
        let sleeper = {
            let guard = Arc::clone(&guard);
            thread::spawn(move || {
                let (id, slot) = current();
                tx.send(id).unwrap();
                slot.park(&guard);
            })
        };
        let id = rx.recv().unwrap();
        let slot = lookup(id).unwrap();
        guard.store(false, Ordering::Release);
        // Retry until the sleeper has committed to its park.
        while slot.unpark().is_err() {
            if sleeper.is_finished() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        sleeper.join().unwrap();
    }
}
