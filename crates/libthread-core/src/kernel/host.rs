//! Hosted kernel: contexts are OS threads, memory is simulated.
//!
//! - `start_context` spawns a detached OS thread per context. The stack the
//!   runtime passes in is bookkeeping only; the OS thread runs on its own
//!   native stack of [`HostKernelConfig::native_stack_size`] bytes.
//! - `suspend_self`/`wake` park on a per-context mutex + condvar slot.
//! - `grow_region`/`shrink_region` edit an [`AddressSpace`].
//! - Faults are raised explicitly with [`HostKernel::touch`], which delivers
//!   a page fault to the caller's armed handler exactly like a trap would.
//!   Handlers are one-shot.
//! - `terminate_self` unwinds the calling context with a [`ContextExit`]
//!   payload; `terminate_task` exits the process or, under
//!   [`TerminatePolicy::Panic`], panics with [`TaskTerminated`].

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;

use log::{debug, error};
use parking_lot::Mutex;
use serde::Serialize;

use super::address_space::AddressSpace;
use super::park;
use super::{
    ContextEntry, ContextExit, ContextId, FaultCause, FaultHandler, FaultInfo, Kernel, StackRange,
};
use crate::error::{KernelError, WakeError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Used when `sysconf(_SC_PAGESIZE)` is unavailable.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// Native stack for each hosted context.
const DEFAULT_NATIVE_STACK_SIZE: usize = 512 * 1024;

/// Top of the initial stack in the simulated address space.
const DEFAULT_INITIAL_STACK_HIGH: usize = (usize::MAX >> 1) & !0xFFFF;

const DEFAULT_INITIAL_STACK_SIZE: usize = 256 * 1024;

/// Task status used when a fault reaches a context with no armed handler.
pub const UNHANDLED_FAULT_STATUS: i32 = -2;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What [`Kernel::terminate_task`] does on the host.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminatePolicy {
    /// `std::process::exit(status)`.
    #[default]
    ExitProcess,
    /// Panic with a [`TaskTerminated`] payload. Meant for tests.
    Panic,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostKernelConfig {
    pub page_size: usize,
    pub native_stack_size: usize,
    /// Cap on simulated backed bytes, initial stack included.
    pub memory_limit: Option<usize>,
    /// Cap on concurrently live started contexts.
    pub max_contexts: Option<usize>,
    pub terminate: TerminatePolicy,
    pub initial_stack_high: usize,
    pub initial_stack_size: usize,
}

impl Default for HostKernelConfig {
    fn default() -> Self {
        Self {
            page_size: host_page_size(),
            native_stack_size: DEFAULT_NATIVE_STACK_SIZE,
            memory_limit: None,
            max_contexts: None,
            terminate: TerminatePolicy::ExitProcess,
            initial_stack_high: DEFAULT_INITIAL_STACK_HIGH,
            initial_stack_size: DEFAULT_INITIAL_STACK_SIZE,
        }
    }
}

impl HostKernelConfig {
    /// Defaults with [`TerminatePolicy::Panic`].
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            terminate: TerminatePolicy::Panic,
            ..Self::default()
        }
    }
}

fn host_page_size() -> usize {
    // SAFETY: sysconf has no preconditions and only reads system state.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(raw)
        .ok()
        .filter(|page| page.is_power_of_two())
        .unwrap_or(FALLBACK_PAGE_SIZE)
}

/// Panic payload of [`Kernel::terminate_task`] under [`TerminatePolicy::Panic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTerminated {
    pub status: i32,
}

/// Call counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostStats {
    pub contexts_started: u64,
    pub grow_calls: u64,
    pub shrink_calls: u64,
    pub faults_delivered: u64,
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

struct ArmedHandler {
    stack: usize,
    handler: FaultHandler,
}

struct Shared {
    config: HostKernelConfig,
    memory: Mutex<AddressSpace>,
    handlers: Mutex<HashMap<ContextId, ArmedHandler>>,
    live_contexts: AtomicUsize,
    contexts_started: AtomicU64,
    grow_calls: AtomicU64,
    shrink_calls: AtomicU64,
    faults_delivered: AtomicU64,
    terminated: Mutex<Option<i32>>,
}

pub struct HostKernel {
    shared: Arc<Shared>,
}

impl HostKernel {
    /// Build a kernel whose initial stack is already backed.
    pub fn new(config: HostKernelConfig) -> Result<Self, KernelError> {
        if !config.page_size.is_power_of_two() {
            return Err(KernelError::BadPageSize(config.page_size));
        }
        let mut memory = AddressSpace::new(config.page_size, config.memory_limit);
        let low = config
            .initial_stack_high
            .checked_sub(config.initial_stack_size)
            .ok_or(KernelError::Misaligned {
                low: config.initial_stack_high,
                len: config.initial_stack_size,
            })?;
        memory.map(low, config.initial_stack_size)?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                memory: Mutex::new(memory),
                handlers: Mutex::new(HashMap::new()),
                live_contexts: AtomicUsize::new(0),
                contexts_started: AtomicU64::new(0),
                grow_calls: AtomicU64::new(0),
                shrink_calls: AtomicU64::new(0),
                faults_delivered: AtomicU64::new(0),
                terminated: Mutex::new(None),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &HostKernelConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn stats(&self) -> HostStats {
        let s = &self.shared;
        HostStats {
            contexts_started: s.contexts_started.load(Ordering::Relaxed),
            grow_calls: s.grow_calls.load(Ordering::Relaxed),
            shrink_calls: s.shrink_calls.load(Ordering::Relaxed),
            faults_delivered: s.faults_delivered.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn is_backed(&self, addr: usize) -> bool {
        self.shared.memory.lock().is_backed(addr)
    }

    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.shared.memory.lock().mapped_bytes()
    }

    #[must_use]
    pub fn live_contexts(&self) -> usize {
        self.shared.live_contexts.load(Ordering::Acquire)
    }

    /// Status passed to the last `terminate_task`, if any.
    #[must_use]
    pub fn terminated_status(&self) -> Option<i32> {
        *self.shared.terminated.lock()
    }

    /// Whether the calling context has an armed fault handler.
    #[must_use]
    pub fn has_fault_handler(&self) -> bool {
        let (context, _) = park::current();
        self.shared.handlers.lock().contains_key(&context)
    }

    /// Simulate a memory access by the calling context.
    ///
    /// An access to an unbacked address is delivered as a page fault to the
    /// caller's handler and then reissued. If it still misses, or nobody is
    /// armed, the task is terminated.
    pub fn touch(&self, addr: usize) {
        if self.is_backed(addr) {
            return;
        }
        self.raise(addr, FaultCause::PageFault);
        if !self.is_backed(addr) {
            error!("fault at {addr:#x} persists after handler ran");
            self.terminate_task(UNHANDLED_FAULT_STATUS);
        }
    }

    /// Deliver a fault of any cause to the calling context's handler.
    pub fn raise(&self, addr: usize, cause: FaultCause) {
        let (context, _) = park::current();
        let armed = self.shared.handlers.lock().remove(&context);
        self.shared.faults_delivered.fetch_add(1, Ordering::Relaxed);
        let Some(armed) = armed else {
            error!("{context}: unhandled {cause:?} at {addr:#x}");
            self.terminate_task(UNHANDLED_FAULT_STATUS);
        };
        debug!(
            "{context}: {cause:?} at {addr:#x}, handler on stack {:#x}",
            armed.stack
        );
        let info = FaultInfo {
            context,
            addr,
            cause,
        };
        (armed.handler)(self, &info);
    }

    fn reserve_context_slot(&self) -> Result<(), KernelError> {
        let live = &self.shared.live_contexts;
        match self.shared.config.max_contexts {
            None => {
                live.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Some(limit) => live
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < limit).then_some(n + 1)
                })
                .map(|_| ())
                .map_err(|_| KernelError::ContextLimit { limit }),
        }
    }
}

impl Kernel for HostKernel {
    fn start_context(
        &self,
        entry: ContextEntry,
        stack_top: usize,
    ) -> Result<ContextId, KernelError> {
        let sp = stack_top.wrapping_sub(1);
        if !self.is_backed(sp) {
            return Err(KernelError::Unbacked { addr: sp });
        }
        self.reserve_context_slot()?;

        let (id, slot) = park::register();
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("libthread-{}", id.0))
            .stack_size(self.shared.config.native_stack_size)
            .spawn(move || {
                park::adopt(id, slot);
                match panic::catch_unwind(AssertUnwindSafe(entry)) {
                    Ok(()) => debug!("{id} returned from its entry"),
                    Err(payload) if payload.is::<ContextExit>() => debug!("{id} terminated"),
                    Err(payload) if payload.is::<TaskTerminated>() => {
                        debug!("{id} stopped by task termination");
                    }
                    Err(_) => error!("{id} panicked outside the runtime trampoline"),
                }
                shared.handlers.lock().remove(&id);
                shared.live_contexts.fetch_sub(1, Ordering::AcqRel);
            });

        match spawned {
            Ok(_) => {
                self.shared.contexts_started.fetch_add(1, Ordering::Relaxed);
                Ok(id)
            }
            Err(err) => {
                park::unregister(id);
                self.shared.live_contexts.fetch_sub(1, Ordering::AcqRel);
                Err(KernelError::Spawn(err))
            }
        }
    }

    fn suspend_self(&self, guard: &AtomicBool) {
        let (_, slot) = park::current();
        slot.park(guard);
    }

    fn wake(&self, target: ContextId) -> Result<(), WakeError> {
        park::lookup(target)
            .ok_or(WakeError::NotYetSuspended)?
            .unpark()
    }

    fn yield_to(&self, target: Option<ContextId>) -> Result<(), KernelError> {
        if let Some(target) = target {
            if park::lookup(target).is_none() {
                return Err(KernelError::NoSuchContext(target));
            }
        }
        thread::yield_now();
        Ok(())
    }

    fn grow_region(&self, low: usize, len: usize) -> Result<(), KernelError> {
        self.shared.grow_calls.fetch_add(1, Ordering::Relaxed);
        self.shared.memory.lock().map(low, len)
    }

    fn shrink_region(&self, base: usize) -> Result<(), KernelError> {
        self.shared.shrink_calls.fetch_add(1, Ordering::Relaxed);
        self.shared.memory.lock().unmap(base).map(|_| ())
    }

    fn install_fault_handler(
        &self,
        handler_stack: usize,
        handler: FaultHandler,
    ) -> Result<(), KernelError> {
        let (context, _) = park::current();
        self.shared.handlers.lock().insert(
            context,
            ArmedHandler {
                stack: handler_stack,
                handler,
            },
        );
        Ok(())
    }

    fn terminate_self(&self) -> ! {
        panic::resume_unwind(Box::new(ContextExit))
    }

    fn terminate_task(&self, status: i32) -> ! {
        *self.shared.terminated.lock() = Some(status);
        match self.shared.config.terminate {
            TerminatePolicy::ExitProcess => {
                error!("task terminated with status {status}");
                std::process::exit(status)
            }
            TerminatePolicy::Panic => panic::panic_any(TaskTerminated { status }),
        }
    }

    fn current_kernel_identity(&self) -> ContextId {
        park::current().0
    }

    fn page_size(&self) -> usize {
        self.shared.config.page_size
    }

    fn initial_stack(&self) -> StackRange {
        let config = &self.shared.config;
        StackRange {
            low: config.initial_stack_high - config.initial_stack_size,
            high: config.initial_stack_high,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn kernel() -> Arc<HostKernel> {
        Arc::new(HostKernel::new(HostKernelConfig::for_tests()).unwrap())
    }

    #[test]
    fn initial_stack_is_backed() {
        let k = kernel();
        let stack = k.initial_stack();
        assert!(k.is_backed(stack.low));
        assert!(k.is_backed(stack.high - 1));
        assert!(!k.is_backed(stack.high));
        assert_eq!(k.mapped_bytes(), stack.len());
    }

    #[test]
    fn started_context_runs_and_reports_its_identity() {
        let k = kernel();
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&k);
        let id = k
            .start_context(
                Box::new(move || tx.send(inner.current_kernel_identity()).unwrap()),
                k.initial_stack().high,
            )
            .unwrap();
        assert_eq!(rx.recv().unwrap(), id);
        assert_ne!(id, k.current_kernel_identity());
    }

    #[test]
    fn start_requires_backed_stack() {
        let k = kernel();
        let err = k.start_context(Box::new(|| {}), 0x10_0000).unwrap_err();
        assert!(matches!(err, KernelError::Unbacked { addr: 0xf_ffff }));
    }

    #[test]
    fn context_limit_is_enforced() {
        let k = Arc::new(
            HostKernel::new(HostKernelConfig {
                max_contexts: Some(1),
                ..HostKernelConfig::for_tests()
            })
            .unwrap(),
        );
        let top = k.initial_stack().high;
        let (release_tx, release_rx) = mpsc::channel::<()>();
        k.start_context(
            Box::new(move || {
                let _ = release_rx.recv();
            }),
            top,
        )
        .unwrap();
        let err = k.start_context(Box::new(|| {}), top).unwrap_err();
        assert!(matches!(err, KernelError::ContextLimit { limit: 1 }));
        release_tx.send(()).unwrap();
        while k.live_contexts() != 0 {
            thread::sleep(Duration::from_millis(1));
        }
        k.start_context(Box::new(|| {}), top).unwrap();
    }

    #[test]
    fn terminate_self_ends_only_the_context() {
        let k = kernel();
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&k);
        k.start_context(
            Box::new(move || {
                tx.send(1).unwrap();
                inner.terminate_self();
            }),
            k.initial_stack().high,
        )
        .unwrap();
        assert_eq!(rx.recv().unwrap(), 1);
        while k.live_contexts() != 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(k.terminated_status(), None);
    }

    #[test]
    fn wake_before_suspend_is_reported() {
        let k = kernel();
        let me = k.current_kernel_identity();
        assert_eq!(k.wake(me), Err(WakeError::NotYetSuspended));
    }

    #[test]
    fn suspend_and_wake_across_contexts() {
        let k = kernel();
        let guard = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();
        let (inner, flag) = (Arc::clone(&k), Arc::clone(&guard));
        let id = k
            .start_context(
                Box::new(move || {
                    inner.suspend_self(&flag);
                    tx.send(()).unwrap();
                }),
                k.initial_stack().high,
            )
            .unwrap();
        guard.store(false, Ordering::Release);
        while k.wake(id).is_err() {
            if rx.try_recv().is_ok() {
                return;
            }
            thread::yield_now();
        }
        rx.recv().unwrap();
    }

    #[test]
    fn yield_to_unknown_context_fails() {
        let k = kernel();
        assert!(matches!(
            k.yield_to(Some(ContextId(u64::MAX))),
            Err(KernelError::NoSuchContext(_))
        ));
        k.yield_to(None).unwrap();
    }

    #[test]
    fn touch_delivers_one_shot_fault() {
        let k = kernel();
        let page = k.page_size();
        let below = k.initial_stack().low - page;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        k.install_fault_handler(
            k.initial_stack().high,
            Arc::new(move |kernel: &dyn Kernel, info: &FaultInfo| {
                counter.fetch_add(1, Ordering::SeqCst);
                kernel.grow_region(info.addr & !(page - 1), page).unwrap();
            }),
        )
        .unwrap();
        k.touch(below + 8);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(k.is_backed(below));
        assert!(!k.has_fault_handler());
        assert_eq!(k.stats().faults_delivered, 1);
        assert_eq!(k.stats().grow_calls, 1);
    }

    #[test]
    fn unhandled_fault_terminates_task() {
        let k = kernel();
        let addr = k.initial_stack().low - 1;
        let result = panic::catch_unwind(AssertUnwindSafe(|| k.touch(addr)));
        let payload = result.unwrap_err();
        assert_eq!(
            payload.downcast_ref::<TaskTerminated>(),
            Some(&TaskTerminated {
                status: UNHANDLED_FAULT_STATUS
            })
        );
        assert_eq!(k.terminated_status(), Some(UNHANDLED_FAULT_STATUS));
    }

    #[test]
    fn shrink_releases_grown_region() {
        let k = kernel();
        let page = k.page_size();
        let base = k.initial_stack().low - 4 * page;
        k.grow_region(base, 2 * page).unwrap();
        assert!(k.is_backed(base + page));
        k.shrink_region(base).unwrap();
        assert!(!k.is_backed(base));
        assert!(k.shrink_region(base).is_err());
    }
}
