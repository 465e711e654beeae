use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use libthread_core::kernel::host::{HostKernel, HostKernelConfig};
use libthread_core::{
    Cond, ExitStatus, KernelRef, Mutex, RwLock, RwLockMode, Runtime, RuntimeConfig, Semaphore,
    ThreadId,
};

fn boot() -> Runtime {
    let kernel: KernelRef = Arc::new(HostKernel::new(HostKernelConfig::for_tests()).unwrap());
    Runtime::init(kernel, RuntimeConfig::default()).unwrap()
}

fn spawn_n<F>(rt: &Runtime, n: usize, body: F) -> Vec<ThreadId>
where
    F: Fn(usize) -> ExitStatus + Send + Sync + 'static,
{
    let body = Arc::new(body);
    (0..n)
        .map(|i| {
            let body = Arc::clone(&body);
            rt.create(move |i: usize| body(i), i).unwrap()
        })
        .collect()
}

/// Join every thread; a panicking body shows up as a non-zero status.
fn join_all(rt: &Runtime, tids: Vec<ThreadId>) {
    for tid in tids {
        assert_eq!(rt.join(tid).unwrap(), 0, "thread {tid} failed");
    }
}

#[test]
fn mutex_counter_is_exact() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 2_000;
    let rt = boot();
    let counter = Arc::new(Mutex::new(KernelRef::clone(rt.kernel()), 0usize));
    let inside = Arc::new(AtomicUsize::new(0));

    let tids = {
        let counter = Arc::clone(&counter);
        let inside = Arc::clone(&inside);
        spawn_n(&rt, THREADS, move |_| {
            for _ in 0..ROUNDS {
                let mut guard = counter.lock();
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                *guard += 1;
                inside.fetch_sub(1, Ordering::SeqCst);
            }
            0
        })
    };
    join_all(&rt, tids);
    assert_eq!(*counter.lock(), THREADS * ROUNDS);
    assert!(!counter.is_locked());
    assert_eq!(counter.waiter_count(), 0);
}

#[test]
fn bounded_queue_loses_no_wakeups() {
    const PRODUCERS: usize = 4;
    const ITEMS: usize = 500;
    const CAPACITY: usize = 8;

    struct Queue {
        items: Mutex<VecDeque<usize>>,
        not_empty: Cond,
        not_full: Cond,
    }

    let rt = boot();
    let kernel = rt.kernel();
    let queue = Arc::new(Queue {
        items: Mutex::new(KernelRef::clone(kernel), VecDeque::new()),
        not_empty: Cond::new(KernelRef::clone(kernel)),
        not_full: Cond::new(KernelRef::clone(kernel)),
    });

    let producers = {
        let queue = Arc::clone(&queue);
        spawn_n(&rt, PRODUCERS, move |p| {
            for i in 0..ITEMS {
                let guard = queue.items.lock();
                let mut guard = queue.not_full.wait_while(guard, |q| q.len() >= CAPACITY);
                guard.push_back(p * ITEMS + i);
                drop(guard);
                queue.not_empty.signal();
            }
            0
        })
    };
    let consumer = {
        let queue = Arc::clone(&queue);
        rt.create(
            move |_: ()| {
                let mut sum = 0;
                for _ in 0..PRODUCERS * ITEMS {
                    let guard = queue.items.lock();
                    let mut guard = queue.not_empty.wait_while(guard, |q| q.is_empty());
                    sum += guard.pop_front().unwrap_or_default();
                    drop(guard);
                    queue.not_full.signal();
                }
                sum
            },
            (),
        )
        .unwrap()
    };

    join_all(&rt, producers);
    let total = PRODUCERS * ITEMS;
    assert_eq!(rt.join(consumer).unwrap(), total * (total - 1) / 2);
    assert!(queue.items.lock().is_empty());
}

#[test]
fn semaphore_admits_at_most_its_count() {
    const PERMITS: usize = 3;
    let rt = boot();
    let sem = Arc::new(Semaphore::new(KernelRef::clone(rt.kernel()), PERMITS).unwrap());
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tids = {
        let (sem, inside, peak) = (Arc::clone(&sem), Arc::clone(&inside), Arc::clone(&peak));
        let yielder = rt.clone();
        spawn_n(&rt, 10, move |_| {
            for _ in 0..50 {
                sem.wait();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                yielder.yield_to(None).unwrap();
                inside.fetch_sub(1, Ordering::SeqCst);
                sem.signal();
            }
            0
        })
    };
    join_all(&rt, tids);
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=PERMITS).contains(&peak), "peak {peak}");
    assert_eq!(sem.available(), PERMITS as isize);
}

#[test]
fn rwlock_never_mixes_readers_and_writers() {
    let rt = boot();
    let lock = Arc::new(RwLock::new(KernelRef::clone(rt.kernel())));
    let readers = Arc::new(AtomicUsize::new(0));
    let writers = Arc::new(AtomicUsize::new(0));
    let writes = Arc::new(AtomicUsize::new(0));

    let tids = {
        let (lock, readers, writers, writes) = (
            Arc::clone(&lock),
            Arc::clone(&readers),
            Arc::clone(&writers),
            Arc::clone(&writes),
        );
        spawn_n(&rt, 8, move |i| {
            for round in 0..200 {
                if (i + round) % 4 == 0 {
                    lock.lock(RwLockMode::Write);
                    assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                    assert_eq!(readers.load(Ordering::SeqCst), 0);
                    writes.fetch_add(1, Ordering::SeqCst);
                    if round % 8 == 0 {
                        writers.fetch_sub(1, Ordering::SeqCst);
                        lock.downgrade();
                        readers.fetch_add(1, Ordering::SeqCst);
                        readers.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        writers.fetch_sub(1, Ordering::SeqCst);
                    }
                    lock.unlock();
                } else {
                    lock.lock(RwLockMode::Read);
                    readers.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(writers.load(Ordering::SeqCst), 0);
                    readers.fetch_sub(1, Ordering::SeqCst);
                    lock.unlock();
                }
            }
            0
        })
    };
    join_all(&rt, tids);
    assert_eq!(writes.load(Ordering::SeqCst), 8 * 200 / 4);
    let snapshot = lock.snapshot();
    assert_eq!(snapshot.active_readers, 0);
    assert_eq!(snapshot.active_writers, 0);
    assert_eq!(snapshot.mode, None);
    lock.destroy();
}
