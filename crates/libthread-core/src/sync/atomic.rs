//! Word-sized atomic read-modify-write operations.
//!
//! Everything that busy-waits in this crate goes through these three calls.
//! All are sequentially consistent.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Store `new` into `cell` and return the previous value.
#[inline]
pub fn exchange(cell: &AtomicUsize, new: usize) -> usize {
    cell.swap(new, Ordering::SeqCst)
}

/// Store `new` if `cell` holds `expected`. Returns whether the store happened.
#[inline]
pub fn compare_and_swap(cell: &AtomicUsize, expected: usize, new: usize) -> bool {
    cell.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Add `delta` (wrapping) and return the previous value.
#[inline]
pub fn fetch_and_add(cell: &AtomicUsize, delta: usize) -> usize {
    cell.fetch_add(delta, Ordering::SeqCst)
}
