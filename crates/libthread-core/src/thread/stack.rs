//! Stack slot layout and reuse.
//!
//! Slots are carved downward from a frontier. Each slot is:
//!
//! ```text
//! top         +----------------------+
//!             | fault handler stack  |  1 page
//! stack_high  +----------------------+
//!             | initial stack        |  stack_size, backed at create
//! initial_low +----------------------+
//!             | growth area          |  backed on demand by faults
//! floor       +----------------------+  stack_high - max_stack_size
//!             | guard                |  1 page, never backed
//! bottom      +----------------------+
//! ```
//!
//! Released slots go on a FIFO free-list and are preferred over pushing the
//! frontier further down.

use std::collections::VecDeque;

use serde::Serialize;

use crate::error::RuntimeError;
use crate::kernel::KernelRef;
use crate::sync::Mutex;

/// Sizes shared by every slot; all multiples of `page_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StackLayout {
    pub page_size: usize,
    pub stack_size: usize,
    pub max_stack_size: usize,
}

impl StackLayout {
    /// Address space consumed by one slot.
    #[must_use]
    pub const fn span(&self) -> usize {
        self.max_stack_size + 2 * self.page_size
    }

    #[must_use]
    pub const fn slot_at(&self, top: usize) -> StackSlot {
        let stack_high = top - self.page_size;
        StackSlot {
            top,
            stack_high,
            initial_low: stack_high - self.stack_size,
            floor: stack_high - self.max_stack_size,
        }
    }
}

/// Addresses of one slot, see the diagram above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StackSlot {
    /// Top of the fault handler page; exclusive upper bound of the slot.
    pub top: usize,
    /// Initial stack pointer of the thread.
    pub stack_high: usize,
    /// Lowest address backed at create.
    pub initial_low: usize,
    /// Lowest address the stack may ever grow to.
    pub floor: usize,
}

impl StackSlot {
    /// Bytes backed when the slot is handed to a new thread: the initial
    /// stack plus the handler page.
    #[must_use]
    pub const fn initial_len(&self) -> usize {
        self.top - self.initial_low
    }
}

/// Hands out stack slots, reusing released ones first.
pub struct StackAllocator {
    layout: StackLayout,
    frontier: Mutex<usize>,
    free: Mutex<VecDeque<StackSlot>>,
}

impl StackAllocator {
    /// `frontier` is the top of the first slot to carve.
    pub fn new(kernel: &KernelRef, layout: StackLayout, frontier: usize) -> Self {
        Self {
            layout,
            frontier: Mutex::new(KernelRef::clone(kernel), frontier),
            free: Mutex::new(KernelRef::clone(kernel), VecDeque::new()),
        }
    }

    #[must_use]
    pub fn layout(&self) -> StackLayout {
        self.layout
    }

    /// A slot and whether it came from the free-list. A fresh slot is
    /// carved below the frontier; nothing is backed yet.
    ///
    /// # Errors
    /// [`RuntimeError::StackExhausted`] when no slot fits above the zero page.
    pub fn acquire(&self) -> Result<(StackSlot, bool), RuntimeError> {
        if let Some(slot) = self.free.lock().pop_front() {
            return Ok((slot, true));
        }
        let mut frontier = self.frontier.lock();
        let top = *frontier;
        let span = self.layout.span();
        // Leave the zero page unmapped below the lowest slot.
        if span
            .checked_add(self.layout.page_size)
            .is_none_or(|needed| top < needed)
        {
            return Err(RuntimeError::StackExhausted { frontier: top });
        }
        *frontier = top - span;
        Ok((self.layout.slot_at(top), false))
    }

    /// Queue `slot` for reuse. Its regions must already be released.
    pub fn release(&self, slot: StackSlot) {
        self.free.lock().push_back(slot);
    }

    #[must_use]
    pub fn free_len(&self) -> usize {
        self.free.lock().len()
    }

    #[must_use]
    pub fn frontier(&self) -> usize {
        *self.frontier.lock()
    }
}
