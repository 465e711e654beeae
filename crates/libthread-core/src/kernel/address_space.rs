//! Page-granular simulated address space for the hosted kernel.
//!
//! Tracks which ranges are backed; nothing is actually reserved. Each
//! successful [`AddressSpace::map`] creates one mapping that can later be
//! released as a unit by its base address.

use std::collections::BTreeMap;

use crate::error::KernelError;

#[derive(Debug)]
pub struct AddressSpace {
    page_size: usize,
    /// base -> length
    mappings: BTreeMap<usize, usize>,
    mapped_bytes: usize,
    limit: Option<usize>,
}

impl AddressSpace {
    #[must_use]
    pub fn new(page_size: usize, limit: Option<usize>) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            page_size,
            mappings: BTreeMap::new(),
            mapped_bytes: 0,
            limit,
        }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Total bytes currently backed.
    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.mapped_bytes
    }

    /// Number of live mappings.
    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    pub fn map(&mut self, low: usize, len: usize) -> Result<(), KernelError> {
        let mask = self.page_size - 1;
        if len == 0 || low & mask != 0 || len & mask != 0 {
            return Err(KernelError::Misaligned { low, len });
        }
        let Some(high) = low.checked_add(len) else {
            return Err(KernelError::Misaligned { low, len });
        };
        if self.overlaps(low, high) {
            return Err(KernelError::Overlap { low, len });
        }
        if let Some(limit) = self.limit {
            let available = limit.saturating_sub(self.mapped_bytes);
            if len > available {
                return Err(KernelError::OutOfMemory {
                    requested: len,
                    available,
                });
            }
        }
        self.mappings.insert(low, len);
        self.mapped_bytes += len;
        Ok(())
    }

    pub fn unmap(&mut self, base: usize) -> Result<usize, KernelError> {
        let len = self
            .mappings
            .remove(&base)
            .ok_or(KernelError::NotMapped { addr: base })?;
        self.mapped_bytes -= len;
        Ok(len)
    }

    #[must_use]
    pub fn is_backed(&self, addr: usize) -> bool {
        self.mappings
            .range(..=addr)
            .next_back()
            .is_some_and(|(&base, &len)| addr < base + len)
    }

    fn overlaps(&self, low: usize, high: usize) -> bool {
        self.mappings
            .range(..high)
            .next_back()
            .is_some_and(|(&base, &len)| base + len > low)
    }
}
