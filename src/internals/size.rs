//! The occupancy counter every variant keeps next to its chain.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::MultisetError;

/// Total number of occurrences held, with an optional upper bound.
///
/// The counter lives on its own cache line as it is touched by every mutation
/// regardless of which element it targets.
#[derive(Debug)]
pub(crate) struct SizeCounter {
    size: CachePadded<AtomicUsize>,
    // 0 is unbounded.
    capacity: usize,
}

impl SizeCounter {
    pub(crate) fn new(capacity: usize) -> Self {
        SizeCounter {
            size: CachePadded::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> Option<usize> {
        if self.capacity == 0 {
            None
        } else {
            Some(self.capacity)
        }
    }

    pub(crate) fn get(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Claim `delta` more occurrences. If the post-increment size would exceed
    /// the capacity nothing is published and the claim is refused.
    pub(crate) fn reserve(&self, delta: usize) -> Result<(), MultisetError> {
        let capacity = self.capacity;
        self.size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                let next = size.checked_add(delta)?;
                if capacity > 0 && next > capacity {
                    None
                } else {
                    Some(next)
                }
            })
            .map(|_| ())
            .map_err(|size| {
                tracing::debug!(size, delta, capacity, "capacity exceeded");
                MultisetError::CapacityExceeded {
                    requested: delta,
                    // Unbounded still stops where the counter overflows.
                    capacity: self.capacity().unwrap_or(usize::MAX),
                }
            })
    }

    /// Hand back occurrences, either removed from the chain or reserved by an
    /// insertion that did not complete.
    pub(crate) fn release(&self, delta: usize) {
        if delta > 0 {
            self.size.fetch_sub(delta, Ordering::AcqRel);
        }
    }
}
