//! The sequence counter every barrier is built around.
//!
//! Sequences are signed so that -1 can mean "nothing yet"; the first event of a
//! pipeline is sequence 0.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicI64, Ordering};

/// A cache-padded sequence counter.
///
/// Writers publish with `Release` and readers observe with `Acquire`, so everything a
/// writer did to a slot before advancing is visible to whoever sees the new value.
#[derive(Debug)]
pub(crate) struct Cursor {
    value: CachePadded<AtomicI64>,
}

impl Cursor {
    pub(crate) fn new(val: i64) -> Self {
        Self {
            value: CachePadded::new(AtomicI64::new(val)),
        }
    }

    #[inline]
    pub(crate) fn acquire(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn store(&self, val: i64) {
        self.value.store(val, Ordering::Release);
    }
}

impl Default for Cursor {
    /// Nothing published or consumed yet.
    fn default() -> Self {
        Self::new(-1)
    }
}
