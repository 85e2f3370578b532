//! Defines `RingBuffer`, the fixed-size slot array behind every dispatch pipeline.
//!
//! Slots are allocated once, when the pipeline is built, and reused for the life of
//! the pipeline. The buffer itself provides no synchronization: a producer claims a
//! slot through the sequencer before writing it, each handler stage touches a slot
//! only after the stage before it has advanced past that sequence, and the producer
//! may not wrap onto a slot until the last stage has released it.

use std::cell::UnsafeCell;

/// A fixed-size circular buffer of pre-allocated slots.
///
/// # Safety
///
/// `Send`/`Sync` are implemented `unsafe`ly. Soundness rests on the pipeline's
/// sequence discipline:
///
/// 1.  **Single writer**: the sequencer hands out each sequence to exactly one
///     producer at a time, and only after the last stage has finished with the slot's
///     previous occupant.
/// 2.  **Chained readers**: stage *i + 1* reads a sequence only after stage *i* has
///     advanced its cursor past it, so at most one party holds a slot at any moment.
/// 3.  **Publication**: cursors are advanced with `Release` and observed with
///     `Acquire`, making every write to a slot visible to the next holder.
///
/// Because access is exclusive rather than shared, `T: Send` is sufficient.
#[derive(Debug)]
pub(crate) struct RingBuffer<T> {
    slots: Box<[UnsafeCell<T>]>,

    /// `capacity - 1`, used to map a sequence onto a slot index.
    index_mask: usize,
}

// SAFETY: see the type-level documentation. Slots move between threads only as
// exclusive accesses handed over through cursor advances.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Creates a buffer of `capacity` slots, each produced by `init`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is less than 2 or not a power of two. `BusConfig` rejects
    /// such values before a buffer is ever built.
    pub(crate) fn new(capacity: usize, mut init: impl FnMut() -> T) -> Self {
        assert!(capacity >= 2, "capacity must be at least 2");
        assert!(capacity.is_power_of_two(), "capacity must be a power of 2");

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(init()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            index_mask: capacity - 1,
        }
    }

    #[inline]
    fn index_of(&self, sequence: i64) -> usize {
        (sequence as usize) & self.index_mask
    }

    /// Returns a pointer to the slot that `sequence` maps onto.
    ///
    /// Dereferencing is only sound while the caller holds the sequence under the
    /// rules in the type-level documentation.
    #[inline]
    pub(crate) fn get(&self, sequence: i64) -> *mut T {
        let index = self.index_of(sequence);
        // SAFETY: `index_mask` keeps `index` within `slots`.
        unsafe { self.slots.get_unchecked(index).get() }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}
