use crate::error::{Error, Result};

/// Default number of slots in each topic's ring buffer.
pub const DEFAULT_CAPACITY: usize = 1024;

/// How an idle stage (or a producer under backpressure) waits for progress.
///
/// Both strategies observe the same events in the same order; they differ only in
/// latency and CPU use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Yield back to the scheduler for a bounded number of rounds before parking.
    #[default]
    Yielding,
    /// Park on a notification immediately.
    Blocking,
}

/// Settings shared by every pipeline a bus builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    capacity: usize,
    wait_strategy: WaitStrategy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            wait_strategy: WaitStrategy::default(),
        }
    }
}

impl BusConfig {
    /// Creates a configuration with the given ring buffer capacity.
    ///
    /// # Errors
    /// Returns [`Error::InvalidCapacity`] unless `capacity` is a power of two and at least 2.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(Error::InvalidCapacity(capacity));
        }

        Ok(Self {
            capacity,
            ..Default::default()
        })
    }

    #[must_use]
    pub fn with_wait_strategy(mut self, wait_strategy: WaitStrategy) -> Self {
        self.wait_strategy = wait_strategy;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn wait_strategy(&self) -> WaitStrategy {
        self.wait_strategy
    }
}
