//! Progress barriers, the hand-off points between the parties of a pipeline.
//!
//! Every party owns one barrier: the producer advances its barrier as it publishes,
//! and each handler stage advances its own as it finishes events. A party waits on
//! the barrier of whoever it depends on:
//!
//! ```text
//!   producer -> stage 0 -> stage 1 -> ... -> stage n-1
//!       ^                                        |
//!       +------------- backpressure -------------+
//! ```
//!
//! Closing a barrier tells the waiters downstream that no further sequences will
//! arrive. They still drain what was advanced before the close, then close their own
//! barrier in turn, so a shutdown travels down the chain one stage at a time.

use crate::config::WaitStrategy;
use crate::cursor::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Rounds a `Yielding` waiter spends handing control back to the scheduler before
/// it parks on the notification.
const YIELD_ROUNDS: u32 = 64;

/// The upstream side closed before the awaited sequence was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Closed;

/// Progress marker owned by one party in a pipeline (the producer or a stage).
///
/// The owner advances the cursor after finishing with a sequence and closes the
/// barrier when it will make no further progress. Whoever depends on that party
/// waits on the barrier.
#[derive(Debug)]
pub(crate) struct Barrier {
    closed: AtomicBool,
    cursor: Cursor,
    notify: Notify,
}

impl Default for Barrier {
    fn default() -> Self {
        Self {
            closed: AtomicBool::new(false),
            cursor: Cursor::default(),
            notify: Notify::new(),
        }
    }
}

impl Barrier {
    /// The highest sequence the owner has finished with.
    pub(crate) fn cursor(&self) -> i64 {
        self.cursor.acquire()
    }

    /// Marks every sequence up to `sequence` as finished and wakes all waiters.
    pub(crate) fn advance_to(&self, sequence: i64) {
        self.cursor.store(sequence);
        self.notify.notify_waiters();
    }

    /// Announces that the cursor will not advance again.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits until the cursor reaches `target` and returns the cursor.
    ///
    /// Sequences the owner finished before closing are still handed out; `Closed` is
    /// returned only once the barrier is closed and `target` will never be reached.
    ///
    /// # Arguments
    ///
    /// * `target` - The lowest sequence the caller needs. The returned cursor may be
    ///   further ahead, letting the caller process a batch.
    /// * `strategy` - How to wait while the cursor is behind. `Yielding` hands control
    ///   back to the scheduler for a few rounds before parking; `Blocking` parks at once.
    ///
    /// # Cancellation Safety
    ///
    /// This method is cancellation safe. It only observes the barrier.
    pub(crate) async fn wait_for(&self, target: i64, strategy: WaitStrategy) -> Result<i64, Closed> {
        if strategy == WaitStrategy::Yielding {
            for _ in 0..YIELD_ROUNDS {
                if let Some(outcome) = self.check(target) {
                    return outcome;
                }
                tokio::task::yield_now().await;
            }
        }

        loop {
            if let Some(outcome) = self.check(target) {
                return outcome;
            }

            // Register before the second check so an advance in between still wakes us.
            let notified = self.notify.notified();

            if let Some(outcome) = self.check(target) {
                return outcome;
            }

            notified.await;
        }
    }

    fn check(&self, target: i64) -> Option<Result<i64, Closed>> {
        let available = self.cursor.acquire();
        if available >= target {
            return Some(Ok(available));
        }

        if self.is_closed() {
            // The owner's final advance happens before it closes.
            let available = self.cursor.acquire();
            return Some(if available >= target {
                Ok(available)
            } else {
                Err(Closed)
            });
        }

        None
    }
}
