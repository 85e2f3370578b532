//! The producer side of a dispatch pipeline.
//!
//! Publishers to one topic take turns: a turnstile admits one claim at a time, which
//! makes the claim strategy single-producer no matter how many tasks publish. The
//! admitted claim waits until the last handler stage has released the slot it is
//! about to reuse, then fills the slot and publishes it to the first stage.

use crate::barrier::Closed;
use crate::future::Completion;
use crate::pipeline::Shared;
use crossbeam_utils::CachePadded;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Serializes publishers to one pipeline.
///
/// A publisher that finds the turnstile taken parks on `notify` instead of spinning.
/// Whoever holds the turn hands it on when its [`Turn`] drops: the flag is released
/// first, then one waiter is woken to retry. A wake-up that arrives before the waiter
/// parks is kept as a permit by `Notify`, so no publisher is left waiting on a free
/// turnstile.
///
/// The flag is wrapped in `CachePadded` so contention on it does not disturb the
/// cursors next to it.
#[derive(Debug, Default)]
struct Turnstile {
    flag: CachePadded<AtomicBool>,
    notify: Notify,
}

impl Turnstile {
    /// Takes the turn if nobody holds it.
    ///
    /// Returns `None` without touching the turnstile when another publisher holds the
    /// turn. A [`Turn`] is only ever built for the caller that won the exchange.
    #[inline]
    fn try_enter(&self) -> Option<Turn<'_>> {
        if self
            .flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(Turn(self))
        } else {
            None
        }
    }

    /// Waits for the turn.
    ///
    /// The notification is registered before each attempt, so a turn released between
    /// a failed attempt and parking still wakes this waiter.
    async fn enter(&self) -> Turn<'_> {
        loop {
            let notified = self.notify.notified();

            if let Some(turn) = self.try_enter() {
                return turn;
            }

            notified.await;
        }
    }
}

/// An RAII guard for the exclusive right to claim the next sequence.
///
/// Dropping it (after publishing, when a claim is abandoned, or when the claiming
/// future is cancelled) releases the turnstile and wakes the next waiting publisher.
struct Turn<'a>(&'a Turnstile);

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        // Release before notifying, so the woken publisher finds the turnstile free.
        self.0.flag.store(false, Ordering::Release);
        self.0.notify.notify_one();
    }
}

/// A sequence reserved for one event. The slot is free: every stage has finished with
/// its previous occupant.
///
/// Dropping a claim without publishing gives the sequence back.
pub(crate) struct Claim<'a, E, R> {
    sequence: i64,
    shared: &'a Shared<E, R>,
    _turn: Turn<'a>,
}

impl<E, R> Claim<'_, E, R> {
    pub(crate) fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Fills the claimed slot and makes it visible to the first handler stage.
    ///
    /// # Arguments
    ///
    /// * `payload` - The event to hand to the chain.
    /// * `completion` - Where the last stage sends the outcome, if the publisher waits
    ///   for one.
    pub(crate) fn publish(self, payload: E, completion: Option<Completion<R>>) {
        // SAFETY: this claim is the only holder of `sequence`. The turnstile excludes
        // other producers, the first stage does not read `sequence` until the cursor
        // advance below, and `Sequencer::claim` waited for the last stage to release
        // the slot's previous occupant.
        let slot = unsafe { &mut *self.shared.buffer.get(self.sequence) };
        slot.fill(self.sequence, payload, completion);

        self.shared.published.advance_to(self.sequence);
    }
}

/// The claim side of a pipeline.
///
/// Publishing is a two-step protocol:
///
/// 1. [`claim`](Self::claim) waits for the turnstile, then for the slowest stage to
///    release the slot the next sequence maps onto. It returns a [`Claim`] that holds
///    the turn.
/// 2. [`Claim::publish`] fills the slot and advances the producer barrier, waking the
///    first stage. Dropping the claim ends the turn and admits the next publisher.
///
/// Only one claim exists at a time, so sequences are handed out strictly in order and
/// every slot has a single writer.
pub(crate) struct Sequencer<E, R> {
    /// Ring, barriers and wait strategy shared with the stage tasks.
    shared: Arc<Shared<E, R>>,
    /// Admits one claim at a time.
    turnstile: Turnstile,
}

impl<E, R> Sequencer<E, R> {
    pub(crate) fn new(shared: Arc<Shared<E, R>>) -> Self {
        Self {
            shared,
            turnstile: Turnstile::default(),
        }
    }

    pub(crate) fn shared(&self) -> &Shared<E, R> {
        &self.shared
    }

    /// Reserves the next sequence.
    ///
    /// Waits for this publisher's turn, then for the slowest stage to fall less than a
    /// full ring behind (backpressure).
    ///
    /// # Cancellation Safety
    ///
    /// This method is cancellation safe. Nothing is reserved until it returns, and
    /// cancelling it while it waits ends the turn for the next publisher.
    pub(crate) async fn claim(&self) -> Result<Claim<'_, E, R>, Closed> {
        let turn = self.turnstile.enter().await;
        let shared = &*self.shared;

        if shared.published.is_closed() {
            return Err(Closed);
        }

        let sequence = shared.published.cursor() + 1;
        let capacity = shared.buffer.capacity() as i64;

        // The slot for `sequence` last held `sequence - capacity`; wait until the last
        // stage is done with it.
        shared
            .gating()
            .wait_for(sequence - capacity, shared.wait_strategy)
            .await?;

        Ok(Claim {
            sequence,
            shared,
            _turn: turn,
        })
    }

    /// Stops accepting claims. Events already published are still handled.
    ///
    /// Waits for an in-flight claim to finish first, so no event is published after
    /// the stages have been told to drain.
    pub(crate) async fn close(&self) {
        let _turn = self.turnstile.enter().await;
        self.shared.published.close();
    }
}

impl<E, R> Drop for Sequencer<E, R> {
    fn drop(&mut self) {
        // No claim can outlive the sequencer; let the stages drain and exit.
        self.shared.published.close();
    }
}
