//! `ResultFuture`, the one-shot handle a publisher keeps to an event's outcome.
//!
//! The outcome is produced exactly once, by the pipeline after the last handler of
//! the chain returns. Awaiting the handle the first time receives it; every later
//! read returns the memoized value without waiting again.

use crate::error::{Error, Result};
use crate::event::EventSlot;
use crate::handler::{HandlerKey, Subscriber};
use crate::topic::Topic;
use std::time::Duration;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{Mutex, OnceCell, SetError, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// The sending half a pipeline slot keeps for a pending [`ResultFuture`].
pub(crate) type Completion<R> = oneshot::Sender<Resolution<R>>;

/// How an event's dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<R> {
    /// Every handler ran without failing. Carries the result the chain left behind.
    Completed(Option<R>),
    /// The chain ran to its end, but the listed handlers failed on this event.
    PartiallyFailed {
        result: Option<R>,
        failed: Vec<HandlerKey>,
    },
    /// The event was discarded before its chain finished.
    Abandoned,
    /// The publisher stopped waiting.
    Cancelled,
}

impl<R> Resolution<R> {
    /// The result field, for outcomes where the chain ran.
    pub fn value(&self) -> Option<&R> {
        match self {
            Self::Completed(result) | Self::PartiallyFailed { result, .. } => result.as_ref(),
            Self::Abandoned | Self::Cancelled => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// A publisher's handle to the outcome of one event.
///
/// Reading never fails loudly: when the chain failed or was abandoned, `get` yields
/// `None` and [`resolution`](Self::resolution) tells the caller what happened.
#[derive(Debug)]
pub struct ResultFuture<R> {
    topic: Topic,
    pending: Mutex<Pending<R>>,
    cancel: CancellationToken,
    resolved: OnceCell<Resolution<R>>,
}

/// The receiving side of a handle that has not memoized its outcome yet.
#[derive(Debug)]
struct Pending<R> {
    /// `None` once the outcome has been taken out of the channel.
    receiver: Option<oneshot::Receiver<Resolution<R>>>,
    /// An outcome taken by a non-blocking read while an awaited read was about to
    /// memoize; that read picks it up instead of the channel.
    received: Option<Resolution<R>>,
}

impl<R> Pending<R> {
    fn new(receiver: Option<oneshot::Receiver<Resolution<R>>>) -> Self {
        Self {
            receiver,
            received: None,
        }
    }
}

impl<R> ResultFuture<R> {
    pub(crate) fn channel(topic: Topic) -> (Completion<R>, Self) {
        let (completion, receiver) = oneshot::channel();
        let future = Self {
            topic,
            pending: Mutex::new(Pending::new(Some(receiver))),
            cancel: CancellationToken::new(),
            resolved: OnceCell::new(),
        };
        (completion, future)
    }

    /// A handle that is already resolved.
    pub(crate) fn ready(topic: Topic, resolution: Resolution<R>) -> Self {
        Self {
            topic,
            pending: Mutex::new(Pending::new(None)),
            cancel: CancellationToken::new(),
            resolved: OnceCell::new_with(Some(resolution)),
        }
    }

    /// Runs a single handler on `payload` in its own task, outside any pipeline.
    pub(crate) fn spawn<E>(topic: Topic, subscriber: Subscriber<E, R>, payload: E) -> Self
    where
        E: Send + 'static,
        R: Send + 'static,
    {
        let (completion, future) = Self::channel(topic.clone());

        tokio::spawn(async move {
            let mut slot = EventSlot::new(topic);
            slot.fill(0, payload, Some(completion));
            slot.apply(&subscriber).await;
            slot.finish();
        });

        future
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Waits for the outcome. Only the first call waits; later calls return the
    /// memoized outcome immediately.
    ///
    /// # Cancellation Safety
    ///
    /// This method is cancellation safe: dropping the future before it completes
    /// leaves the outcome in place for the next call.
    pub async fn resolution(&self) -> &Resolution<R> {
        self.resolved.get_or_init(|| self.receive()).await
    }

    async fn receive(&self) -> Resolution<R> {
        let mut pending = self.pending.lock().await;

        if let Some(resolution) = pending.received.take() {
            return resolution;
        }
        let Some(receiver) = pending.receiver.as_mut() else {
            return self.abandoned();
        };

        let resolution = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Resolution::Cancelled,
            outcome = &mut *receiver => match outcome {
                Ok(resolution) => resolution,
                Err(_) => self.abandoned(),
            },
        };

        // Dropping the receiver tells the pipeline nobody is listening any more.
        pending.receiver = None;
        resolution
    }

    fn abandoned(&self) -> Resolution<R> {
        warn!(topic = %self.topic, "event was discarded before its handler chain finished");
        Resolution::Abandoned
    }

    /// Memoizes the outcome if it can be had without waiting.
    fn poll_resolution(&self) -> Option<&Resolution<R>> {
        if let Some(resolution) = self.resolved.get() {
            return Some(resolution);
        }

        // Held by an awaited read, which will memoize the outcome itself.
        let mut pending = self.pending.try_lock().ok()?;

        let resolution = match pending.receiver.as_mut()?.try_recv() {
            Ok(resolution) => resolution,
            Err(TryRecvError::Closed) => self.abandoned(),
            Err(TryRecvError::Empty) if self.cancel.is_cancelled() => Resolution::Cancelled,
            Err(TryRecvError::Empty) => return None,
        };
        pending.receiver = None;

        if let Err(error) = self.resolved.set(resolution) {
            // An awaited read is between claiming the cell and locking `pending`.
            pending.received = Some(match error {
                SetError::AlreadyInitializedError(resolution)
                | SetError::InitializingError(resolution) => resolution,
            });
        }
        drop(pending);

        self.resolved.get()
    }

    /// Stops waiting for the outcome.
    ///
    /// An unresolved handle resolves to [`Resolution::Cancelled`], waking any caller
    /// blocked on it. An already resolved handle is unaffected. The event itself is
    /// not withdrawn; its handlers still run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the outcome is available, without waiting for it.
    ///
    /// An outcome that has arrived is memoized here even if nobody has awaited the
    /// handle yet.
    pub fn is_resolved(&self) -> bool {
        self.poll_resolution().is_some()
    }

    /// The outcome, if it is available without waiting.
    pub fn try_resolution(&self) -> Option<&Resolution<R>> {
        self.poll_resolution()
    }
}

impl<R: Clone> ResultFuture<R> {
    /// Waits for the result the handler chain left behind.
    ///
    /// Returns `None` if no handler set a result, or if the event was abandoned or
    /// the wait cancelled.
    pub async fn get(&self) -> Option<R> {
        self.resolution().await.value().cloned()
    }

    /// Like [`get`](Self::get), giving up after `timeout`.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] if the outcome is not available in time. The handle
    /// stays usable; a later call can still receive the outcome.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<Option<R>> {
        tokio::time::timeout(timeout, self.get())
            .await
            .map_err(|_| Error::Timeout(timeout))
    }

    /// Blocks the current thread until the result is available.
    ///
    /// Intended for synchronous callers. Calling it from within the runtime that
    /// drives the pipeline can deadlock that runtime.
    pub fn blocking_get(&self) -> Option<R> {
        futures::executor::block_on(self.get())
    }
}
