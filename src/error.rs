use crate::topic::Topic;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to callers of the event bus.
///
/// Handler failures are deliberately absent: they are logged and recorded on the
/// event's [`Resolution`](crate::Resolution), never returned to the publisher.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A topic name was empty.
    #[error("topic name must not be empty")]
    EmptyTopic,

    /// The ring buffer capacity is not a power of two of at least 2.
    #[error("ring buffer capacity must be a power of two and at least 2, got {0}")]
    InvalidCapacity(usize),

    /// Handlers for this topic were already resolved; the set can no longer change.
    #[error("handlers for topic `{0}` are already resolved")]
    TopicSealed(Topic),

    /// The bus has not been started yet.
    #[error("event bus has not been started")]
    NotStarted,

    /// The bus has been stopped.
    #[error("event bus has been stopped")]
    Stopped,

    /// The pipeline for this topic no longer accepts events.
    #[error("pipeline for topic `{0}` is closed")]
    PipelineClosed(Topic),

    /// A bounded wait for a result elapsed.
    #[error("timed out after {0:?} waiting for the event result")]
    Timeout(Duration),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
