//! The record carried through a pipeline's ring buffer, and the view handlers get of it.

use crate::future::{Completion, Resolution};
use crate::handler::{HandlerKey, Subscriber};
use crate::topic::Topic;
use tracing::{debug, error};

/// A handler's access to the event it is processing.
///
/// The payload is owned by the ring buffer slot; handlers borrow it for the duration
/// of [`EventHandler::handle`](crate::EventHandler::handle) and may change it in
/// place. Whatever result is set when the last handler returns is delivered to the
/// publisher.
#[derive(Debug)]
pub struct DomainEvent<'a, E, R> {
    topic: &'a Topic,
    sequence: i64,
    payload: &'a mut E,
    result: &'a mut Option<R>,
}

impl<E, R> DomainEvent<'_, E, R> {
    pub fn topic(&self) -> &Topic {
        self.topic
    }

    /// Position of this event in its topic's publish order, starting at 0.
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn payload(&self) -> &E {
        self.payload
    }

    pub fn payload_mut(&mut self) -> &mut E {
        self.payload
    }

    pub fn result(&self) -> Option<&R> {
        self.result.as_ref()
    }

    /// Replaces the result, returning the previous one.
    pub fn set_result(&mut self, result: R) -> Option<R> {
        self.result.replace(result)
    }

    pub fn take_result(&mut self) -> Option<R> {
        self.result.take()
    }
}

/// One pre-allocated ring buffer slot.
///
/// Tagged with the topic of the pipeline that owns it. A slot is refilled for every
/// sequence that maps onto it; the failure list keeps its allocation across reuse.
#[derive(Debug)]
pub(crate) struct EventSlot<E, R> {
    topic: Topic,
    sequence: i64,
    payload: Option<E>,
    result: Option<R>,
    failed: Vec<HandlerKey>,
    completion: Option<Completion<R>>,
}

impl<E, R> EventSlot<E, R> {
    pub(crate) fn new(topic: Topic) -> Self {
        Self {
            topic,
            sequence: -1,
            payload: None,
            result: None,
            failed: Vec::new(),
            completion: None,
        }
    }

    pub(crate) fn fill(&mut self, sequence: i64, payload: E, completion: Option<Completion<R>>) {
        self.sequence = sequence;
        self.payload = Some(payload);
        self.result = None;
        self.failed.clear();
        self.completion = completion;
    }

    pub(crate) fn event(&mut self) -> Option<DomainEvent<'_, E, R>> {
        let payload = self.payload.as_mut()?;
        Some(DomainEvent {
            topic: &self.topic,
            sequence: self.sequence,
            payload,
            result: &mut self.result,
        })
    }

    /// Runs one handler of the chain on this slot, recording it if it fails.
    pub(crate) async fn apply(&mut self, subscriber: &Subscriber<E, R>)
    where
        E: 'static,
        R: 'static,
    {
        if self.payload.is_none() {
            error!(
                topic = %self.topic,
                sequence = self.sequence,
                handler = %subscriber.key(),
                "slot reached a handler without a payload"
            );
            return;
        }
        let Some(mut event) = self.event() else {
            return;
        };

        if !subscriber.invoke(&mut event).await {
            self.failed.push(subscriber.key().clone());
        }
    }

    /// Ends the chain for this slot: hands the outcome to the waiting publisher, if
    /// any, and releases the payload.
    pub(crate) fn finish(&mut self) {
        let result = self.result.take();
        self.payload = None;

        let Some(completion) = self.completion.take() else {
            return;
        };

        let resolution = if self.failed.is_empty() {
            Resolution::Completed(result)
        } else {
            Resolution::PartiallyFailed {
                result,
                failed: self.failed.clone(),
            }
        };

        if completion.send(resolution).is_err() {
            debug!(
                topic = %self.topic,
                sequence = self.sequence,
                "result future was dropped before the chain finished"
            );
        }
    }
}
