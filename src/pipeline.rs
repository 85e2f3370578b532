use crate::barrier::{Barrier, Closed};
use crate::config::{BusConfig, WaitStrategy};
use crate::error::{Error, Result};
use crate::event::EventSlot;
use crate::future::{Completion, Resolution};
use crate::handler::HandlerKey;
use crate::registry::HandlerSet;
use crate::ring_buffer::RingBuffer;
use crate::sequencer::Sequencer;
use crate::stage::Stage;
use crate::topic::Topic;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info_span, trace};

/// State shared by a pipeline's producer and its stage tasks.
pub(crate) struct Shared<E, R> {
    /// Tags the stage tasks' own log records.
    pub(crate) topic: Topic,
    pub(crate) buffer: RingBuffer<EventSlot<E, R>>,
    /// Advanced by the producer as it publishes.
    pub(crate) published: Barrier,
    /// One per handler, in chain order.
    pub(crate) stages: Box<[Barrier]>,
    pub(crate) wait_strategy: WaitStrategy,
}

impl<E, R> Shared<E, R> {
    pub(crate) fn new(topic: Topic, capacity: usize, stages: usize, wait_strategy: WaitStrategy) -> Self {
        Self {
            buffer: RingBuffer::new(capacity, || EventSlot::new(topic.clone())),
            published: Barrier::default(),
            stages: (0..stages).map(|_| Barrier::default()).collect(),
            wait_strategy,
            topic,
        }
    }

    /// The barrier stage `index` consumes behind.
    pub(crate) fn upstream(&self, index: usize) -> &Barrier {
        match index {
            0 => &self.published,
            _ => &self.stages[index - 1],
        }
    }

    /// The barrier the producer must not lap: the last stage of the chain.
    pub(crate) fn gating(&self) -> &Barrier {
        self.stages.last().unwrap_or(&self.published)
    }
}

/// The handler chain of one topic, running behind its own ring buffer.
///
/// Built once per topic on first publish. Every handler runs as its own stage task;
/// an event reaches handler *i+1* only after handler *i* has finished with it. A topic
/// without handlers gets a pipeline with no ring and no tasks, and publishing to it
/// does nothing.
pub struct DispatchPipeline<E, R> {
    topic: Topic,
    handlers: Arc<HandlerSet<E, R>>,
    sequencer: Option<Sequencer<E, R>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<E, R> DispatchPipeline<E, R>
where
    E: Send + 'static,
    R: Send + 'static,
{
    /// Allocates the ring and spawns one stage task per handler.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn build(handlers: Arc<HandlerSet<E, R>>, config: &BusConfig) -> Self {
        let topic = handlers.topic().clone();

        if handlers.is_empty() {
            return Self {
                topic,
                handlers,
                sequencer: None,
                tasks: Mutex::default(),
            };
        }

        let shared = Arc::new(Shared::new(
            topic.clone(),
            config.capacity(),
            handlers.len(),
            config.wait_strategy(),
        ));

        let tasks = handlers
            .iter()
            .enumerate()
            .map(|(index, subscriber)| {
                let span = info_span!("stage", %topic, handler = %subscriber.key());
                let stage = Stage::new(Arc::clone(&shared), index, subscriber.clone());
                tokio::spawn(stage.run().instrument(span))
            })
            .collect();

        debug!(
            %topic,
            capacity = config.capacity(),
            stages = handlers.len(),
            "built dispatch pipeline"
        );

        Self {
            topic,
            handlers,
            sequencer: Some(Sequencer::new(shared)),
            tasks: Mutex::new(tasks),
        }
    }

    /// Publishes `payload` to the first stage.
    ///
    /// Waits while the ring is full. When the chain is empty, the event is dropped
    /// and `completion` resolves at once.
    ///
    /// # Errors
    /// Returns [`Error::PipelineClosed`] once the pipeline has been shut down.
    pub(crate) async fn dispatch(&self, payload: E, completion: Option<Completion<R>>) -> Result<()> {
        let Some(sequencer) = &self.sequencer else {
            trace!(topic = %self.topic, "no handlers; event dropped");
            if let Some(completion) = completion {
                let _ = completion.send(Resolution::Completed(None));
            }
            return Ok(());
        };

        let claim = sequencer
            .claim()
            .await
            .map_err(|Closed| Error::PipelineClosed(self.topic.clone()))?;
        claim.publish(payload, completion);
        Ok(())
    }

    /// Stops accepting events, lets every stage drain what was already published,
    /// and waits for the stage tasks to exit.
    pub(crate) async fn shutdown(&self) {
        if let Some(sequencer) = &self.sequencer {
            sequencer.close().await;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(error) = task.await {
                error!(topic = %self.topic, %error, "stage task ended abnormally");
            }
        }

        debug!(topic = %self.topic, published = self.published(), "dispatch pipeline stopped");
    }
}

impl<E, R> DispatchPipeline<E, R> {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// The chain this pipeline runs, in order.
    pub fn handlers(&self) -> &HandlerSet<E, R> {
        &self.handlers
    }

    pub fn handler_keys(&self) -> impl Iterator<Item = &HandlerKey> {
        self.handlers.keys()
    }

    /// Whether the topic has no handlers, in which case events are dropped on publish.
    pub fn is_empty(&self) -> bool {
        self.sequencer.is_none()
    }

    /// Ring buffer slots, or `None` for a pipeline without handlers.
    pub fn capacity(&self) -> Option<usize> {
        self.shared().map(|shared| shared.buffer.capacity())
    }

    /// Number of events published to this pipeline so far.
    pub fn published(&self) -> u64 {
        self.shared()
            .map_or(0, |shared| count(shared.published.cursor()))
    }

    /// Number of events every handler of the chain has finished with.
    pub fn completed(&self) -> u64 {
        self.shared()
            .map_or(0, |shared| count(shared.gating().cursor()))
    }

    /// Whether the pipeline has stopped accepting events.
    pub fn is_closed(&self) -> bool {
        self.shared()
            .is_some_and(|shared| shared.published.is_closed())
    }

    /// Closes the ring to new events without waiting for the stages. Only for callers
    /// that hold the pipeline exclusively enough that no claim is in flight.
    pub(crate) fn close(&self) {
        if let Some(shared) = self.shared() {
            shared.published.close();
        }
    }

    fn shared(&self) -> Option<&Shared<E, R>> {
        self.sequencer.as_ref().map(Sequencer::shared)
    }
}

fn count(cursor: i64) -> u64 {
    u64::try_from(cursor + 1).unwrap_or(0)
}

impl<E, R> fmt::Debug for DispatchPipeline<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPipeline")
            .field("topic", &self.topic)
            .field("handlers", &self.handler_keys().collect::<Vec<_>>())
            .field("capacity", &self.capacity())
            .field("published", &self.published())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DomainEvent;
    use crate::future::ResultFuture;
    use crate::handler::{HandlerError, Subscriber, handler_fn};
    use crate::registry::HandlerRegistry;
    use tokio::time::{Duration, timeout};

    fn topic(name: &str) -> Topic {
        Topic::new(name).unwrap()
    }

    fn appender(key: &'static str) -> Subscriber<Vec<&'static str>, usize> {
        Subscriber::new(
            key,
            handler_fn(move |event: &mut DomainEvent<'_, Vec<&'static str>, usize>| -> Result<(), HandlerError> {
                event.payload_mut().push(key);
                let seen = event.payload().len();
                event.set_result(seen);
                Ok(())
            }),
        )
    }

    #[test]
    fn test_shared_state_is_tagged_with_its_topic() {
        let shared = Shared::<u32, u32>::new(topic("orderPlaced"), 4, 3, WaitStrategy::Blocking);

        assert_eq!(shared.topic.as_str(), "orderPlaced");
        assert_eq!(shared.stages.len(), 3);
        assert!(std::ptr::eq(shared.upstream(0), &shared.published));
        assert!(std::ptr::eq(shared.upstream(2), &shared.stages[1]));
        assert!(std::ptr::eq(shared.gating(), &shared.stages[2]));
    }

    #[tokio::test]
    async fn test_empty_pipeline_drops_events() {
        let registry = HandlerRegistry::<u32, u32>::new();
        let pipeline = DispatchPipeline::build(registry.resolve(&topic("idle")), &BusConfig::default());

        assert!(pipeline.is_empty());
        assert_eq!(pipeline.capacity(), None);

        let (completion, future) = ResultFuture::channel(topic("idle"));
        pipeline.dispatch(1, Some(completion)).await.unwrap();
        assert_eq!(future.resolution().await, &Resolution::Completed(None));
        assert_eq!(pipeline.published(), 0);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_chain_hands_last_result_to_publisher() {
        let registry = HandlerRegistry::new();
        let orders = topic("orderPlaced");
        registry.register(orders.clone(), appender("b")).unwrap();
        registry.register(orders.clone(), appender("a")).unwrap();
        let pipeline = DispatchPipeline::build(registry.resolve(&orders), &BusConfig::new(8).unwrap());

        assert_eq!(pipeline.capacity(), Some(8));
        assert_eq!(
            pipeline.handler_keys().map(HandlerKey::as_str).collect::<Vec<_>>(),
            ["a", "b"]
        );

        let (completion, future) = ResultFuture::channel(orders.clone());
        pipeline.dispatch(Vec::new(), Some(completion)).await.unwrap();

        let value = timeout(Duration::from_millis(500), future.get())
            .await
            .expect("chain should complete");
        assert_eq!(value, Some(2));
        assert_eq!(pipeline.published(), 1);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_refuses_new_events() {
        let registry = HandlerRegistry::new();
        let orders = topic("orderPlaced");
        registry.register(orders.clone(), appender("only")).unwrap();
        let pipeline = DispatchPipeline::build(registry.resolve(&orders), &BusConfig::new(4).unwrap());

        let mut futures = Vec::new();
        for _ in 0..3 {
            let (completion, future) = ResultFuture::channel(orders.clone());
            pipeline.dispatch(Vec::new(), Some(completion)).await.unwrap();
            futures.push(future);
        }

        timeout(Duration::from_millis(500), pipeline.shutdown())
            .await
            .expect("shutdown should finish once the stages drain");

        assert!(pipeline.is_closed());
        assert_eq!(pipeline.completed(), 3);
        for future in &futures {
            assert_eq!(future.resolution().await, &Resolution::Completed(Some(1)));
        }

        assert_eq!(
            pipeline.dispatch(Vec::new(), None).await,
            Err(Error::PipelineClosed(orders))
        );
    }

    #[tokio::test]
    async fn test_dropping_pipeline_abandons_nothing_already_published() {
        let registry = HandlerRegistry::new();
        let orders = topic("orderPlaced");
        registry.register(orders.clone(), appender("only")).unwrap();
        let pipeline = DispatchPipeline::build(registry.resolve(&orders), &BusConfig::new(4).unwrap());

        let (completion, future) = ResultFuture::channel(orders);
        pipeline.dispatch(Vec::new(), Some(completion)).await.unwrap();
        drop(pipeline);

        let value = timeout(Duration::from_millis(500), future.get())
            .await
            .expect("the stage should still drain after the pipeline is dropped");
        assert_eq!(value, Some(1));
    }
}
