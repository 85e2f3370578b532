//! The publishing façade.
//!
//! An [`EventBus`] owns the handler registry and one [`DispatchPipeline`] per topic,
//! built on the first publish to that topic and kept until the bus stops. Events
//! can only be published while the bus is running:
//!
//! ```text
//!   Idle --start()--> Running --stop()--> Stopped
//! ```

use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::future::{Resolution, ResultFuture};
use crate::handler::{EventHandler, HandlerKey, Subscriber};
use crate::pipeline::DispatchPipeline;
use crate::registry::{HandlerLookup, HandlerRegistry};
use crate::topic::Topic;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::OnceCell;
use tracing::info;

/// Lifecycle of an [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BusState {
    /// Handlers can be registered; nothing can be published yet.
    Idle = 0,
    Running = 1,
    /// Every pipeline has been drained and shut down. Terminal.
    Stopped = 2,
}

impl BusState {
    fn from_u8(state: u8) -> Self {
        match state {
            0 => Self::Idle,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

type PipelineCell<E, R> = Arc<OnceCell<Arc<DispatchPipeline<E, R>>>>;

/// Publishes domain events of type `E` to the handler chains of their topics.
///
/// Handlers may leave a result of type `R` behind; [`publish_async`](Self::publish_async)
/// hands it back to the publisher.
pub struct EventBus<E, R = ()> {
    config: BusConfig,
    registry: HandlerRegistry<E, R>,
    pipelines: papaya::HashMap<Topic, PipelineCell<E, R>>,
    state: AtomicU8,
}

impl<E, R> EventBus<E, R>
where
    E: Send + 'static,
    R: Send + 'static,
{
    pub fn new(config: BusConfig) -> Self {
        Self::with_registry(config, HandlerRegistry::new())
    }

    /// Creates a bus that also asks `lookup` for the subscribers of each topic.
    pub fn with_lookup(config: BusConfig, lookup: impl HandlerLookup<E, R>) -> Self {
        Self::with_registry(config, HandlerRegistry::with_lookup(lookup))
    }

    fn with_registry(config: BusConfig, registry: HandlerRegistry<E, R>) -> Self {
        Self {
            config,
            registry,
            pipelines: papaya::HashMap::new(),
            state: AtomicU8::new(BusState::Idle as u8),
        }
    }

    /// Subscribes `handler` to `topic` under an explicit ordering key.
    ///
    /// # Errors
    /// Returns [`Error::EmptyTopic`] for an empty topic name and
    /// [`Error::TopicSealed`] if events have already been published to `topic`.
    pub fn register(
        &self,
        topic: &str,
        key: impl Into<HandlerKey>,
        handler: impl EventHandler<E, R>,
    ) -> Result<()> {
        self.subscribe(topic, Subscriber::new(key, handler))
    }

    /// Subscribes `handler` to `topic`, ordered by its type name.
    ///
    /// # Errors
    /// See [`register`](Self::register).
    pub fn register_typed<H: EventHandler<E, R>>(&self, topic: &str, handler: H) -> Result<()> {
        self.subscribe(topic, Subscriber::typed(handler))
    }

    /// # Errors
    /// See [`register`](Self::register).
    pub fn subscribe(&self, topic: &str, subscriber: Subscriber<E, R>) -> Result<()> {
        self.registry.register(Topic::new(topic)?, subscriber)
    }

    /// Starts accepting events. Starting a running bus does nothing.
    ///
    /// # Errors
    /// Returns [`Error::Stopped`] if the bus has been stopped; a bus is not restartable.
    pub fn start(&self) -> Result<()> {
        match self.state.compare_exchange(
            BusState::Idle as u8,
            BusState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                info!(capacity = self.config.capacity(), "event bus started");
                Ok(())
            }
            Err(state) => match BusState::from_u8(state) {
                BusState::Stopped => Err(Error::Stopped),
                BusState::Idle | BusState::Running => Ok(()),
            },
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> BusState {
        BusState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Publishes `event` to `topic` without waiting for its handlers.
    ///
    /// Waits only while the topic's ring buffer is full. Publishing to a topic without
    /// handlers returns at once.
    ///
    /// # Errors
    /// Returns [`Error::NotStarted`] or [`Error::Stopped`] outside the running state,
    /// and [`Error::EmptyTopic`] for an empty topic name.
    pub async fn publish(&self, topic: &str, event: E) -> Result<()> {
        let pipeline = self.pipeline_for(topic).await?;
        pipeline.dispatch(event, None).await
    }

    /// Publishes `event` to `topic` and returns a handle to the result its handler
    /// chain leaves behind.
    ///
    /// # Errors
    /// See [`publish`](Self::publish).
    pub async fn publish_async(&self, topic: &str, event: E) -> Result<ResultFuture<R>> {
        let pipeline = self.pipeline_for(topic).await?;

        if pipeline.is_empty() {
            return Ok(ResultFuture::ready(
                pipeline.topic().clone(),
                Resolution::Completed(None),
            ));
        }

        let (completion, future) = ResultFuture::channel(pipeline.topic().clone());
        pipeline.dispatch(event, Some(completion)).await?;
        Ok(future)
    }

    /// Runs a single handler on `event` in its own task, outside the topic's pipeline.
    ///
    /// The handler's failures are isolated the same way as in a chain; the returned
    /// handle resolves once it returns.
    ///
    /// # Errors
    /// See [`publish`](Self::publish).
    pub fn run_detached<H: EventHandler<E, R>>(
        &self,
        topic: &str,
        handler: H,
        event: E,
    ) -> Result<ResultFuture<R>> {
        self.ensure_running()?;
        let topic = Topic::new(topic)?;
        Ok(ResultFuture::spawn(topic, Subscriber::typed(handler), event))
    }

    /// Stops the bus: refuses new events, drains every pipeline, and waits for all
    /// handler tasks to exit.
    pub async fn stop(&self) {
        let previous = BusState::from_u8(self.state.swap(BusState::Stopped as u8, Ordering::AcqRel));
        if previous == BusState::Stopped {
            return;
        }

        let pipelines = self.pipelines();
        for pipeline in &pipelines {
            pipeline.shutdown().await;
        }

        info!(pipelines = pipelines.len(), "event bus stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            BusState::Running => Ok(()),
            BusState::Idle => Err(Error::NotStarted),
            BusState::Stopped => Err(Error::Stopped),
        }
    }

    /// The pipeline for `topic`, built on first use. Concurrent first publishes build
    /// it once.
    async fn pipeline_for(&self, topic: &str) -> Result<Arc<DispatchPipeline<E, R>>> {
        self.ensure_running()?;

        let existing = self
            .pipelines
            .pin()
            .get_key_value(topic)
            .map(|(topic, cell)| (topic.clone(), Arc::clone(cell)));

        let (topic, cell) = match existing {
            Some(entry) => entry,
            None => {
                let topic = Topic::new(topic)?;
                let cell = Arc::clone(
                    self.pipelines
                        .pin()
                        .get_or_insert_with(topic.clone(), Default::default),
                );
                (topic, cell)
            }
        };

        let pipeline = cell
            .get_or_init(|| async {
                let handlers = self.registry.resolve(&topic);
                Arc::new(DispatchPipeline::build(handlers, &self.config))
            })
            .await;

        // `stop` may have swept the pipelines before this one was built.
        if self.state() == BusState::Stopped {
            pipeline.shutdown().await;
            return Err(Error::Stopped);
        }

        Ok(Arc::clone(pipeline))
    }
}

impl<E, R> EventBus<E, R> {
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// The registry the bus resolves handler chains from.
    pub fn registry(&self) -> &HandlerRegistry<E, R> {
        &self.registry
    }

    /// The pipeline already built for `topic`, if any.
    pub fn pipeline(&self, topic: &str) -> Option<Arc<DispatchPipeline<E, R>>> {
        self.pipelines
            .pin()
            .get(topic)
            .and_then(|cell| cell.get().cloned())
    }

    /// Topics with a built pipeline, sorted.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<_> = self
            .pipelines
            .pin()
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    fn pipelines(&self) -> Vec<Arc<DispatchPipeline<E, R>>> {
        self.pipelines
            .pin()
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }
}

impl<E, R> Drop for EventBus<E, R> {
    fn drop(&mut self) {
        // Stage tasks drain what was published and exit; nobody waits for them.
        for pipeline in self.pipelines() {
            pipeline.close();
        }
    }
}

impl<E, R> fmt::Debug for EventBus<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("state", &BusState::from_u8(self.state.load(Ordering::Acquire)))
            .field("config", &self.config)
            .field("topics", &self.topics())
            .finish()
    }
}
