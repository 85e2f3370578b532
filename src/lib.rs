//! Asynchronous domain-event dispatch.
//!
//! Events are published to a topic and handed, through a per-topic ring buffer, to
//! that topic's ordered chain of handlers. Each handler runs as its own task and sees
//! every event after the handler before it is done with it. Publishers can keep a
//! [`ResultFuture`] to the result the chain leaves behind.
//!
//! ```rust,ignore
//! let bus = EventBus::<Order, String>::new(BusConfig::default());
//! bus.register_typed("orderPlaced", AuditHandler)?;
//! bus.register_typed("orderPlaced", BillingHandler)?;
//! bus.start()?;
//!
//! let receipt = bus.publish_async("orderPlaced", Order { id: 42 }).await?;
//! assert_eq!(receipt.get().await.as_deref(), Some("billed"));
//!
//! bus.stop().await;
//! ```

mod barrier;
mod bus;
mod config;
mod cursor;
mod error;
mod event;
mod future;
mod handler;
mod pipeline;
mod registry;
mod ring_buffer;
mod sequencer;
mod stage;
mod topic;

pub use async_trait::async_trait;

pub use crate::bus::{BusState, EventBus};
pub use crate::config::{BusConfig, DEFAULT_CAPACITY, WaitStrategy};
pub use crate::error::{Error, Result};
pub use crate::event::DomainEvent;
pub use crate::future::{Resolution, ResultFuture};
pub use crate::handler::{EventHandler, FnHandler, HandlerError, HandlerKey, Subscriber, handler_fn};
pub use crate::pipeline::DispatchPipeline;
pub use crate::registry::{HandlerLookup, HandlerRegistry, HandlerSet};
pub use crate::topic::Topic;
