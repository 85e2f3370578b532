use crate::event::DomainEvent;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

/// The error type a handler reports a failed event with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A subscriber to a topic.
///
/// Handlers of a topic form a chain: each sees an event only after every handler
/// ordered before it has returned, and may read or change the payload and the result.
/// The result left behind by the last handler is what the publisher receives.
///
/// Returning an error (or panicking) marks this handler as failed for this event. The
/// failure is logged with the topic and handler key and the chain carries on.
#[async_trait]
pub trait EventHandler<E, R>: Send + Sync + 'static {
    async fn handle(&self, event: &mut DomainEvent<'_, E, R>) -> Result<(), HandlerError>;
}

/// The ordering tag of a handler within its topic's chain.
///
/// Chains run in ascending lexicographic order of their keys. Handlers registered
/// under the same key run in registration order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerKey(Arc<str>);

impl HandlerKey {
    /// Keys a handler by its fully-qualified type name.
    pub fn of<H: ?Sized>() -> Self {
        Self(Arc::from(std::any::type_name::<H>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerKey {
    fn from(key: &str) -> Self {
        Self(Arc::from(key))
    }
}

impl From<String> for HandlerKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

/// A handler together with its ordering key.
pub struct Subscriber<E, R> {
    key: HandlerKey,
    handler: Arc<dyn EventHandler<E, R>>,
}

impl<E, R> Subscriber<E, R> {
    pub fn new(key: impl Into<HandlerKey>, handler: impl EventHandler<E, R>) -> Self {
        Self::from_arc(key, Arc::new(handler))
    }

    /// Keys the handler by its type name.
    pub fn typed<H: EventHandler<E, R>>(handler: H) -> Self {
        Self::new(HandlerKey::of::<H>(), handler)
    }

    pub fn from_arc(key: impl Into<HandlerKey>, handler: Arc<dyn EventHandler<E, R>>) -> Self {
        Self {
            key: key.into(),
            handler,
        }
    }

    pub fn key(&self) -> &HandlerKey {
        &self.key
    }

    /// Runs the handler on `event`, isolating the caller from its failures.
    ///
    /// Returns `false` if the handler returned an error or panicked.
    pub(crate) async fn invoke(&self, event: &mut DomainEvent<'_, E, R>) -> bool
    where
        E: 'static,
        R: 'static,
    {
        let outcome = AssertUnwindSafe(self.handler.handle(event))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                error!(
                    topic = %event.topic(),
                    handler = %self.key,
                    sequence = event.sequence(),
                    %error,
                    "handler failed"
                );
                false
            }
            Err(panic) => {
                error!(
                    topic = %event.topic(),
                    handler = %self.key,
                    sequence = event.sequence(),
                    panic = panic_message(panic.as_ref()),
                    "handler panicked"
                );
                false
            }
        }
    }
}

impl<E, R> Clone for Subscriber<E, R> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<E, R> fmt::Debug for Subscriber<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("key", &self.key).finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

/// Adapts a synchronous closure into an [`EventHandler`]. See [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wraps a closure as a handler.
///
/// ```rust,ignore
/// bus.register("orderPlaced", "audit", handler_fn(|event: &mut DomainEvent<'_, Order, String>| {
///     event.payload_mut().audited = true;
///     Ok(())
/// }))?;
/// ```
pub fn handler_fn<E, R, F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut DomainEvent<'_, E, R>) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<E, R, F> EventHandler<E, R> for FnHandler<F>
where
    E: Send + 'static,
    R: Send + 'static,
    F: Fn(&mut DomainEvent<'_, E, R>) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, event: &mut DomainEvent<'_, E, R>) -> Result<(), HandlerError> {
        (self.0)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSlot;
    use crate::topic::Topic;

    struct Doubler;

    #[async_trait]
    impl EventHandler<u32, u32> for Doubler {
        async fn handle(&self, event: &mut DomainEvent<'_, u32, u32>) -> Result<(), HandlerError> {
            let doubled = *event.payload() * 2;
            event.set_result(doubled);
            Ok(())
        }
    }

    fn slot(payload: u32) -> EventSlot<u32, u32> {
        let mut slot = EventSlot::new(Topic::new("numbers").unwrap());
        slot.fill(0, payload, None);
        slot
    }

    #[test]
    fn test_keys_order_lexicographically() {
        let audit = HandlerKey::from("app::AuditHandler");
        let billing = HandlerKey::from("app::BillingHandler".to_string());

        assert!(audit < billing);
        assert_eq!(audit.to_string(), "app::AuditHandler");
    }

    #[test]
    fn test_typed_key_uses_type_name() {
        let subscriber = Subscriber::typed(Doubler);
        assert!(subscriber.key().as_str().ends_with("Doubler"));
        assert_eq!(subscriber.key(), &HandlerKey::of::<Doubler>());
    }

    #[tokio::test]
    async fn test_invoke_runs_handler() {
        let subscriber = Subscriber::typed(Doubler);
        let mut slot = slot(21);

        let mut event = slot.event().unwrap();
        assert!(subscriber.invoke(&mut event).await);
        assert_eq!(event.result(), Some(&42));
    }

    #[tokio::test]
    async fn test_invoke_contains_errors_and_panics() {
        let failing = Subscriber::new(
            "failing",
            handler_fn(|_: &mut DomainEvent<'_, u32, u32>| Err("boom".into())),
        );
        let panicking = Subscriber::new(
            "panicking",
            handler_fn(|_: &mut DomainEvent<'_, u32, u32>| panic!("handler blew up")),
        );
        let mut slot = slot(1);

        let mut event = slot.event().unwrap();
        assert!(!failing.invoke(&mut event).await);
        assert!(!panicking.invoke(&mut event).await);
        assert_eq!(*event.payload(), 1);
    }

    #[test]
    fn test_panic_message_extraction() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(7u8);

        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "<non-string panic payload>");
    }
}
