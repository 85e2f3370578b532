//! Resolves the ordered chain of handlers subscribed to a topic.
//!
//! Handlers reach the registry in two ways: explicit registration at startup, and an
//! optional [`HandlerLookup`] collaborator that names subscribers per topic and hands
//! out instances on request. A topic's chain is assembled on first use, sorted by
//! [`HandlerKey`], and cached for the life of the registry.

use crate::error::{Error, Result};
use crate::handler::{HandlerKey, Subscriber};
use crate::topic::Topic;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{debug, warn};

/// Supplies subscribers that are not registered explicitly, for example from a
/// component container.
///
/// Consulted at most once per topic.
pub trait HandlerLookup<E, R>: Send + Sync + 'static {
    /// Names of the handlers subscribed to `topic`, if any.
    fn lookup(&self, topic: &Topic) -> Option<Vec<String>>;

    /// An instance of the handler registered under `name`.
    fn instantiate(&self, name: &str) -> Option<Subscriber<E, R>>;
}

/// The handlers of one topic, in chain order.
pub struct HandlerSet<E, R> {
    topic: Topic,
    subscribers: Vec<Subscriber<E, R>>,
}

impl<E, R> HandlerSet<E, R> {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscriber<E, R>> {
        self.subscribers.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &HandlerKey> {
        self.subscribers.iter().map(Subscriber::key)
    }
}

impl<E, R> fmt::Debug for HandlerSet<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSet")
            .field("topic", &self.topic)
            .field("handlers", &self.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Explicit registrations, and the topics whose chains have been assembled from them.
struct Registrations<E, R> {
    subscribers: HashMap<Topic, Vec<Subscriber<E, R>>>,
    sealed: HashSet<Topic>,
}

impl<E, R> Default for Registrations<E, R> {
    fn default() -> Self {
        Self {
            subscribers: HashMap::new(),
            sealed: HashSet::new(),
        }
    }
}

pub struct HandlerRegistry<E, R> {
    /// Registering and sealing a topic happen under this one lock, so a registration
    /// either makes it into the chain or is refused.
    registered: Mutex<Registrations<E, R>>,
    lookup: Option<Box<dyn HandlerLookup<E, R>>>,
    resolved: papaya::HashMap<Topic, Arc<OnceLock<Arc<HandlerSet<E, R>>>>>,
}

impl<E, R> Default for HandlerRegistry<E, R> {
    fn default() -> Self {
        Self {
            registered: Default::default(),
            lookup: None,
            resolved: Default::default(),
        }
    }
}

impl<E: 'static, R: 'static> HandlerRegistry<E, R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lookup(lookup: impl HandlerLookup<E, R>) -> Self {
        Self {
            lookup: Some(Box::new(lookup)),
            ..Self::default()
        }
    }

    /// Adds a handler to `topic`'s chain.
    ///
    /// # Errors
    /// Returns [`Error::TopicSealed`] once the topic's chain has been resolved; a
    /// running pipeline never changes its handlers.
    pub fn register(&self, topic: Topic, subscriber: Subscriber<E, R>) -> Result<()> {
        let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);

        if registered.sealed.contains(&topic) {
            return Err(Error::TopicSealed(topic));
        }

        registered.subscribers.entry(topic).or_default().push(subscriber);
        Ok(())
    }

    pub fn is_resolved(&self, topic: &str) -> bool {
        self.resolved
            .pin()
            .get(topic)
            .is_some_and(|cell| cell.get().is_some())
    }

    /// Returns `topic`'s handlers in chain order, assembling them on first use.
    ///
    /// A topic without handlers resolves to an empty set; publishing to it is a no-op.
    pub fn resolve(&self, topic: &Topic) -> Arc<HandlerSet<E, R>> {
        let cell = Arc::clone(
            self.resolved
                .pin()
                .get_or_insert_with(topic.clone(), Default::default),
        );

        Arc::clone(cell.get_or_init(|| Arc::new(self.assemble(topic))))
    }

    fn assemble(&self, topic: &Topic) -> HandlerSet<E, R> {
        let mut subscribers = {
            let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
            registered.sealed.insert(topic.clone());
            registered.subscribers.remove(topic).unwrap_or_default()
        };

        if let Some(lookup) = &self.lookup {
            for name in lookup.lookup(topic).unwrap_or_default() {
                match lookup.instantiate(&name) {
                    Some(subscriber) => subscribers.push(subscriber),
                    None => warn!(%topic, handler = %name, "no instance available for subscribed handler"),
                }
            }
        }

        // Stable, so equal keys keep registration order.
        subscribers.sort_by(|a, b| a.key().cmp(b.key()));

        let set = HandlerSet {
            topic: topic.clone(),
            subscribers,
        };

        if set.is_empty() {
            warn!(%topic, "no consumer registered for topic");
        } else {
            debug!(%topic, handlers = ?set.keys().collect::<Vec<_>>(), "resolved handler chain");
        }

        set
    }
}

impl<E, R> fmt::Debug for HandlerRegistry<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("has_lookup", &self.lookup.is_some())
            .field("resolved_topics", &self.resolved.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DomainEvent, EventSlot};
    use crate::handler::{HandlerError, handler_fn};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    fn noop(key: &str) -> Subscriber<u32, ()> {
        Subscriber::new(
            key,
            handler_fn(|_: &mut DomainEvent<'_, u32, ()>| -> Result<(), HandlerError> { Ok(()) }),
        )
    }

    fn topic(name: &str) -> Topic {
        Topic::new(name).unwrap()
    }

    fn keys(set: &HandlerSet<u32, ()>) -> Vec<&str> {
        set.keys().map(HandlerKey::as_str).collect()
    }

    struct ContainerLookup {
        lookups: Arc<AtomicUsize>,
    }

    impl HandlerLookup<u32, ()> for ContainerLookup {
        fn lookup(&self, topic: &Topic) -> Option<Vec<String>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            match topic.as_str() {
                "orderPlaced" => Some(vec!["shipping".to_string(), "missing".to_string()]),
                _ => None,
            }
        }

        fn instantiate(&self, name: &str) -> Option<Subscriber<u32, ()>> {
            (name != "missing").then(|| noop(&format!("app::{name}")))
        }
    }

    #[test]
    fn test_chain_is_sorted_by_key_not_registration_order() {
        let registry = HandlerRegistry::new();
        let orders = topic("orderPlaced");
        registry.register(orders.clone(), noop("c::Shipping")).unwrap();
        registry.register(orders.clone(), noop("a::Audit")).unwrap();
        registry.register(orders.clone(), noop("b::Billing")).unwrap();

        let set = registry.resolve(&orders);
        assert_eq!(keys(&set), ["a::Audit", "b::Billing", "c::Shipping"]);
        assert_eq!(set.topic(), &orders);
    }

    #[tokio::test]
    async fn test_equal_keys_keep_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::new();
        let orders = topic("orderPlaced");
        for label in ["first", "second"] {
            let seen = Arc::clone(&seen);
            let handler = handler_fn(move |_: &mut DomainEvent<'_, u32, ()>| -> Result<(), HandlerError> {
                seen.lock().unwrap().push(label);
                Ok(())
            });
            registry
                .register(orders.clone(), Subscriber::new("same", handler))
                .unwrap();
        }

        let mut slot = EventSlot::new(orders.clone());
        slot.fill(0, 1, None);
        for subscriber in registry.resolve(&orders).iter() {
            slot.apply(subscriber).await;
        }

        assert_eq!(*seen.lock().unwrap(), ["first", "second"]);
    }

    #[test]
    #[traced_test]
    fn test_unregistered_topic_resolves_empty_with_warning() {
        let registry = HandlerRegistry::<u32, ()>::new();

        let set = registry.resolve(&topic("unregisteredTopic"));

        assert!(set.is_empty());
        assert!(logs_contain("no consumer registered for topic"));
    }

    #[test]
    fn test_resolution_is_cached() {
        let registry = HandlerRegistry::new();
        let orders = topic("orderPlaced");
        registry.register(orders.clone(), noop("audit")).unwrap();

        let first = registry.resolve(&orders);
        let second = registry.resolve(&orders);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.is_resolved("orderPlaced"));
        assert!(!registry.is_resolved("orderShipped"));
    }

    #[test]
    fn test_registration_after_resolution_is_rejected() {
        let registry = HandlerRegistry::new();
        let orders = topic("orderPlaced");
        registry.resolve(&orders);

        assert_eq!(
            registry.register(orders.clone(), noop("late")),
            Err(Error::TopicSealed(orders.clone()))
        );
        assert!(registry.resolve(&orders).is_empty());
    }

    #[test]
    fn test_registration_racing_resolution_is_kept_or_refused() {
        for _ in 0..200 {
            let registry = HandlerRegistry::new();
            let orders = topic("orderPlaced");
            let start = std::sync::Barrier::new(5);

            let (accepted, chain) = std::thread::scope(|scope| {
                let registrars: Vec<_> = (0..4)
                    .map(|n| {
                        let (registry, orders, start) = (&registry, &orders, &start);
                        scope.spawn(move || {
                            let key = format!("handler{n}");
                            start.wait();
                            match registry.register(orders.clone(), noop(&key)) {
                                Ok(()) => Some(key),
                                Err(error) => {
                                    assert_eq!(error, Error::TopicSealed(orders.clone()));
                                    None
                                }
                            }
                        })
                    })
                    .collect();

                start.wait();
                let chain = registry.resolve(&orders);

                let accepted: Vec<String> = registrars
                    .into_iter()
                    .filter_map(|registrar| registrar.join().unwrap())
                    .collect();
                (accepted, chain)
            });

            let mut accepted = accepted;
            accepted.sort();
            let chain: Vec<String> = chain.keys().map(|key| key.as_str().to_string()).collect();
            assert_eq!(chain, accepted);
        }
    }

    #[test]
    fn test_lookup_merges_with_registrations_and_is_consulted_once() {
        let lookups = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::with_lookup(ContainerLookup {
            lookups: Arc::clone(&lookups),
        });
        let orders = topic("orderPlaced");
        registry.register(orders.clone(), noop("app::audit")).unwrap();

        let set = registry.resolve(&orders);
        registry.resolve(&orders);

        assert_eq!(keys(&set), ["app::audit", "app::shipping"]);
        assert_eq!(lookups.load(Ordering::SeqCst), 1);

        assert!(registry.resolve(&topic("other")).is_empty());
        assert_eq!(lookups.load(Ordering::SeqCst), 2);
    }
}
