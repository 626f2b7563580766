//! The bus: a registry of subscribers and the publish fan-out.

use crate::error::{BusError, Result};
use crate::matcher;
use crate::scheduler::{Scheduler, ThreadScheduler};
use crate::subscriptions::{SubscribeOptions, Subscriber};
use crate::types::{Message, SubscriberId};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Instrumentation hook fired after each successful subscribe.
pub type SubscribeHook = Arc<dyn Fn(&Subscriber) + Send + Sync>;

/// Bus configuration.
#[derive(Clone)]
pub struct BusConfig {
    /// Timer source for cutovers.
    pub scheduler: Arc<dyn Scheduler>,

    /// Called with every new subscriber.
    pub on_subscribe: Option<SubscribeHook>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            scheduler: Arc::new(ThreadScheduler::new()),
            on_subscribe: None,
        }
    }
}

impl BusConfig {
    pub fn with_scheduler(scheduler: impl Scheduler + 'static) -> Self {
        Self {
            scheduler: Arc::new(scheduler),
            ..Default::default()
        }
    }

    pub fn on_subscribe<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Subscriber) + Send + Sync + 'static,
    {
        self.on_subscribe = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConfig")
            .field("on_subscribe", &self.on_subscribe.is_some())
            .finish_non_exhaustive()
    }
}

/// Active subscribers, keyed by creation order.
pub(crate) struct Registry {
    subscribers: RwLock<BTreeMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
}

impl Registry {
    fn new() -> Self {
        Self {
            subscribers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> SubscriberId {
        SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn insert(&self, subscriber: Subscriber) {
        self.subscribers.write().insert(subscriber.id(), subscriber);
    }

    pub(crate) fn remove(&self, id: SubscriberId) {
        self.subscribers.write().remove(&id);
    }

    /// Copy of the membership, so fan-out is stable against concurrent
    /// subscribe and destroy.
    fn snapshot(&self) -> Vec<Subscriber> {
        self.subscribers.read().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// In-process publish/subscribe bus.
///
/// Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct Bus {
    registry: Arc<Registry>,
    config: BusConfig,
}

impl Bus {
    /// Create a bus with the wall-clock scheduler.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            config,
        }
    }

    /// Structural match test used for every subscriber.
    pub fn matches(message: &Message, pattern: &Message) -> bool {
        matcher::matches(message, pattern)
    }

    /// Register a subscriber for messages matching `pattern`.
    pub fn subscribe(&self, pattern: Message, options: SubscribeOptions) -> Result<Subscriber> {
        if !matcher::is_valid_pattern(&pattern) {
            return Err(BusError::InvalidPattern(format!(
                "pattern must be an object, got {}",
                pattern
            )));
        }
        options.validate()?;

        let id = self.registry.allocate_id();
        let subscriber = Subscriber::new(
            id,
            pattern,
            options,
            Arc::downgrade(&self.registry),
            Arc::clone(&self.config.scheduler),
        );
        self.registry.insert(subscriber.clone());
        debug!(subscriber = %id, pattern = %subscriber.pattern(), "subscribed");

        if let Some(hook) = &self.config.on_subscribe {
            hook(&subscriber);
        }

        Ok(subscriber)
    }

    /// Broadcast `message` to every matching subscriber. Never blocks.
    ///
    /// A transform failure drops the message for that subscriber only; the
    /// rest of the fan-out continues. Returns how many subscribers accepted it.
    pub fn publish(&self, message: &Message) -> usize {
        let mut delivered = 0;

        for subscriber in self.registry.snapshot() {
            match subscriber.push_on_match(message) {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    subscriber = %subscriber.id(),
                    error = %e,
                    "message dropped for subscriber"
                ),
            }
        }

        trace!(delivered, "published");
        delivered
    }

    /// Serialize `message` to JSON and publish it.
    pub fn publish_as<T: Serialize>(&self, message: &T) -> Result<usize> {
        let value = serde_json::to_value(message)?;
        Ok(self.publish(&value))
    }

    /// Destroy every registered subscriber. Idempotent.
    pub fn destroy(&self) {
        let subscribers = self.registry.snapshot();
        debug!(count = subscribers.len(), "destroying bus subscribers");
        for subscriber in subscribers {
            subscriber.destroy();
        }
    }

    /// Number of registered (active) subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("subscribers", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn manual_bus() -> (Bus, ManualScheduler) {
        let scheduler = ManualScheduler::new();
        (
            Bus::with_config(BusConfig::with_scheduler(scheduler.clone())),
            scheduler,
        )
    }

    #[test]
    fn test_subscribe_registers() {
        let bus = Bus::new();
        let sub = bus.subscribe(json!({}), SubscribeOptions::default()).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(sub.id(), SubscriberId(1));
    }

    #[test]
    fn test_invalid_pattern_creates_nothing() {
        let bus = Bus::new();
        let result = bus.subscribe(json!("invalid pattern"), SubscribeOptions::default());
        assert!(matches!(result, Err(BusError::InvalidPattern(_))));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_publish_counts_matches() {
        let bus = Bus::new();
        let _news = bus
            .subscribe(json!({"topic": "news"}), SubscribeOptions::default())
            .unwrap();
        let _all = bus.subscribe(json!({}), SubscribeOptions::default()).unwrap();

        assert_eq!(bus.publish(&json!({"topic": "news"})), 2);
        assert_eq!(bus.publish(&json!({"topic": "other"})), 1);
    }

    #[test]
    fn test_on_subscribe_hook() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let bus = Bus::with_config(BusConfig::default().on_subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bus.subscribe(json!({}), SubscribeOptions::default()).unwrap();
        let _ = bus.subscribe(json!(1), SubscribeOptions::default());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_destroy_deregisters_immediately() {
        let (bus, scheduler) = manual_bus();
        let sub = bus.subscribe(json!({}), SubscribeOptions::default()).unwrap();

        bus.destroy();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(&json!({"late": true})), 0);

        scheduler.advance(Duration::ZERO);
        assert!(sub.recv().is_err());

        bus.destroy();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
