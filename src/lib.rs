//! # iambus
//!
//! An in-process publish/subscribe bus. Producers publish arbitrary JSON
//! messages; consumers subscribe with a partial-match pattern and receive
//! only the messages that satisfy it.
//!
//! ## Core Concepts
//!
//! - **Patterns**: JSON objects; a message matches when it carries every
//!   pattern field with an equal value (nested objects recurse)
//! - **Subscribers**: pull-based FIFO delivery queues, never blocking producers
//! - **Retention**: bounded, oldest-evicting history per subscriber
//! - **Relay**: forward a subscriber's history and live traffic downstream
//! - **Cutover**: drop retained history and switch to live-only
//!
//! ## Example
//!
//! ```ignore
//! use iambus::{Bus, SubscribeOptions};
//! use serde_json::json;
//!
//! let bus = Bus::new();
//! let news = bus.subscribe(json!({"topic": "news"}), SubscribeOptions::default())?;
//!
//! bus.publish(&json!({"topic": "news", "content": "Hello, world!"}));
//!
//! let message = news.recv()?;
//! assert_eq!(message["content"], "Hello, world!");
//! ```

pub mod bus;
pub mod error;
pub mod matcher;
pub mod retention;
pub mod scheduler;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use bus::{Bus, BusConfig, SubscribeHook};
pub use error::{BusError, Result};
pub use matcher::{is_valid_pattern, matches};
pub use retention::{RetentionBuffer, DEFAULT_RETENTION_MAX};
pub use scheduler::{ManualScheduler, Scheduler, ThreadScheduler, TimerHandle, TimerTask};
pub use subscriptions::{
    MessageListener, SubscribeOptions, Subscriber, Transform, DEFAULT_FALLBACK_CUTOVER,
};
pub use types::{BufferingState, Lifecycle, Message, RelayMode, SubscriberId};
