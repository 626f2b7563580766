//! Subscribers: pattern-filtered delivery queues with retention, relay and
//! cutover.
//!
//! A subscriber receives every published message matching its pattern, in
//! publish order. Optionally it:
//! - Retains the last `max` messages for replay
//! - Relays what it receives into downstream subscribers
//! - Cuts over after a delay, dropping its history for good
//!
//! # Example
//!
//! ```ignore
//! let bus = Bus::new();
//!
//! // Keep recent history until a late consumer attaches
//! let live = bus.subscribe(json!({"topic": "live"}), SubscribeOptions::default().retain())?;
//! bus.publish(&json!({"topic": "live", "content": "1st"}));
//!
//! let late = live.relay(&bus.subscribe(json!({}), SubscribeOptions::default())?)?;
//! live.cutover(Duration::from_secs(5));
//!
//! for message in &late {
//!     println!("Got message: {}", message);
//! }
//! ```

mod delivery;
mod subscriber;
mod types;

pub use delivery::MessageListener;
pub use subscriber::Subscriber;
pub use types::{SubscribeOptions, Transform, DEFAULT_FALLBACK_CUTOVER};
