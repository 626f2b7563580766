//! Subscription options.

use crate::error::{BusError, Result};
use crate::retention::DEFAULT_RETENTION_MAX;
use crate::types::{Message, RelayMode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How long a retaining subscriber keeps its history when nobody calls
/// `cutover` explicitly.
pub const DEFAULT_FALLBACK_CUTOVER: Duration = Duration::from_millis(180_000);

/// Per-subscriber transform applied to every message before it is retained,
/// relayed or delivered.
pub type Transform = Arc<dyn Fn(Message) -> Result<Message> + Send + Sync>;

/// Options for [`Bus::subscribe`](crate::Bus::subscribe).
#[derive(Clone)]
pub struct SubscribeOptions {
    /// Retention buffer capacity.
    /// Default: 32
    pub max: usize,

    /// Keep a retention buffer for replay to late relays.
    /// Default: false
    pub retain: bool,

    /// Transform applied to each message (None = identity).
    pub map: Option<Transform>,

    /// How this subscriber forwards into its downstream relays.
    pub relay_mode: RelayMode,

    /// Whether attached relays are fed. Can be toggled later with
    /// `Subscriber::set_relaying`.
    /// Default: true
    pub relays: bool,

    /// Delay of the automatic cutover armed when `retain` is set.
    /// Default: 180s
    pub fallback_cutover: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            max: DEFAULT_RETENTION_MAX,
            retain: false,
            map: None,
            relay_mode: RelayMode::default(),
            relays: true,
            fallback_cutover: DEFAULT_FALLBACK_CUTOVER,
        }
    }
}

impl SubscribeOptions {
    /// Enable the retention buffer.
    pub fn retain(mut self) -> Self {
        self.retain = true;
        self
    }

    /// Set the retention buffer capacity.
    pub fn max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    /// Infallible transform.
    pub fn map<F>(mut self, f: F) -> Self
    where
        F: Fn(Message) -> Message + Send + Sync + 'static,
    {
        self.map = Some(Arc::new(move |m: Message| -> Result<Message> { Ok(f(m)) }));
        self
    }

    /// Fallible transform. An error drops the message for this subscriber only.
    pub fn try_map<F>(mut self, f: F) -> Self
    where
        F: Fn(Message) -> Result<Message> + Send + Sync + 'static,
    {
        self.map = Some(Arc::new(f));
        self
    }

    /// Set how messages are forwarded into relays.
    pub fn relay_mode(mut self, mode: RelayMode) -> Self {
        self.relay_mode = mode;
        self
    }

    /// Start with relay forwarding enabled or suspended.
    pub fn relays(mut self, relays: bool) -> Self {
        self.relays = relays;
        self
    }

    /// Set the delay of the automatic cutover.
    pub fn fallback_cutover(mut self, delay: Duration) -> Self {
        self.fallback_cutover = delay;
        self
    }

    /// Check the options before a subscriber is built from them.
    pub fn validate(&self) -> Result<()> {
        if self.max == 0 {
            return Err(BusError::InvalidOptions(
                "max must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("max", &self.max)
            .field("retain", &self.retain)
            .field("map", &self.map.is_some())
            .field("relay_mode", &self.relay_mode)
            .field("relays", &self.relays)
            .field("fallback_cutover", &self.fallback_cutover)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let opts = SubscribeOptions::default();
        assert_eq!(opts.max, 32);
        assert!(!opts.retain);
        assert!(opts.map.is_none());
        assert!(opts.relays);
        assert_eq!(opts.relay_mode, RelayMode::Raw);
        assert_eq!(opts.fallback_cutover, Duration::from_secs(180));
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_zero_max_rejected() {
        let result = SubscribeOptions::default().max(0).validate();
        assert!(matches!(result, Err(BusError::InvalidOptions(_))));
    }

    #[test]
    fn test_map_wraps_infallible_fn() {
        let opts = SubscribeOptions::default().map(|_| json!("mapped"));
        let map = opts.map.expect("map set");
        assert_eq!(map(json!({})).unwrap(), json!("mapped"));
    }
}
