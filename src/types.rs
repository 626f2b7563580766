//! Core types for the bus.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A published message. Usually a JSON object, but any value can travel.
pub type Message = serde_json::Value;

/// Unique identifier for a subscriber, allocated per bus in creation order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub u64);

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self.0)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Registered and receiving.
    Active,
    /// Deregistered, waiting for the forced cutover to release retention.
    Destroying,
    /// Terminal.
    Destroyed,
}

/// Buffering sub-state, orthogonal to [`Lifecycle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferingState {
    /// Retention was never requested.
    NotRetaining,
    /// Pushed messages are kept in the retention buffer.
    Retaining,
    /// A cutover fired; retention is permanently off.
    CutOver,
}

impl BufferingState {
    pub fn is_retaining(self) -> bool {
        matches!(self, BufferingState::Retaining)
    }
}

/// How an upstream forwards into its downstream relays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    /// Enqueue each item straight onto the downstream's delivery queue.
    #[default]
    Raw,
    /// Re-test each item against the downstream's own pattern and run it
    /// through the downstream's full push path.
    Filtered,
}
