//! Error types for the bus.

use crate::types::SubscriberId;
use thiserror::Error;

/// Main error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid subscribe options: {0}")]
    InvalidOptions(String),

    #[error("Subscriber {downstream} already has a relayer")]
    DuplicateRelayer { downstream: SubscriberId },

    #[error("Relaying {upstream} into {downstream} would form a cycle")]
    RelayCycle {
        upstream: SubscriberId,
        downstream: SubscriberId,
    },

    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Serialization(e.to_string())
    }
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
