//! Error types for the realtime engine.

use crate::types::Topic;
use thiserror::Error;

/// Main error type for realtime operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Subscription rejected for {topic}: {reason}")]
    SubscriptionRejected { topic: String, reason: String },

    #[error("Stream terminated: {0:?}")]
    StreamTerminated(Vec<String>),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Realtime connection not established")]
    NotConnected,

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl RealtimeError {
    /// Build a rejection for a set of topics sent in one control call.
    pub(crate) fn rejected(topics: &[Topic], reason: impl Into<String>) -> Self {
        let topic = topics
            .iter()
            .map(Topic::as_str)
            .collect::<Vec<_>>()
            .join(",");
        RealtimeError::SubscriptionRejected {
            topic,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(e: serde_json::Error) -> Self {
        RealtimeError::Serialization(e.to_string())
    }
}

/// Result type for realtime operations.
pub type Result<T> = std::result::Result<T, RealtimeError>;
