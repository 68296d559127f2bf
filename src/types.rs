//! Core types for the realtime engine.

use crate::error::{RealtimeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Selector that matches every record of a resource.
pub const WILDCARD: &str = "*";

/// A subscription topic: `resource` or `resource/selector`.
///
/// Two topics are distinct registrations even when one is a wildcard
/// superset of the other. A bare `resource` matches like `resource/*`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Parse and validate a topic string.
    pub fn new(topic: impl Into<String>) -> Result<Self> {
        let topic = topic.into();
        if topic.trim() != topic || topic.is_empty() {
            return Err(RealtimeError::InvalidTopic(topic));
        }
        match topic.split_once('/') {
            Some((resource, selector)) if resource.is_empty() || selector.is_empty() => {
                Err(RealtimeError::InvalidTopic(topic))
            }
            _ => Ok(Topic(topic)),
        }
    }

    /// Topic covering every record of a resource (`resource/*`).
    pub fn wildcard(resource: &str) -> Result<Self> {
        Self::new(format!("{}/{}", resource, WILDCARD))
    }

    /// Topic covering a single record (`resource/id`).
    pub fn record(resource: &str, id: &str) -> Result<Self> {
        Self::new(format!("{}/{}", resource, id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The resource part of the topic.
    pub fn resource(&self) -> &str {
        match self.0.split_once('/') {
            Some((resource, _)) => resource,
            None => &self.0,
        }
    }

    /// The selector part, without any trailing `?query` options.
    pub fn selector(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, selector)| {
            selector
                .split_once('?')
                .map_or(selector, |(selector, _)| selector)
        })
    }

    /// True when this topic receives every record event for its resource.
    pub fn is_wildcard(&self) -> bool {
        matches!(self.selector(), None | Some(WILDCARD))
    }

    /// Check whether an event should be delivered to this topic.
    pub fn matches(&self, event: &DomainEvent) -> bool {
        if self.resource() != event.resource {
            return false;
        }
        match self.selector() {
            None | Some(WILDCARD) => true,
            Some(selector) => selector == event.selector,
        }
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for Topic {
    type Error = RealtimeError;

    fn try_from(value: &str) -> Result<Self> {
        Topic::new(value)
    }
}

/// Kind of record change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    /// Parse an action tag, ignoring ASCII case.
    pub fn parse(tag: &str) -> Option<Self> {
        if tag.eq_ignore_ascii_case("create") {
            Some(Action::Create)
        } else if tag.eq_ignore_ascii_case("update") {
            Some(Action::Update)
        } else if tag.eq_ignore_ascii_case("delete") {
            Some(Action::Delete)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record change delivered to subscribers. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Frame identifier from the `id:` line, if the server sent one.
    pub id: Option<String>,
    pub action: Action,
    pub resource: String,
    pub selector: String,
    /// Record data (opaque to the engine).
    pub payload: serde_json::Value,
}

/// Identity assigned by the server on handshake completion.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionIdentity(pub String);

impl ConnectionIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionIdentity({})", self.0)
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a single streaming connection.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Ended by the server or by a transport failure, with ordered reasons.
    Terminated(Vec<String>),
}

impl ConnectionState {
    /// Connecting or connected; a new subscribe reuses such a connection.
    pub fn is_alive(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Why a connection stopped delivering events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationCause {
    /// The server sent a disconnect frame.
    ServerDisconnect,
    /// The stream failed or closed before a disconnect frame.
    TransportFailure,
    /// The engine was shut down locally.
    LocalShutdown,
}

/// Termination notice handed to subscribers and disconnect listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Termination {
    pub cause: TerminationCause,
    pub reasons: Vec<String>,
}

impl Termination {
    pub fn server(reasons: Vec<String>) -> Self {
        Self {
            cause: TerminationCause::ServerDisconnect,
            reasons,
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self {
            cause: TerminationCause::TransportFailure,
            reasons: vec![reason.into()],
        }
    }

    pub fn local() -> Self {
        Self {
            cause: TerminationCause::LocalShutdown,
            reasons: Vec::new(),
        }
    }
}

/// Unique identifier for a local subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

/// Identifier returned when registering a disconnect listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);
