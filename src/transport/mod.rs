//! Boundary to the HTTP collaborator.
//!
//! The engine needs two things from the server: a long-lived event stream
//! and a control endpoint that adds or removes topics for a connection.
//! [`RealtimeTransport`] captures exactly that; [`HttpTransport`] is the
//! production implementation.

mod http;

pub use http::{HttpTransport, HttpTransportConfig, DEFAULT_BASE_URL, DEFAULT_ENDPOINT};

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::types::{ConnectionIdentity, Topic};
use serde::{Deserialize, Serialize};
use std::io::BufRead;

/// Transport used by a realtime engine.
pub trait RealtimeTransport: Send + Sync {
    /// Open the streaming request. The returned reader yields the raw
    /// event stream until the server or the network closes it, or until
    /// `cancel` fires. After that, a read blocked on the stream must return
    /// promptly with EOF or an error, and the underlying connection must
    /// be released. `cancel` may already have fired when this is called.
    fn open_stream(&self, cancel: &CancellationToken) -> Result<Box<dyn BufRead + Send>>;

    /// Send a topic add/remove request for a connection.
    fn send_control(&self, request: &ControlRequest) -> Result<()>;
}

/// Body of a topic add/remove call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscriptions: Vec<Topic>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsubscribe: Vec<Topic>,
}

impl ControlRequest {
    /// Declare topics added for a connection.
    pub fn add(identity: &ConnectionIdentity, topics: Vec<Topic>) -> Self {
        Self {
            client_id: identity.0.clone(),
            subscriptions: topics,
            unsubscribe: Vec::new(),
        }
    }

    /// Declare topics removed for a connection.
    pub fn remove(identity: &ConnectionIdentity, topics: Vec<Topic>) -> Self {
        Self {
            client_id: identity.0.clone(),
            subscriptions: Vec::new(),
            unsubscribe: topics,
        }
    }

    /// Topics named by the request, whichever direction it goes.
    pub fn topics(&self) -> &[Topic] {
        if self.subscriptions.is_empty() {
            &self.unsubscribe
        } else {
            &self.subscriptions
        }
    }

    pub fn is_removal(&self) -> bool {
        !self.unsubscribe.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_request_wire_format() {
        let identity = ConnectionIdentity("c1".to_string());
        let add = ControlRequest::add(&identity, vec![Topic::new("posts/*").unwrap()]);
        assert_eq!(
            serde_json::to_value(&add).unwrap(),
            json!({"clientId": "c1", "subscriptions": ["posts/*"]})
        );
        assert!(!add.is_removal());

        let remove = ControlRequest::remove(
            &identity,
            vec![Topic::new("posts/*").unwrap(), Topic::new("users/u1").unwrap()],
        );
        assert_eq!(
            serde_json::to_value(&remove).unwrap(),
            json!({"clientId": "c1", "unsubscribe": ["posts/*", "users/u1"]})
        );
        assert!(remove.is_removal());
        assert_eq!(remove.topics().len(), 2);
    }
}
