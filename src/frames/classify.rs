//! Sorting raw frames into control frames and record events.

use super::decoder::RawFrame;
use crate::types::{Action, ConnectionIdentity, DomainEvent, Topic};
use serde::Deserialize;
use serde_json::Value;

/// Event tags that complete the handshake.
pub const CONNECT_TAGS: &[&str] = &["connect", "PB_CONNECT"];

/// Event tags that announce server-side termination.
pub const DISCONNECT_TAGS: &[&str] = &["disconnect", "PB_DISCONNECT"];

/// What a raw frame turned out to be.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameKind {
    Connect(ConnectionIdentity),
    Disconnect(Vec<String>),
    /// Record event announced by action; goes to every matching topic.
    Record(DomainEvent),
    /// Record event the server addressed to one subscribed topic. It is
    /// sent once per topic, so it goes only to that topic's subscribers.
    TopicRecord { topic: Topic, event: DomainEvent },
    /// Malformed or unrecognised; carries the reason for logging.
    Skipped(String),
}

#[derive(Deserialize)]
struct ConnectPayload {
    #[serde(rename = "connectionIdentity", alias = "clientId")]
    connection_identity: String,
}

#[derive(Deserialize)]
struct RecordPayload {
    #[serde(default)]
    action: Option<String>,
    #[serde(default, alias = "collection")]
    resource: Option<String>,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    record: Option<Value>,
}

/// Classify a frame by its `event:` tag.
///
/// `create`, `update` and `delete` tags name the action directly. Any other
/// non-control tag is treated as a record event only when its payload
/// carries an `action` field, which covers servers that name events after
/// the topic. When such a tag is itself a valid topic on the event's
/// resource, the result is a [`FrameKind::TopicRecord`].
pub fn classify(frame: &RawFrame) -> FrameKind {
    let tag = frame.event.as_str();

    if CONNECT_TAGS.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
        return match serde_json::from_str::<ConnectPayload>(&frame.payload) {
            Ok(p) if !p.connection_identity.is_empty() => {
                FrameKind::Connect(ConnectionIdentity(p.connection_identity))
            }
            Ok(_) => FrameKind::Skipped("connect frame with empty identity".to_string()),
            Err(e) => FrameKind::Skipped(format!("malformed connect payload: {}", e)),
        };
    }

    if DISCONNECT_TAGS.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
        return FrameKind::Disconnect(disconnect_reasons(&frame.payload));
    }

    record_event(frame)
}

fn disconnect_reasons(payload: &str) -> Vec<String> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Vec::new();
    }
    serde_json::from_str::<Vec<String>>(payload).unwrap_or_else(|_| vec![payload.to_string()])
}

fn record_event(frame: &RawFrame) -> FrameKind {
    let tag = frame.event.as_str();
    let value: Value = match serde_json::from_str(&frame.payload) {
        Ok(value) => value,
        Err(e) => return FrameKind::Skipped(format!("malformed `{}` payload: {}", tag, e)),
    };
    let fields = match RecordPayload::deserialize(&value) {
        Ok(fields) => fields,
        Err(e) => return FrameKind::Skipped(format!("unexpected `{}` payload: {}", tag, e)),
    };

    let tagged = Action::parse(tag);
    let action = match (tagged, fields.action.as_deref()) {
        (Some(action), _) => action,
        (None, Some(name)) => match Action::parse(name) {
            Some(action) => action,
            None => return FrameKind::Skipped(format!("unknown action `{}`", name)),
        },
        (None, None) => return FrameKind::Skipped(format!("unrecognised event `{}`", tag)),
    };

    let record_field = |name: &str| {
        fields
            .record
            .as_ref()
            .and_then(|r| r.get(name))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let resource = fields
        .resource
        .clone()
        .or_else(|| record_field("collectionName"))
        .or_else(|| {
            if tagged.is_some() {
                return None;
            }
            tag.split_once('/').map(|(resource, _)| resource.to_string())
        });
    let selector = fields.selector.clone().or_else(|| record_field("id"));

    let (resource, selector) = match (resource, selector) {
        (Some(resource), Some(selector)) => (resource, selector),
        _ => {
            return FrameKind::Skipped(format!("`{}` event without resource or selector", tag))
        }
    };

    let payload = match fields.record {
        Some(record) => record,
        None => value,
    };

    let event = DomainEvent {
        id: frame.id.clone(),
        action,
        resource,
        selector,
        payload,
    };

    match tagged {
        Some(_) => FrameKind::Record(event),
        None => match Topic::new(tag) {
            Ok(topic) if topic.resource() == event.resource => {
                FrameKind::TopicRecord { topic, event }
            }
            _ => FrameKind::Record(event),
        },
    }
}
