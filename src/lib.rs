//! # Realtime Engine
//!
//! A client-side engine that multiplexes many topic subscriptions over one
//! server-push streaming connection.
//!
//! ## Core Concepts
//!
//! - **Connection**: One long-lived event stream, opened lazily on the first
//!   subscribe and closed when the last subscriber goes
//! - **Topics**: `resource/selector` filters, where `resource/*` (or a bare
//!   `resource`) matches every record of the resource
//! - **Registry**: Reference-counted topic registrations kept in step with
//!   the server
//! - **Subscribers**: Push callbacks or pull iterators, each receiving its
//!   own copy of every matching event
//!
//! ## Example
//!
//! ```ignore
//! use realtime_engine::{EngineConfig, HttpTransportConfig, RealtimeEngine};
//!
//! let engine = RealtimeEngine::http(HttpTransportConfig::from_env(), EngineConfig::default())?;
//!
//! engine.on_disconnect(|termination| {
//!     eprintln!("realtime connection ended: {:?}", termination.reasons);
//! });
//!
//! for event in engine.subscribe("posts/*")? {
//!     println!("{} {}/{}", event.action, event.resource, event.selector);
//! }
//! ```

pub mod cancel;
mod connection;
pub mod engine;
pub mod error;
pub mod frames;
mod registry;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use cancel::CancellationToken;
pub use engine::{EngineConfig, RealtimeEngine};
pub use error::{RealtimeError, Result};
pub use frames::{classify, FrameDecoder, FrameKind, FrameParser, RawFrame};
pub use subscriptions::{EventSink, PullHandle, PushHandle};
pub use transport::{ControlRequest, HttpTransport, HttpTransportConfig, RealtimeTransport};
pub use types::{
    Action, ConnectionIdentity, ConnectionState, DomainEvent, ListenerId, SubscriberId,
    Termination, TerminationCause, Topic, WILDCARD,
};
