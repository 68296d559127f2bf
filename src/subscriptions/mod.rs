//! Local subscribers on a shared realtime connection.
//!
//! This module provides the fan-out side of the engine:
//! - the router delivers each record event to every matching subscriber,
//!   each with its own copy
//! - [`PushHandle`] runs a callback per event
//! - [`PullHandle`] is a blocking iterator over a per-subscriber queue
//!
//! # Example
//!
//! ```ignore
//! let engine = RealtimeEngine::http(HttpTransportConfig::from_env(), EngineConfig::default())?;
//!
//! // Callback style
//! let _push = engine.subscribe_with("posts/*", |event: &DomainEvent| {
//!     println!("{} {}", event.action, event.selector);
//! })?;
//!
//! // Iterator style
//! for event in engine.subscribe("posts/p1")? {
//!     println!("{:?}", event.payload);
//! }
//! ```

mod router;
mod types;

pub(crate) use router::{EventRouter, Sink, Subscriber};
pub(crate) use types::Release;
pub use types::{EventSink, PullHandle, PushHandle};
