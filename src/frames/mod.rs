//! Server-push wire framing.
//!
//! The realtime endpoint speaks a line-oriented event stream:
//! - `id: <value>` - optional frame identifier
//! - `event: <type>` - frame type tag
//! - `data: <payload>` - payload line, may repeat
//! - blank line - terminates the frame
//!
//! [`FrameDecoder`] turns the byte stream into [`RawFrame`]s and
//! [`classify`] sorts those into control frames and record events.

mod classify;
mod decoder;

pub use classify::{classify, FrameKind, CONNECT_TAGS, DISCONNECT_TAGS};
pub use decoder::{FrameDecoder, FrameParser, RawFrame};
