//! Market Data Stream Adapter
//!
//! WebSocket implementation of the stream transport port:
//!
//! - **codec**: JSON control messages, binary tick frames
//! - **heartbeat**: Liveness tracking for an open socket
//! - **websocket**: Connection tasks and handle bookkeeping

pub mod codec;
pub mod heartbeat;
pub mod websocket;

pub use codec::{BinaryFrame, CodecError, ControlRequest, TextFrame, decode_binary, decode_text};
pub use heartbeat::{Heartbeat, HeartbeatConfig};
pub use websocket::WebSocketTransport;
