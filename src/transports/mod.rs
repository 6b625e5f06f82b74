//! Built-in [`Transport`](crate::transport::Transport) implementations.
//!
//! Currently provides:
//!
//! - [`WebSocketTransport`] — WebSocket transport via `tokio-tungstenite`,
//!   available with the default `transport-websocket` feature.

#[cfg(feature = "transport-websocket")]
mod websocket;

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketTransport, WsStream};
