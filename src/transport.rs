//! Transport abstraction for the scene collaboration channel.
//!
//! The [`Transport`] trait defines a bidirectional text message channel
//! between a client and the collaboration server. The protocol uses JSON
//! text messages, so every transport implementation must handle message
//! framing internally (e.g., WebSocket frames, length-prefixed TCP).
//!
//! # Connection Setup
//!
//! Connection setup is intentionally NOT part of this trait — different
//! transports have fundamentally different connection parameters (URLs for
//! WebSocket, host:port for TCP, etc.). Construct a connected transport
//! externally, then pass it to `SceneClient::start` or `server::serve`.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use scenelink::error::SceneLinkError;
//! use scenelink::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), SceneLinkError> {
//!         // Send the JSON text message over your transport
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, SceneLinkError>> {
//!         // Receive the next JSON text message
//!         // Return None when the connection is closed cleanly
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), SceneLinkError> {
//!         // Gracefully shut down the connection
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::SceneLinkError;

/// A bidirectional text message transport for the scene collaboration
/// protocol.
///
/// Implementors shuttle serialized JSON strings between the two ends of a
/// channel. Each call to [`send`](Transport::send) transmits one complete
/// JSON message. Each call to [`recv`](Transport::recv) returns one complete
/// JSON message.
///
/// # Object Safety
///
/// This trait is object-safe, so `Box<dyn Transport>` works for dynamic
/// dispatch — the reconnect supervisor relies on this to hand out fresh
/// transports across attempts.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is
/// used inside `tokio::select!`. If `recv` is cancelled before completion,
/// calling it again must not lose data. Channel-based implementations (e.g.,
/// wrapping `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text message to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`SceneLinkError::TransportSend`] if the message could not be
    /// sent (e.g., connection broken, write buffer full).
    async fn send(&mut self, message: String) -> Result<(), SceneLinkError>;

    /// Receive the next JSON text message from the peer.
    ///
    /// Returns:
    /// - `Some(Ok(text))` — a complete message was received
    /// - `Some(Err(e))` — a transport error occurred
    /// - `None` — the connection was closed cleanly by the peer
    ///
    /// # Cancel Safety
    ///
    /// This method **MUST** be cancel-safe (see [trait documentation](Transport)).
    async fn recv(&mut self) -> Option<Result<String, SceneLinkError>>;

    /// Close the transport connection gracefully.
    ///
    /// After calling this method, subsequent calls to [`send`](Transport::send)
    /// and [`recv`](Transport::recv) may return errors or `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), SceneLinkError>;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn send(&mut self, message: String) -> Result<(), SceneLinkError> {
        (**self).send(message).await
    }

    async fn recv(&mut self) -> Option<Result<String, SceneLinkError>> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<(), SceneLinkError> {
        (**self).close().await
    }
}
