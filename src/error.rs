//! Error types for the scenelink client and server core.

use thiserror::Error;

use crate::error_codes::ErrorCode;

/// Errors that can occur when using the scenelink client or server core.
#[derive(Debug, Error)]
pub enum SceneLinkError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attempted an operation that requires an active connection, but the
    /// client is not connected. Outbound messages are never queued.
    #[error("not connected to server")]
    NotConnected,

    /// The server rejected the subscribe credential. The connection manager
    /// must not schedule an automatic reconnect for this error.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The server reported a structured error for a submitted message.
    #[error("server error [{code:?}]: {message}")]
    ServerError {
        /// Structured error code.
        code: ErrorCode,
        /// Human-readable error message from the server.
        message: String,
    },

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for scenelink operations.
pub type Result<T> = std::result::Result<T, SceneLinkError>;
