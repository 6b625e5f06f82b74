//! Error codes for structured error handling in the scene collaboration protocol.
//!
//! These codes appear in `SCENE_ERROR` messages and serialize using
//! `SCREAMING_SNAKE_CASE` to match the wire format.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error codes returned by the collaboration server.
///
/// Each variant corresponds to a specific error condition. The server sends
/// these as `"SCREAMING_SNAKE_CASE"` strings (e.g., `"VERSION_CONFLICT"`).
///
/// Use [`description()`](ErrorCode::description) for a human-readable explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Subscribe-time errors
    AuthFailed,
    SceneNotFound,

    // Submission errors
    VersionConflict,
    ItemNotFound,
    InvalidOperation,
    PersistenceFailure,

    // Transport / server errors
    ConnectionError,
    InternalError,
}

impl ErrorCode {
    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::AuthFailed => {
                "The credential presented at subscribe time is invalid or expired. \
                 Obtain a fresh credential and reconnect."
            }
            Self::SceneNotFound => {
                "The requested scene does not exist. It may have been deleted or the id is wrong."
            }
            Self::VersionConflict => {
                "The submission was based on a stale scene version. Re-fetch the canonical \
                 state and version, then resubmit."
            }
            Self::ItemNotFound => {
                "An update targeted an item id that does not exist in the scene. \
                 The whole batch was rejected."
            }
            Self::InvalidOperation => {
                "The operation payload is malformed or references data the scene cannot accept."
            }
            Self::PersistenceFailure => {
                "A transient storage error occurred while saving the scene. The batch was not \
                 applied; it is safe to retry the identical submission."
            }
            Self::ConnectionError => {
                "A transport-level failure interrupted the channel. The client should reconnect."
            }
            Self::InternalError => {
                "An internal server error occurred. Please try again or contact support if the \
                 issue persists."
            }
        }
    }

    /// Whether a client may safely retry the exact same submission.
    ///
    /// `VERSION_CONFLICT` is deliberately *not* retriable as-is — the client
    /// must resync to the canonical version first.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::PersistenceFailure | Self::ConnectionError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
