//! # SceneLink
//!
//! Server-authoritative scene collaboration over JSON text transports.
//!
//! Multiple clients subscribe to a shared 3D scene, submit versioned
//! operation batches, and observe each other through presence rosters,
//! camera streams, and chat. The server is the single source of truth: every
//! mutation passes an optimistic version gate, is persisted, and is then
//! broadcast to all subscribers as a coalesced delta.
//!
//! ## Features
//!
//! - **Transport-agnostic** — implement the [`Transport`] trait for any
//!   bidirectional text channel
//! - **WebSocket built-in** — the default `transport-websocket` feature
//!   provides `WebSocketTransport` for both sides
//! - **Version-gated mutations** — stale submissions are rejected with
//!   structured `VERSION_CONFLICT` errors carrying the versions involved
//! - **Event-driven client** — drive a session by matching on typed
//!   [`SceneLinkEvent`]s from a channel
//! - **Embeddable server** — [`server::SceneHub`] plus [`server::serve`]
//!   turn any accepted transport into a collaboration session
//!
//! ## Quick Start (client)
//!
//! ```text
//! let transport = WebSocketTransport::connect(&url).await?;
//! let (client, mut events) = SceneClient::start(transport, SceneClientConfig::new(scene_id));
//! while let Some(event) = events.recv().await { /* match on event */ }
//! ```

pub mod client;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod protocol;
pub mod reconnect;
pub mod scene;
pub mod server;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use client::{SceneClient, SceneClientConfig};
pub use error::SceneLinkError;
pub use error_codes::ErrorCode;
pub use event::SceneLinkEvent;
pub use protocol::{ClientMessage, Operation, OperationBatch, SceneState, ServerMessage};
pub use reconnect::{ReconnectPolicy, ReconnectSupervisor};
pub use transport::Transport;

#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketTransport;
