//! Typed events emitted by the client to its consumer.
//!
//! The transport loop converts every inbound [`ServerMessage`] into a
//! [`SceneLinkEvent`] and pushes it onto the bounded event channel returned by
//! `SceneClient::start`. Consumers drive the session with a single `match`
//! over this discriminated union — there is no string-keyed callback
//! registration anywhere.

use crate::error_codes::ErrorCode;
use crate::protocol::{
    now_ms, CameraPose, ClientId, DeltaPayload, ErrorDetails, PresenceEvent, PresenceRecord,
    SceneId, ServerMessage, ViewportState,
};

/// Events delivered to the consumer of a scene collaboration session.
#[derive(Debug, Clone)]
pub enum SceneLinkEvent {
    /// The transport is up. Always the first event of a session.
    Connected,
    /// Subscribe handshake completed; carries the canonical version to base
    /// the first submission on and the identity the server assigned to this
    /// channel.
    Hello {
        scene_id: SceneId,
        version: u64,
        server_time: u64,
        client_id: ClientId,
    },
    /// Full presence roster, delivered once after `Hello`.
    Roster { users: Vec<PresenceRecord> },
    /// Another client joined the scene.
    UserJoined {
        user: PresenceRecord,
        timestamp: u64,
    },
    /// Another client left the scene.
    UserLeft { id: ClientId, timestamp: u64 },
    /// Operations were applied to the scene. The client's local replica has
    /// already been advanced to `delta.version` when this event is observed.
    SceneDelta(Box<DeltaPayload>),
    /// The server rejected a submission from this client.
    SceneError {
        code: ErrorCode,
        message: String,
        details: Option<ErrorDetails>,
    },
    /// Another subscriber's camera pose (last-write-wins).
    Camera { from: ClientId, pose: CameraPose },
    /// Another subscriber's viewport state.
    ViewportSync {
        from: ClientId,
        viewport: ViewportState,
    },
    /// A chat message. `local_echo` carries the client-generated pending id
    /// when this is the authoritative echo of a message this client sent
    /// optimistically; replace the pending entry instead of appending.
    Chat {
        from: ClientId,
        message: String,
        timestamp: u64,
        local_echo: Option<String>,
    },
    /// Latency sample: the round-trip time measured from a ping echo.
    Pong { latency_ms: u64 },
    /// The transport closed. Always the last event of a session.
    Disconnected { reason: Option<String> },
}

impl From<ServerMessage> for SceneLinkEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Hello {
                scene_id,
                version,
                server_time,
                client_id,
            } => Self::Hello {
                scene_id,
                version,
                server_time,
                client_id,
            },
            ServerMessage::Presence(PresenceEvent::Roster { users }) => Self::Roster { users },
            ServerMessage::Presence(PresenceEvent::UserJoined { user, timestamp }) => {
                Self::UserJoined { user, timestamp }
            }
            ServerMessage::Presence(PresenceEvent::UserLeft { id, timestamp }) => {
                Self::UserLeft { id, timestamp }
            }
            ServerMessage::Camera { from, pose } => Self::Camera { from, pose },
            ServerMessage::ViewportSync { from, viewport } => {
                Self::ViewportSync { from, viewport }
            }
            ServerMessage::Chat {
                from,
                message,
                timestamp,
            } => Self::Chat {
                from,
                message,
                timestamp,
                local_echo: None,
            },
            ServerMessage::SceneDelta(delta) => Self::SceneDelta(delta),
            ServerMessage::SceneError {
                code,
                message,
                details,
            } => Self::SceneError {
                code,
                message,
                details,
            },
            // The pong carries back the client's own send timestamp, so the
            // round trip is measurable without any clock agreement.
            ServerMessage::Pong { ts } => Self::Pong {
                latency_ms: now_ms().saturating_sub(ts),
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn hello_maps_through() {
        let event = SceneLinkEvent::from(ServerMessage::Hello {
            scene_id: Uuid::from_u128(3),
            version: 9,
            server_time: 1000,
            client_id: Uuid::from_u128(7),
        });
        match event {
            SceneLinkEvent::Hello {
                scene_id, version, ..
            } => {
                assert_eq!(scene_id, Uuid::from_u128(3));
                assert_eq!(version, 9);
            }
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn pong_yields_nonnegative_latency() {
        // A pong stamped "now" measures (approximately) zero, never underflows.
        let event = SceneLinkEvent::from(ServerMessage::Pong { ts: now_ms() + 10 });
        match event {
            SceneLinkEvent::Pong { latency_ms } => assert_eq!(latency_ms, 0),
            other => panic!("expected Pong, got {other:?}"),
        }
    }

    #[test]
    fn chat_from_server_has_no_local_echo() {
        let event = SceneLinkEvent::from(ServerMessage::Chat {
            from: Uuid::nil(),
            message: "hi".into(),
            timestamp: 5,
        });
        match event {
            SceneLinkEvent::Chat { local_echo, .. } => assert!(local_echo.is_none()),
            other => panic!("expected Chat, got {other:?}"),
        }
    }
}
