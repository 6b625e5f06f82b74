#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
#![allow(dead_code)]
//! Shared test utilities for SceneLink integration tests.
//!
//! Provides a scripted [`MockTransport`] for client-side tests, a
//! channel-backed [`ChannelTransport`] pair for driving server sessions end
//! to end, and helpers for building hubs, principals, and common server
//! response JSON strings.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use scenelink::protocol::{
    ActorInfo, CameraPose, ClientId, DeltaPayload, ErrorDetails, Operation, SceneId, SceneItem,
    ServerMessage,
};
use scenelink::server::{MemoryStore, Principal, SceneHub, StaticTokenVerifier};
use scenelink::{ErrorCode, SceneLinkError, Transport};

// ── MockTransport ───────────────────────────────────────────────────

/// A scripted mock transport for client integration testing.
///
/// Scripted server responses are consumed in order by `recv()`.
/// All messages sent by the client are recorded in `sent`.
pub struct MockTransport {
    /// Scripted server responses (consumed in order by `recv`).
    incoming: VecDeque<Option<Result<String, SceneLinkError>>>,
    /// Recorded outgoing messages from the client.
    pub sent: Arc<StdMutex<Vec<String>>>,
    /// Whether `close()` has been called.
    pub closed: Arc<AtomicBool>,
}

impl MockTransport {
    /// Create a new mock transport with the given scripted incoming messages.
    ///
    /// Returns the transport plus shared handles for inspecting sent messages
    /// and whether close was called.
    pub fn new(
        incoming: Vec<Option<Result<String, SceneLinkError>>>,
    ) -> (Self, Arc<StdMutex<Vec<String>>>, Arc<AtomicBool>) {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Self {
            incoming: VecDeque::from(incoming),
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        };
        (transport, sent, closed)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), SceneLinkError> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, SceneLinkError>> {
        if let Some(item) = self.incoming.pop_front() {
            item
        } else {
            // No more scripted messages — hang forever so the transport loop
            // stays alive until shutdown is called.
            std::future::pending().await
        }
    }

    async fn close(&mut self) -> Result<(), SceneLinkError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ── ChannelTransport ────────────────────────────────────────────────

/// One end of an in-memory duplex text channel implementing [`Transport`].
///
/// [`channel_pair`] returns the server-side transport together with the
/// client-side handles, so a test can play the remote peer of a
/// `scenelink::server::serve` session without any sockets.
pub struct ChannelTransport {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
    closed: bool,
}

/// The test's side of a [`ChannelTransport`] pair.
pub struct ChannelPeer {
    /// Send a raw JSON message to the transport under test.
    pub to_transport: mpsc::UnboundedSender<String>,
    /// Receive raw JSON messages written by the transport under test.
    pub from_transport: mpsc::UnboundedReceiver<String>,
}

impl ChannelPeer {
    /// Send a `ClientMessage` to the session under test.
    pub fn send_msg(&self, msg: &scenelink::ClientMessage) {
        let json = serde_json::to_string(msg).expect("client message serialization");
        self.to_transport.send(json).expect("session closed");
    }

    /// Receive and parse the next `ServerMessage`, with a timeout.
    pub async fn recv_msg(&mut self) -> ServerMessage {
        let json = tokio::time::timeout(Duration::from_secs(2), self.from_transport.recv())
            .await
            .expect("timed out waiting for server message")
            .expect("session closed without message");
        serde_json::from_str(&json).expect("server message parse")
    }

    /// Hang up: the session observes a clean transport close.
    pub fn disconnect(self) {
        drop(self.to_transport);
    }
}

/// Build a connected `(transport, peer)` pair.
pub fn channel_pair() -> (ChannelTransport, ChannelPeer) {
    let (to_transport, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_transport) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            incoming,
            outgoing,
            closed: false,
        },
        ChannelPeer {
            to_transport,
            from_transport,
        },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, message: String) -> Result<(), SceneLinkError> {
        self.outgoing
            .send(message)
            .map_err(|_| SceneLinkError::TransportSend("peer hung up".into()))
    }

    async fn recv(&mut self) -> Option<Result<String, SceneLinkError>> {
        if self.closed {
            return None;
        }
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), SceneLinkError> {
        self.closed = true;
        Ok(())
    }
}

// ── Server fixtures ─────────────────────────────────────────────────

pub fn scene_id() -> SceneId {
    uuid::Uuid::from_u128(0x5ce)
}

pub fn client_id(n: u128) -> ClientId {
    uuid::Uuid::from_u128(n)
}

pub fn principal(n: u128, name: &str) -> Principal {
    Principal {
        client_id: client_id(n),
        name: name.into(),
        role: "editor".into(),
    }
}

/// A hub over a fresh in-memory store.
pub fn test_hub() -> (Arc<SceneHub>, Arc<MemoryStore>) {
    let store = MemoryStore::new();
    let hub = SceneHub::new(store.clone());
    (hub, store)
}

/// A verifier with tokens `"token-1"` and `"token-2"` mapped to principals
/// 1 ("Ada") and 2 ("Grace").
pub fn test_verifier() -> StaticTokenVerifier {
    StaticTokenVerifier::new()
        .with_token("token-1", principal(1, "Ada"))
        .with_token("token-2", principal(2, "Grace"))
}

/// Receive the next broadcast from a hub subscription, with a timeout.
pub async fn next_broadcast(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for broadcast")
        .expect("subscription closed")
}

/// Assert that no broadcast arrives within the given window.
pub async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<ServerMessage>, window: Duration) {
    if let Ok(Some(msg)) = tokio::time::timeout(window, rx.recv()).await {
        panic!("expected silence, got {msg:?}");
    }
}

// ── JSON helper functions ───────────────────────────────────────────

/// Returns the JSON string for a `HELLO` server message.
pub fn hello_json(version: u64, own_id: ClientId) -> String {
    serde_json::to_string(&ServerMessage::Hello {
        scene_id: scene_id(),
        version,
        server_time: 1_700_000_000_000,
        client_id: own_id,
    })
    .expect("hello_json serialization")
}

/// Returns the JSON string for a `SCENE_DELTA` server message.
pub fn delta_json(version: u64, operations: Vec<Operation>) -> String {
    serde_json::to_string(&ServerMessage::SceneDelta(Box::new(DeltaPayload {
        scene_id: scene_id(),
        operations,
        version,
        actor: ActorInfo {
            id: client_id(99),
            role: "editor".into(),
        },
        timestamp: 1_700_000_000_500,
        request_id: "req-x".into(),
    })))
    .expect("delta_json serialization")
}

/// Returns the JSON string for a `SCENE_ERROR` server message.
pub fn error_json(code: ErrorCode, message: &str, details: Option<ErrorDetails>) -> String {
    serde_json::to_string(&ServerMessage::SceneError {
        code,
        message: message.into(),
        details,
    })
    .expect("error_json serialization")
}

/// A version-conflict `SCENE_ERROR` carrying the expected/received pair.
pub fn conflict_json(expected: u64, received: u64, request_id: &str) -> String {
    error_json(
        ErrorCode::VersionConflict,
        "scene was modified by another client",
        Some(ErrorDetails {
            expected_version: Some(expected),
            received_version: Some(received),
            request_id: Some(request_id.into()),
            ..Default::default()
        }),
    )
}

/// An upsert operation placing an item with the given id and category.
pub fn upsert(id: &str, category: &str) -> Operation {
    Operation::UpsertItem {
        item: SceneItem::new(id, category),
    }
}

/// A throwaway camera pose.
pub fn pose(x: f32) -> CameraPose {
    CameraPose {
        position: [x, 0.0, 0.0],
        rotation_quaternion: [0.0, 0.0, 0.0, 1.0],
    }
}
