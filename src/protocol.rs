//! Wire types for the scene collaboration protocol.
//!
//! Every type in this module produces the exact JSON the collaboration server
//! speaks on its channel: envelope variants are tagged `{"type": ..., "data": ...}`
//! with `SCREAMING_SNAKE_CASE` type names, payload fields are `camelCase`, and
//! scene operations are tagged by an `"op"` discriminator in `snake_case`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error_codes::ErrorCode;

// ── Type aliases ────────────────────────────────────────────────────

/// Unique identifier for connected clients.
pub type ClientId = Uuid;

/// Unique identifier for scenes.
pub type SceneId = Uuid;

/// Identifier for a placed scene item. Client- or server-assigned, stable
/// across edits, unique within a scene.
pub type ItemId = String;

/// Milliseconds since the Unix epoch.
///
/// All protocol timestamps (ping, chat, deltas, presence) use this form.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Scene data model ────────────────────────────────────────────────

/// Placement of an item: position, Euler rotation in degrees, scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: [f32; 3],
    /// Euler angles in degrees, XYZ order.
    pub rotation: [f32; 3],
    pub scale: [f32; 3],
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            rotation: [0.0; 3],
            scale: [1.0; 3],
        }
    }
}

fn default_true() -> bool {
    true
}

/// A placed 3D object instance within a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneItem {
    pub id: ItemId,
    /// Category / model reference within the owning project.
    pub category: String,
    #[serde(default)]
    pub transform: Transform,
    /// Material variant label, if the category offers variants.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,
    #[serde(default = "default_true")]
    pub selectable: bool,
    #[serde(default)]
    pub locked: bool,
    /// Free-form per-item metadata.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SceneItem {
    /// Create an item with the given id and category, identity transform, and
    /// default flags.
    pub fn new(id: impl Into<ItemId>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            transform: Transform::default(),
            material: None,
            selectable: true,
            locked: false,
            metadata: serde_json::Map::new(),
        }
    }
}

/// Partial update for an existing [`SceneItem`]. Only present fields are
/// merged onto the item; absent fields are untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Replaces the whole transform when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selectable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    /// Merged key-by-key onto the item's metadata map when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Where newly joining users spawn in the scene.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpawnPose {
    pub position: [f32; 3],
    /// Euler angles in degrees.
    pub rotation: [f32; 3],
}

/// Scene-level display properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneProps {
    pub exposure: f32,
    /// Environment map reference, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub environment_intensity: f32,
    #[serde(default)]
    pub spawn: SpawnPose,
}

impl Default for SceneProps {
    fn default() -> Self {
        Self {
            exposure: 1.0,
            environment: None,
            environment_intensity: 1.0,
            spawn: SpawnPose::default(),
        }
    }
}

/// Partial update for [`SceneProps`]. Only present fields are merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenePropsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposure: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_intensity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawn: Option<SpawnPose>,
}

/// The canonical collaborative scene document.
///
/// The version strictly increases by exactly 1 per successfully applied
/// operation batch and never decreases. All subscribers eventually converge
/// to the same `(version, state)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneState {
    pub id: SceneId,
    pub version: u64,
    /// Ordered list of placed items.
    pub items: Vec<SceneItem>,
    #[serde(default)]
    pub props: SceneProps,
    pub updated_at: u64,
}

impl SceneState {
    /// Create an empty scene at version 1.
    pub fn new(id: SceneId) -> Self {
        Self {
            id,
            version: 1,
            items: Vec::new(),
            props: SceneProps::default(),
            updated_at: now_ms(),
        }
    }

    /// Find an item by id.
    pub fn item(&self, id: &str) -> Option<&SceneItem> {
        self.items.iter().find(|item| item.id == id)
    }
}

// ── Operations ──────────────────────────────────────────────────────

/// One atomic scene edit.
///
/// Operations within a submitted batch are applied atomically in array order:
/// either the whole batch is accepted, or none of it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Insert the item, or replace it entirely if the id already exists.
    /// Idempotent by id — never errors on collision.
    UpsertItem { item: SceneItem },
    /// Merge the provided fields onto an existing item. Fails the whole batch
    /// if the id does not exist.
    UpdateItem { id: ItemId, patch: ItemPatch },
    /// Delete the item by id. A no-op (not an error) if the id does not
    /// exist, to tolerate duplicate delivery.
    RemoveItem { id: ItemId },
    /// Merge scene-level property fields.
    SceneProps { patch: ScenePropsPatch },
}

/// A client submission: an ordered operation batch against a believed scene
/// version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationBatch {
    pub scene_id: SceneId,
    pub operations: Vec<Operation>,
    /// The client's last-known scene version.
    pub version: u64,
    /// Opaque client-supplied identifier, echoed back in the delta or error
    /// for correlation.
    pub request_id: String,
    /// Client-side submission timestamp (ms since epoch).
    pub timestamp: u64,
}

/// Identity and role of the client that produced a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorInfo {
    pub id: ClientId,
    pub role: String,
}

/// A broadcast describing operations applied to a scene and the resulting
/// version.
///
/// Every delta's version equals the canonical scene version at broadcast
/// time; all subscribers of a scene observe deltas in the same total order.
/// Boxed in [`ServerMessage`] to reduce enum size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPayload {
    pub scene_id: SceneId,
    /// The operations that were applied, echoed exactly as submitted.
    pub operations: Vec<Operation>,
    /// The new canonical version after applying the batch.
    pub version: u64,
    pub actor: ActorInfo,
    /// Server timestamp (ms since epoch).
    pub timestamp: u64,
    /// The originating request identifier. For a coalesced delta, the
    /// identifier of the last merged submission.
    pub request_id: String,
}

// ── Presence ────────────────────────────────────────────────────────

/// Connection status of a scene subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    #[default]
    Online,
    Editing,
    Viewing,
    Away,
}

/// Live roster entry for one connected client within a scene subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub id: ClientId,
    pub name: String,
    /// Hex color assigned by deterministic palette rotation.
    pub color: String,
    #[serde(default)]
    pub status: PresenceStatus,
    pub last_seen: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera: Option<CameraPose>,
}

/// Presence changes for a scene: either a full roster snapshot (delivered to
/// a joining client) or an incremental join/leave event (delivered to the
/// clients already subscribed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresenceEvent {
    Roster { users: Vec<PresenceRecord> },
    UserJoined { user: PresenceRecord, timestamp: u64 },
    UserLeft { id: ClientId, timestamp: u64 },
}

// ── Camera / viewport ───────────────────────────────────────────────

/// Ephemeral camera pose. Never persisted, never versioned; last-write-wins
/// on the receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraPose {
    pub position: [f32; 3],
    pub rotation_quaternion: [f32; 4],
}

/// Ephemeral viewport state for continuous-broadcast viewing modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportState {
    pub camera: CameraPose,
    /// Width and height in pixels.
    pub viewport_dimensions: [u32; 2],
}

// ── Error details ───────────────────────────────────────────────────

/// Structured detail payload attached to `SCENE_ERROR` messages, carrying
/// enough context for the client to resync automatically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    /// Canonical version at rejection time (set for `VERSION_CONFLICT`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
    /// The version the client submitted (set for `VERSION_CONFLICT`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_version: Option<u64>,
    /// The offending item id (set for `ITEM_NOT_FOUND`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<ItemId>,
    /// Echo of the request identifier the error responds to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

// ── Messages ────────────────────────────────────────────────────────

/// Message types sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Bind this channel to a scene's subscriber set.
    #[serde(rename_all = "camelCase")]
    Subscribe { scene_id: SceneId },
    /// Leave the scene's subscriber set.
    #[serde(rename_all = "camelCase")]
    Unsubscribe { scene_id: SceneId },
    /// Latency probe carrying a client timestamp, answered with `PONG`.
    Ping { ts: u64 },
    /// Ephemeral camera pose for remote cursors. Bypasses the version gate.
    Camera { pose: CameraPose },
    /// Ephemeral chat message, relayed to all subscribers.
    Chat { message: String },
    /// Ephemeral viewport state for continuous-broadcast modes.
    ViewportSync { viewport: ViewportState },
    /// Versioned scene edit submission (boxed to reduce enum size).
    SceneOperation(Box<OperationBatch>),
}

/// Message types sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// Sent once on successful subscribe. `client_id` is the identity the
    /// server bound to this channel; deltas name it as the actor and chat
    /// echoes carry it as `from`.
    #[serde(rename_all = "camelCase")]
    Hello {
        scene_id: SceneId,
        version: u64,
        server_time: u64,
        client_id: ClientId,
    },
    /// Roster snapshot or incremental join/leave.
    Presence(PresenceEvent),
    /// Another subscriber's camera pose.
    Camera { from: ClientId, pose: CameraPose },
    /// Another subscriber's viewport state.
    ViewportSync {
        from: ClientId,
        viewport: ViewportState,
    },
    /// Chat message with server-assigned timestamp. Delivered to all
    /// subscribers including the sender, for ordering consistency with the
    /// sender's optimistic local echo.
    Chat {
        from: ClientId,
        message: String,
        timestamp: u64,
    },
    /// Applied operations and the resulting version (boxed to reduce enum size).
    SceneDelta(Box<DeltaPayload>),
    /// Structured error, delivered only to the originating client.
    SceneError {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<ErrorDetails>,
    },
    /// Echo of a `PING`, carrying the client's original timestamp.
    Pong { ts: u64 },
}
