//! Scene rooms: subscription fan-out, the version gate, and delta broadcast.
//!
//! [`SceneHub`] owns one [`Room`] per active scene. Each room holds the
//! canonical [`SceneState`], the presence roster, the subscriber senders, and
//! a [`DeltaCoalescer`]. All mutation of a room goes through its
//! `tokio::Mutex`, which serializes concurrent submissions per scene — the
//! version gate and the apply/persist/broadcast sequence are atomic with
//! respect to other submitters.
//!
//! Ordering rules the hub enforces:
//! - A batch is persisted before any subscriber hears about it.
//! - Deltas for a scene reach every subscriber, including the submitter, in
//!   one total order.
//! - Errors go only to the submitter.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error_codes::ErrorCode;
use crate::protocol::{
    now_ms, ActorInfo, CameraPose, ClientId, DeltaPayload, ErrorDetails, OperationBatch,
    PresenceStatus, SceneId, SceneState, ServerMessage, ViewportState,
};
use crate::scene::{apply_batch, ApplyError};
use crate::server::auth::Principal;
use crate::server::coalesce::{DeltaCoalescer, COALESCE_WINDOW};
use crate::server::presence::PresenceRoster;
use crate::server::store::{SceneStore, StoreError};

/// Errors surfaced to the session layer (not to remote clients).
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("client {client_id} is not subscribed to scene {scene_id}")]
    NotSubscribed {
        scene_id: SceneId,
        client_id: ClientId,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One active scene: canonical state plus everything needed to serve it.
struct Room {
    scene: SceneState,
    presence: PresenceRoster,
    subscribers: HashMap<ClientId, mpsc::UnboundedSender<ServerMessage>>,
    /// Role labels for delta attribution, captured at subscribe time.
    roles: HashMap<ClientId, String>,
    coalescer: DeltaCoalescer,
    /// Whether a flush task is already scheduled for the current window.
    flush_armed: bool,
    /// Set when the room is removed from the hub map. A subscriber holding a
    /// stale `Arc` must retry against a fresh room instead of registering
    /// here, where no broadcast would ever reach it.
    closed: bool,
}

impl Room {
    fn new(scene: SceneState) -> Self {
        Self {
            scene,
            presence: PresenceRoster::new(),
            subscribers: HashMap::new(),
            roles: HashMap::new(),
            coalescer: DeltaCoalescer::new(),
            flush_armed: false,
            closed: false,
        }
    }

    /// Deliver a message to every subscriber. A closed receiver just means
    /// that session is tearing down; its unsubscribe will clean up.
    fn broadcast(&self, msg: &ServerMessage) {
        for (client_id, tx) in &self.subscribers {
            if tx.send(msg.clone()).is_err() {
                debug!(%client_id, "subscriber channel closed during broadcast");
            }
        }
    }

    /// Deliver a message to every subscriber except `skip`.
    fn broadcast_except(&self, skip: ClientId, msg: &ServerMessage) {
        for (client_id, tx) in &self.subscribers {
            if *client_id == skip {
                continue;
            }
            if tx.send(msg.clone()).is_err() {
                debug!(%client_id, "subscriber channel closed during broadcast");
            }
        }
    }

    /// Deliver a message to one subscriber.
    fn send_to(&self, client_id: ClientId, msg: ServerMessage) {
        if let Some(tx) = self.subscribers.get(&client_id) {
            if tx.send(msg).is_err() {
                debug!(%client_id, "subscriber channel closed");
            }
        }
    }
}

/// Server-side registry of active scene rooms.
///
/// Cheap to clone behind an `Arc`; all methods take `&self`.
pub struct SceneHub {
    store: Arc<dyn SceneStore>,
    rooms: Mutex<HashMap<SceneId, Arc<Mutex<Room>>>>,
}

impl SceneHub {
    pub fn new(store: Arc<dyn SceneStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            rooms: Mutex::new(HashMap::new()),
        })
    }

    /// Add a client to a scene's subscriber set.
    ///
    /// Loads the scene (creating the room if this is the first subscriber)
    /// and returns the receiver the session reads broadcasts from. The
    /// receiver is primed in handshake order: `HELLO` first, then the
    /// presence roster. Clients already in the room receive a `USER_JOINED`
    /// instead — never the joiner.
    ///
    /// # Errors
    ///
    /// Propagates [`StoreError`] when the scene cannot be loaded.
    pub async fn subscribe(
        &self,
        scene_id: SceneId,
        principal: &Principal,
    ) -> Result<mpsc::UnboundedReceiver<ServerMessage>, HubError> {
        loop {
            let room = self.room_or_load(scene_id).await?;
            let mut room = room.lock().await;
            if room.closed {
                // The last subscriber left between lookup and lock; the next
                // lookup creates a fresh room from the store.
                continue;
            }

            // Deltas committed before this join belong to the old subscriber
            // set; flush the open window now so the newcomer's HELLO version
            // is never trailed by an already-counted delta.
            if let Some(delta) = room.coalescer.flush() {
                room.broadcast(&ServerMessage::SceneDelta(Box::new(delta)));
            }

            let (tx, rx) = mpsc::unbounded_channel();

            // Hello carries the canonical version the client bases its first
            // submission on, so it must precede everything else on the channel.
            let hello = ServerMessage::Hello {
                scene_id,
                version: room.scene.version,
                server_time: now_ms(),
                client_id: principal.client_id,
            };
            let _ = tx.send(hello);

            let joined = room.presence.join(principal.client_id, principal.name.clone());
            room.subscribers.insert(principal.client_id, tx);
            room.roles
                .insert(principal.client_id, principal.role.clone());

            // The joiner gets the full roster; everyone else gets the increment.
            room.send_to(
                principal.client_id,
                ServerMessage::Presence(room.presence.roster()),
            );
            room.broadcast_except(principal.client_id, &ServerMessage::Presence(joined));

            debug!(%scene_id, client_id = %principal.client_id, subscribers = room.subscribers.len(), "subscribed");
            return Ok(rx);
        }
    }

    /// Remove a client from a scene's subscriber set and announce the leave.
    ///
    /// Idempotent: unsubscribing an unknown client or scene is a no-op, so
    /// session teardown can always call it unconditionally.
    pub async fn unsubscribe(&self, scene_id: SceneId, client_id: ClientId) {
        // Map lock first, then room lock — the same order as subscribe. The
        // emptiness check and the map removal happen under both locks, so a
        // concurrent subscriber either lands before the check (room stays) or
        // observes `closed` and retries against a fresh room.
        let mut rooms = self.rooms.lock().await;
        let Some(room_arc) = rooms.get(&scene_id).cloned() else {
            return;
        };
        let mut room = room_arc.lock().await;
        room.subscribers.remove(&client_id);
        room.roles.remove(&client_id);
        if let Some(left) = room.presence.leave(client_id) {
            room.broadcast(&ServerMessage::Presence(left));
        }
        if room.subscribers.is_empty() {
            // Last one out: drop the room; the next subscriber reloads from
            // the store.
            room.closed = true;
            rooms.remove(&scene_id);
            debug!(%scene_id, "room closed");
        }
    }

    /// Run a submitted batch through the version gate, apply and persist it,
    /// and queue the delta for coalesced broadcast.
    ///
    /// Rejections (`VERSION_CONFLICT`, `ITEM_NOT_FOUND`, `PERSISTENCE_FAILURE`)
    /// go to the submitter only and leave the scene untouched. An empty batch
    /// is accepted as a no-op without bumping the version.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::NotSubscribed`] if the submitter is not in the
    /// room. Client-visible rejections are *not* errors at this level.
    pub async fn submit(
        self: &Arc<Self>,
        client_id: ClientId,
        batch: OperationBatch,
    ) -> Result<(), HubError> {
        let scene_id = batch.scene_id;
        let room_arc = self.room(scene_id).await.ok_or(HubError::NotSubscribed {
            scene_id,
            client_id,
        })?;
        let mut room = room_arc.lock().await;
        if !room.subscribers.contains_key(&client_id) {
            return Err(HubError::NotSubscribed {
                scene_id,
                client_id,
            });
        }

        // Version gate: a batch against any version other than the current
        // canonical one is stale (or from the future) and never applied.
        if batch.version != room.scene.version {
            debug!(
                %scene_id, %client_id,
                expected = room.scene.version, received = batch.version,
                "rejecting stale submission"
            );
            room.send_to(
                client_id,
                ServerMessage::SceneError {
                    code: ErrorCode::VersionConflict,
                    message: "scene was modified by another client".into(),
                    details: Some(ErrorDetails {
                        expected_version: Some(room.scene.version),
                        received_version: Some(batch.version),
                        request_id: Some(batch.request_id),
                        ..Default::default()
                    }),
                },
            );
            return Ok(());
        }

        // Stage the batch on a copy so a mid-batch failure leaves the
        // canonical state untouched.
        let server_time = now_ms();
        let mut staged = room.scene.clone();
        let bumped = match apply_batch(&mut staged, &batch.operations, server_time) {
            Ok(bumped) => bumped,
            Err(ApplyError::ItemNotFound { id }) => {
                room.send_to(
                    client_id,
                    ServerMessage::SceneError {
                        code: ErrorCode::ItemNotFound,
                        message: format!("item '{id}' does not exist"),
                        details: Some(ErrorDetails {
                            item_id: Some(id),
                            request_id: Some(batch.request_id),
                            ..Default::default()
                        }),
                    },
                );
                return Ok(());
            }
        };

        if !bumped {
            // Empty batch: accepted, nothing to persist or announce.
            return Ok(());
        }

        // Persist before broadcast. On failure the canonical state and
        // version stay as they were; the client may retry the same version.
        if let Err(e) = self.store.save(&staged, room.scene.version).await {
            warn!(%scene_id, "persist failed: {e}");
            room.send_to(
                client_id,
                ServerMessage::SceneError {
                    code: ErrorCode::PersistenceFailure,
                    message: "failed to persist scene update".into(),
                    details: Some(ErrorDetails {
                        request_id: Some(batch.request_id),
                        ..Default::default()
                    }),
                },
            );
            return Ok(());
        }

        room.scene = staged;

        let version = room.scene.version;
        let role = room
            .roles
            .get(&client_id)
            .cloned()
            .unwrap_or_else(|| "editor".to_owned());
        room.coalescer.push(DeltaPayload {
            scene_id,
            operations: batch.operations,
            version,
            actor: ActorInfo {
                id: client_id,
                role,
            },
            timestamp: server_time,
            request_id: batch.request_id,
        });
        room.presence.set_status(client_id, PresenceStatus::Editing);

        // One flush task per window. Further batches landing before it fires
        // merge into the same broadcast.
        if !room.flush_armed {
            room.flush_armed = true;
            let room_arc = Arc::clone(&room_arc);
            tokio::spawn(async move {
                tokio::time::sleep(COALESCE_WINDOW).await;
                let mut room = room_arc.lock().await;
                room.flush_armed = false;
                if let Some(delta) = room.coalescer.flush() {
                    room.broadcast(&ServerMessage::SceneDelta(Box::new(delta)));
                }
            });
        }

        Ok(())
    }

    /// Relay an ephemeral camera pose to the other subscribers and record it
    /// on the sender's presence entry.
    pub async fn relay_camera(&self, scene_id: SceneId, from: ClientId, pose: CameraPose) {
        let Some(room) = self.room(scene_id).await else {
            return;
        };
        let mut room = room.lock().await;
        room.presence.touch(from, Some(pose.clone()));
        room.broadcast_except(from, &ServerMessage::Camera { from, pose });
    }

    /// Relay ephemeral viewport state to the other subscribers.
    pub async fn relay_viewport(&self, scene_id: SceneId, from: ClientId, viewport: ViewportState) {
        let Some(room) = self.room(scene_id).await else {
            return;
        };
        let mut room = room.lock().await;
        room.presence.touch(from, None);
        room.broadcast_except(from, &ServerMessage::ViewportSync { from, viewport });
    }

    /// Stamp a chat message with server time and deliver it to every
    /// subscriber, sender included, so everyone shares one ordering.
    pub async fn relay_chat(&self, scene_id: SceneId, from: ClientId, message: String) {
        let Some(room) = self.room(scene_id).await else {
            return;
        };
        let mut room = room.lock().await;
        room.presence.touch(from, None);
        room.broadcast(&ServerMessage::Chat {
            from,
            message,
            timestamp: now_ms(),
        });
    }

    /// Canonical version of an active scene, if a room is open for it.
    pub async fn scene_version(&self, scene_id: SceneId) -> Option<u64> {
        let room = self.room(scene_id).await?;
        let room = room.lock().await;
        Some(room.scene.version)
    }

    /// Number of subscribers in an active scene's room.
    pub async fn subscriber_count(&self, scene_id: SceneId) -> usize {
        match self.room(scene_id).await {
            Some(room) => room.lock().await.subscribers.len(),
            None => 0,
        }
    }

    async fn room(&self, scene_id: SceneId) -> Option<Arc<Mutex<Room>>> {
        self.rooms.lock().await.get(&scene_id).cloned()
    }

    /// Get the room for a scene, loading it from the store on first access.
    async fn room_or_load(&self, scene_id: SceneId) -> Result<Arc<Mutex<Room>>, HubError> {
        if let Some(room) = self.room(scene_id).await {
            return Ok(room);
        }
        // Load outside the map lock; a racing subscriber may win, in which
        // case their room is used and this load is discarded.
        let scene = self.store.load(scene_id).await?;
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .entry(scene_id)
            .or_insert_with(|| Arc::new(Mutex::new(Room::new(scene))))
            .clone();
        Ok(room)
    }
}

impl std::fmt::Debug for SceneHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneHub").finish_non_exhaustive()
    }
}
