//! Scene persistence seam.
//!
//! The hub loads scenes through [`SceneStore`] and saves them back with an
//! optimistic `expected_version` check. Persist-before-broadcast: a batch is
//! only announced to subscribers after the store accepted it, so a restarted
//! server can never be behind what clients saw.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::protocol::{SceneId, SceneState};

/// Errors from the persistence seam.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("scene {0} not found")]
    NotFound(SceneId),
    /// Another writer won the race: the stored version no longer matches the
    /// `expected_version` the caller read.
    #[error("scene {scene_id} version mismatch: stored {stored}, expected {expected}")]
    Conflict {
        scene_id: SceneId,
        stored: u64,
        expected: u64,
    },
    /// The backing store is unreachable or rejected the write.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage for scene documents.
///
/// Implementations must make `save` atomic with respect to the version check:
/// the write succeeds only if the stored version still equals
/// `expected_version`. The hub serializes writers per scene, so under normal
/// operation the check never fires, but the seam keeps external writers safe.
#[async_trait]
pub trait SceneStore: Send + Sync + 'static {
    /// Load a scene by id.
    async fn load(&self, scene_id: SceneId) -> Result<SceneState, StoreError>;

    /// Persist a scene, succeeding only if the stored version still equals
    /// `expected_version`.
    async fn save(&self, scene: &SceneState, expected_version: u64) -> Result<(), StoreError>;
}

/// In-memory [`SceneStore`] backed by a `HashMap`.
///
/// The default backend for tests and single-process deployments. Scenes that
/// were never inserted are created empty on first load, so subscribing to a
/// fresh scene id just works — unless the id was explicitly
/// [marked missing](MemoryStore::mark_missing), which stands in for a deleted
/// scene and exercises the `SCENE_NOT_FOUND` rejection path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    scenes: Mutex<HashMap<SceneId, SceneState>>,
    /// Ids that `load` reports as [`StoreError::NotFound`] instead of
    /// auto-creating.
    missing: Mutex<HashSet<SceneId>>,
    /// When `true`, the next `save` fails with `Unavailable` and the flag
    /// resets. Lets tests exercise the persist-before-broadcast path.
    fail_next_save: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a scene document, replacing any existing one.
    pub async fn insert(&self, scene: SceneState) {
        self.missing.lock().await.remove(&scene.id);
        self.scenes.lock().await.insert(scene.id, scene);
    }

    /// Treat `scene_id` as deleted: `load` fails with
    /// [`StoreError::NotFound`] until the scene is inserted again.
    pub async fn mark_missing(&self, scene_id: SceneId) {
        self.missing.lock().await.insert(scene_id);
        self.scenes.lock().await.remove(&scene_id);
    }

    /// Make the next `save` call fail with [`StoreError::Unavailable`].
    pub fn fail_next_save(&self) {
        self.fail_next_save
            .store(true, std::sync::atomic::Ordering::Release);
    }
}

#[async_trait]
impl SceneStore for MemoryStore {
    async fn load(&self, scene_id: SceneId) -> Result<SceneState, StoreError> {
        if self.missing.lock().await.contains(&scene_id) {
            return Err(StoreError::NotFound(scene_id));
        }
        let mut scenes = self.scenes.lock().await;
        Ok(scenes
            .entry(scene_id)
            .or_insert_with(|| SceneState::new(scene_id))
            .clone())
    }

    async fn save(&self, scene: &SceneState, expected_version: u64) -> Result<(), StoreError> {
        if self
            .fail_next_save
            .swap(false, std::sync::atomic::Ordering::AcqRel)
        {
            return Err(StoreError::Unavailable("simulated outage".into()));
        }
        let mut scenes = self.scenes.lock().await;
        match scenes.get(&scene.id) {
            Some(stored) if stored.version != expected_version => Err(StoreError::Conflict {
                scene_id: scene.id,
                stored: stored.version,
                expected: expected_version,
            }),
            _ => {
                scenes.insert(scene.id, scene.clone());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn load_creates_empty_scene_on_first_access() {
        let store = MemoryStore::new();
        let id = Uuid::from_u128(1);
        let scene = store.load(id).await.unwrap();
        assert_eq!(scene.id, id);
        assert_eq!(scene.version, 1);
        assert!(scene.items.is_empty());
    }

    #[tokio::test]
    async fn save_checks_expected_version() {
        let store = MemoryStore::new();
        let id = Uuid::from_u128(2);
        let mut scene = store.load(id).await.unwrap();

        scene.version = 2;
        store.save(&scene, 1).await.unwrap();

        // Stale writer: the stored version is now 2, not 1.
        let mut stale = scene.clone();
        stale.version = 3;
        let err = store.save(&stale, 1).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                stored: 2,
                expected: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn marked_missing_scene_fails_to_load() {
        let store = MemoryStore::new();
        let id = Uuid::from_u128(4);
        store.mark_missing(id).await;
        assert!(matches!(
            store.load(id).await,
            Err(StoreError::NotFound(missing)) if missing == id
        ));

        // Re-inserting the scene clears the tombstone.
        store.insert(SceneState::new(id)).await;
        assert_eq!(store.load(id).await.unwrap().id, id);
    }

    #[tokio::test]
    async fn fail_next_save_fires_once() {
        let store = MemoryStore::new();
        let id = Uuid::from_u128(3);
        let scene = store.load(id).await.unwrap();

        store.fail_next_save();
        assert!(matches!(
            store.save(&scene, 1).await,
            Err(StoreError::Unavailable(_))
        ));
        // The flag resets after firing.
        store.save(&scene, 1).await.unwrap();
    }
}
