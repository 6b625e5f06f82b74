//! The scene mutation engine: applies operation batches to canonical scene
//! state.
//!
//! The engine is pure and synchronous so the server can run it under its
//! per-scene lock and clients can replay broadcast deltas onto a local
//! replica with the same code path. Versioning and persistence stay with the
//! caller ([`crate::server::hub`] bumps the version once per committed batch;
//! clients adopt the version reported by the delta).

use thiserror::Error;

use crate::protocol::{ItemId, ItemPatch, Operation, SceneItem, ScenePropsPatch, SceneState};

/// Why a batch could not be applied. Any failure rejects the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// An `update_item` operation targeted an id not present in the scene.
    /// Updates never create items implicitly.
    #[error("item not found: {id}")]
    ItemNotFound { id: ItemId },
}

/// Apply a batch of operations to `state`, atomically.
///
/// Operations are applied in array order. If any operation fails, `state` is
/// left untouched and the error names the offending item. The version is NOT
/// changed here — callers decide whether the batch commits.
pub fn apply_operations(state: &mut SceneState, operations: &[Operation]) -> Result<(), ApplyError> {
    // Stage on a scratch copy so a mid-batch failure cannot leave the scene
    // partially mutated.
    let mut staged = state.clone();
    for operation in operations {
        apply_one(&mut staged, operation)?;
    }
    *state = staged;
    Ok(())
}

/// Apply and commit a batch: on success with a non-empty batch, bump the
/// version by exactly 1 (once per batch, not per operation) and refresh the
/// modification timestamp. Returns `true` if the version advanced.
///
/// An empty batch is accepted as a no-op and does not advance the version.
pub fn apply_batch(
    state: &mut SceneState,
    operations: &[Operation],
    timestamp: u64,
) -> Result<bool, ApplyError> {
    if operations.is_empty() {
        return Ok(false);
    }
    apply_operations(state, operations)?;
    state.version += 1;
    state.updated_at = timestamp;
    Ok(true)
}

fn apply_one(state: &mut SceneState, operation: &Operation) -> Result<(), ApplyError> {
    match operation {
        Operation::UpsertItem { item } => {
            match state.items.iter_mut().find(|existing| existing.id == item.id) {
                Some(existing) => *existing = item.clone(),
                None => state.items.push(item.clone()),
            }
        }
        Operation::UpdateItem { id, patch } => {
            let item = state
                .items
                .iter_mut()
                .find(|existing| &existing.id == id)
                .ok_or_else(|| ApplyError::ItemNotFound { id: id.clone() })?;
            merge_item_patch(item, patch);
        }
        Operation::RemoveItem { id } => {
            // Tolerates duplicate delivery: absent id is not an error.
            state.items.retain(|existing| &existing.id != id);
        }
        Operation::SceneProps { patch } => {
            merge_props_patch(state, patch);
        }
    }
    Ok(())
}

fn merge_item_patch(item: &mut SceneItem, patch: &ItemPatch) {
    if let Some(category) = &patch.category {
        item.category = category.clone();
    }
    if let Some(transform) = &patch.transform {
        item.transform = transform.clone();
    }
    if let Some(material) = &patch.material {
        item.material = Some(material.clone());
    }
    if let Some(selectable) = patch.selectable {
        item.selectable = selectable;
    }
    if let Some(locked) = patch.locked {
        item.locked = locked;
    }
    if let Some(metadata) = &patch.metadata {
        for (key, value) in metadata {
            item.metadata.insert(key.clone(), value.clone());
        }
    }
}

fn merge_props_patch(state: &mut SceneState, patch: &ScenePropsPatch) {
    if let Some(exposure) = patch.exposure {
        state.props.exposure = exposure;
    }
    if let Some(environment) = &patch.environment {
        state.props.environment = Some(environment.clone());
    }
    if let Some(intensity) = patch.environment_intensity {
        state.props.environment_intensity = intensity;
    }
    if let Some(spawn) = &patch.spawn {
        state.props.spawn = spawn.clone();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::protocol::{SceneProps, Transform};
    use uuid::Uuid;

    fn scene() -> SceneState {
        SceneState::new(Uuid::from_u128(1))
    }

    fn chair(id: &str) -> SceneItem {
        SceneItem::new(id, "chairs")
    }

    #[test]
    fn upsert_creates_then_replaces() {
        let mut state = scene();
        apply_operations(
            &mut state,
            &[Operation::UpsertItem { item: chair("i1") }],
        )
        .unwrap();
        assert_eq!(state.items.len(), 1);

        let mut replacement = chair("i1");
        replacement.category = "tables".into();
        replacement.locked = true;
        apply_operations(
            &mut state,
            &[Operation::UpsertItem { item: replacement }],
        )
        .unwrap();
        assert_eq!(state.items.len(), 1);
        assert_eq!(state.items[0].category, "tables");
        assert!(state.items[0].locked);
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut once = scene();
        let op = Operation::UpsertItem { item: chair("i1") };
        apply_operations(&mut once, &[op.clone()]).unwrap();

        let mut twice = scene();
        apply_operations(&mut twice, &[op.clone()]).unwrap();
        apply_operations(&mut twice, &[op]).unwrap();

        assert_eq!(once.items, twice.items);
    }

    #[test]
    fn update_merges_only_present_fields() {
        let mut state = scene();
        apply_operations(
            &mut state,
            &[Operation::UpsertItem { item: chair("i1") }],
        )
        .unwrap();

        apply_operations(
            &mut state,
            &[Operation::UpdateItem {
                id: "i1".into(),
                patch: ItemPatch {
                    transform: Some(Transform {
                        position: [1.0, 0.0, 0.0],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            }],
        )
        .unwrap();

        let item = state.item("i1").unwrap();
        assert_eq!(item.transform.position, [1.0, 0.0, 0.0]);
        // Untouched fields survive the merge.
        assert_eq!(item.category, "chairs");
        assert!(item.selectable);
    }

    #[test]
    fn update_missing_item_fails() {
        let mut state = scene();
        let err = apply_operations(
            &mut state,
            &[Operation::UpdateItem {
                id: "ghost".into(),
                patch: ItemPatch::default(),
            }],
        )
        .unwrap_err();
        assert_eq!(err, ApplyError::ItemNotFound { id: "ghost".into() });
    }

    #[test]
    fn remove_missing_item_is_noop() {
        let mut state = scene();
        apply_operations(
            &mut state,
            &[Operation::UpsertItem { item: chair("keep") }],
        )
        .unwrap();
        let before = state.clone();

        apply_operations(&mut state, &[Operation::RemoveItem { id: "ghost".into() }]).unwrap();
        assert_eq!(state.items, before.items);
    }

    #[test]
    fn failed_batch_leaves_state_untouched() {
        let mut state = scene();
        apply_operations(
            &mut state,
            &[Operation::UpsertItem { item: chair("i1") }],
        )
        .unwrap();
        let before = state.clone();

        // The upsert in this batch would succeed, but the update fails, so
        // nothing may apply.
        let err = apply_operations(
            &mut state,
            &[
                Operation::UpsertItem { item: chair("i2") },
                Operation::UpdateItem {
                    id: "ghost".into(),
                    patch: ItemPatch::default(),
                },
            ],
        )
        .unwrap_err();
        assert_eq!(err, ApplyError::ItemNotFound { id: "ghost".into() });
        assert_eq!(state, before);
    }

    #[test]
    fn scene_props_merge_is_partial() {
        let mut state = scene();
        state.props = SceneProps {
            exposure: 1.0,
            environment: Some("studio.hdr".into()),
            environment_intensity: 1.0,
            spawn: Default::default(),
        };

        apply_operations(
            &mut state,
            &[Operation::SceneProps {
                patch: ScenePropsPatch {
                    exposure: Some(0.5),
                    ..Default::default()
                },
            }],
        )
        .unwrap();

        assert_eq!(state.props.exposure, 0.5);
        assert_eq!(state.props.environment.as_deref(), Some("studio.hdr"));
        assert_eq!(state.props.environment_intensity, 1.0);
    }

    #[test]
    fn batch_bumps_version_once() {
        let mut state = scene();
        assert_eq!(state.version, 1);

        let bumped = apply_batch(
            &mut state,
            &[
                Operation::UpsertItem { item: chair("a") },
                Operation::UpsertItem { item: chair("b") },
                Operation::UpsertItem { item: chair("c") },
            ],
            42,
        )
        .unwrap();
        assert!(bumped);
        assert_eq!(state.version, 2);
        assert_eq!(state.updated_at, 42);
    }

    #[test]
    fn empty_batch_is_noop_without_version_bump() {
        let mut state = scene();
        let before = state.clone();
        let bumped = apply_batch(&mut state, &[], 42).unwrap();
        assert!(!bumped);
        assert_eq!(state, before);
    }

    #[test]
    fn operations_apply_in_array_order() {
        let mut state = scene();
        apply_batch(
            &mut state,
            &[
                Operation::UpsertItem { item: chair("i1") },
                Operation::UpdateItem {
                    id: "i1".into(),
                    patch: ItemPatch {
                        locked: Some(true),
                        ..Default::default()
                    },
                },
                Operation::RemoveItem { id: "i1".into() },
            ],
            1,
        )
        .unwrap();
        assert!(state.items.is_empty());
        assert_eq!(state.version, 2);
    }
}
