//! Delta coalescing buffer.
//!
//! Rapid successive batches against a scene are merged into a single
//! `SCENE_DELTA` broadcast inside a short window, so a burst of drag updates
//! does not fan out as dozens of frames. Coalescing merges, it never drops:
//! the flushed delta carries every applied operation in application order and
//! the version of the *last* merged batch, so subscribers observe every
//! operation and every version landmark in order.
//!
//! This type is pure accumulation — the hub owns the timer that decides when
//! to call [`DeltaCoalescer::flush`].

use std::time::Duration;

use crate::protocol::DeltaPayload;

/// How long applied deltas accumulate before a merged broadcast.
pub const COALESCE_WINDOW: Duration = Duration::from_millis(16);

/// Accumulates applied deltas for one scene between flushes.
#[derive(Debug, Default)]
pub struct DeltaCoalescer {
    pending: Option<DeltaPayload>,
}

impl DeltaCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an applied delta into the pending broadcast.
    ///
    /// Operations append in application order; version, actor, timestamp and
    /// request id take the newest batch's values so the flushed delta lands
    /// subscribers on the latest canonical version.
    pub fn push(&mut self, delta: DeltaPayload) {
        match &mut self.pending {
            Some(pending) => {
                pending.operations.extend(delta.operations);
                pending.version = delta.version;
                pending.actor = delta.actor;
                pending.timestamp = delta.timestamp;
                pending.request_id = delta.request_id;
            }
            None => self.pending = Some(delta),
        }
    }

    /// Take the merged delta, leaving the buffer empty.
    pub fn flush(&mut self) -> Option<DeltaPayload> {
        self.pending.take()
    }

    /// Whether a flush would produce a delta.
    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::protocol::{ActorInfo, Operation, SceneItem};
    use uuid::Uuid;

    fn delta(version: u64, request_id: &str, operations: Vec<Operation>) -> DeltaPayload {
        DeltaPayload {
            scene_id: Uuid::from_u128(1),
            operations,
            version,
            actor: ActorInfo {
                id: Uuid::from_u128(version as u128),
                role: "editor".into(),
            },
            timestamp: 1000 + version,
            request_id: request_id.into(),
        }
    }

    #[test]
    fn single_delta_flushes_unchanged() {
        let mut coalescer = DeltaCoalescer::new();
        let input = delta(2, "r1", vec![Operation::RemoveItem { id: "x".into() }]);
        coalescer.push(input.clone());
        assert!(coalescer.is_armed());
        assert_eq!(coalescer.flush().unwrap(), input);
        assert!(!coalescer.is_armed());
    }

    #[test]
    fn merge_preserves_operation_order_and_takes_last_version() {
        let mut coalescer = DeltaCoalescer::new();
        coalescer.push(delta(
            2,
            "r1",
            vec![Operation::UpsertItem {
                item: SceneItem::new("a", "chairs"),
            }],
        ));
        coalescer.push(delta(3, "r2", vec![Operation::RemoveItem { id: "a".into() }]));
        coalescer.push(delta(
            4,
            "r3",
            vec![Operation::UpsertItem {
                item: SceneItem::new("b", "tables"),
            }],
        ));

        let merged = coalescer.flush().unwrap();
        assert_eq!(merged.version, 4);
        assert_eq!(merged.request_id, "r3");
        assert_eq!(merged.operations.len(), 3);
        assert!(matches!(&merged.operations[0], Operation::UpsertItem { item } if item.id == "a"));
        assert!(matches!(&merged.operations[1], Operation::RemoveItem { id } if id == "a"));
        assert!(matches!(&merged.operations[2], Operation::UpsertItem { item } if item.id == "b"));
    }

    #[test]
    fn flush_on_empty_is_none() {
        let mut coalescer = DeltaCoalescer::new();
        assert!(coalescer.flush().is_none());
    }

    #[test]
    fn buffer_resets_after_flush() {
        let mut coalescer = DeltaCoalescer::new();
        coalescer.push(delta(2, "r1", vec![]));
        let _ = coalescer.flush();
        coalescer.push(delta(3, "r2", vec![Operation::RemoveItem { id: "y".into() }]));
        let merged = coalescer.flush().unwrap();
        assert_eq!(merged.version, 3);
        assert_eq!(merged.operations.len(), 1);
    }
}
