//! Presence roster for one scene.
//!
//! Tracks the subscribers currently in a scene, assigns each joiner a display
//! color by deterministic palette rotation, and produces the presence events
//! the hub broadcasts. Presence symmetry lives here: a joiner receives the
//! roster (never their own join event) while the clients already present
//! receive the incremental join.

use std::collections::HashMap;

use crate::protocol::{
    now_ms, CameraPose, ClientId, PresenceEvent, PresenceRecord, PresenceStatus,
};

/// Display colors assigned to joiners in rotation.
const PALETTE: [&str; 8] = [
    "#f87171", "#fb923c", "#facc15", "#4ade80", "#22d3ee", "#60a5fa", "#a78bfa", "#f472b6",
];

/// Roster of subscribers present in one scene.
#[derive(Debug, Default)]
pub struct PresenceRoster {
    records: HashMap<ClientId, PresenceRecord>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a joiner, assigning a palette color by current roster size
    /// (`count mod palette length`, so a vacated slot's color comes back into
    /// rotation), and return the join event to broadcast to the *other*
    /// subscribers.
    ///
    /// A rejoin under the same id (e.g. a fast reconnect) replaces the old
    /// record but keeps its color.
    pub fn join(&mut self, client_id: ClientId, name: impl Into<String>) -> PresenceEvent {
        let color = match self.records.get(&client_id) {
            Some(existing) => existing.color.clone(),
            None => {
                let index = self.records.len() % PALETTE.len();
                PALETTE.get(index).copied().unwrap_or("#f87171").to_owned()
            }
        };
        let record = PresenceRecord {
            id: client_id,
            name: name.into(),
            color,
            status: PresenceStatus::Online,
            last_seen: now_ms(),
            camera: None,
        };
        self.records.insert(client_id, record.clone());
        PresenceEvent::UserJoined {
            user: record,
            timestamp: now_ms(),
        }
    }

    /// Remove a subscriber and return the leave event to broadcast, or `None`
    /// if the id was not present.
    pub fn leave(&mut self, client_id: ClientId) -> Option<PresenceEvent> {
        self.records.remove(&client_id)?;
        Some(PresenceEvent::UserLeft {
            id: client_id,
            timestamp: now_ms(),
        })
    }

    /// Snapshot of everyone currently present, for the joining client.
    pub fn roster(&self) -> PresenceEvent {
        let mut users: Vec<_> = self.records.values().cloned().collect();
        // Stable order for consumers and tests.
        users.sort_by_key(|record| record.id);
        PresenceEvent::Roster { users }
    }

    /// Record activity for a subscriber, refreshing `last_seen` and
    /// optionally the shared camera pose.
    pub fn touch(&mut self, client_id: ClientId, camera: Option<CameraPose>) {
        if let Some(record) = self.records.get_mut(&client_id) {
            record.last_seen = now_ms();
            if camera.is_some() {
                record.camera = camera;
            }
        }
    }

    /// Update a subscriber's presence status.
    pub fn set_status(&mut self, client_id: ClientId, status: PresenceStatus) {
        if let Some(record) = self.records.get_mut(&client_id) {
            record.status = status;
            record.last_seen = now_ms();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.records.contains_key(&client_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn id(n: u128) -> ClientId {
        Uuid::from_u128(n)
    }

    #[test]
    fn colors_rotate_through_palette() {
        let mut roster = PresenceRoster::new();
        let mut colors = Vec::new();
        for n in 0..10 {
            match roster.join(id(n), format!("u{n}")) {
                PresenceEvent::UserJoined { user, .. } => colors.push(user.color),
                other => panic!("expected UserJoined, got {other:?}"),
            }
        }
        assert_eq!(colors[0], PALETTE[0]);
        assert_eq!(colors[7], PALETTE[7]);
        // The ninth joiner wraps around to the first color.
        assert_eq!(colors[8], PALETTE[0]);
        assert_eq!(colors[9], PALETTE[1]);
    }

    #[test]
    fn palette_index_follows_current_roster_size() {
        let mut roster = PresenceRoster::new();
        roster.join(id(1), "a");
        roster.join(id(2), "b");
        roster.leave(id(1)).unwrap();
        // One seat is occupied, so the next joiner gets the second color.
        match roster.join(id(3), "c") {
            PresenceEvent::UserJoined { user, .. } => assert_eq!(user.color, PALETTE[1]),
            other => panic!("expected UserJoined, got {other:?}"),
        }
    }

    #[test]
    fn rejoin_keeps_color() {
        let mut roster = PresenceRoster::new();
        roster.join(id(1), "a");
        roster.join(id(2), "b");
        match roster.join(id(1), "a again") {
            PresenceEvent::UserJoined { user, .. } => {
                assert_eq!(user.color, PALETTE[0]);
                assert_eq!(user.name, "a again");
            }
            other => panic!("expected UserJoined, got {other:?}"),
        }
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn roster_excludes_departed_users() {
        let mut roster = PresenceRoster::new();
        roster.join(id(1), "a");
        roster.join(id(2), "b");
        roster.leave(id(1)).unwrap();
        match roster.roster() {
            PresenceEvent::Roster { users } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].id, id(2));
            }
            other => panic!("expected Roster, got {other:?}"),
        }
    }

    #[test]
    fn leave_of_unknown_id_is_none() {
        let mut roster = PresenceRoster::new();
        assert!(roster.leave(id(9)).is_none());
    }

    #[test]
    fn touch_updates_camera() {
        let mut roster = PresenceRoster::new();
        roster.join(id(1), "a");
        let pose = CameraPose {
            position: [1.0, 2.0, 3.0],
            rotation_quaternion: [0.0, 0.0, 0.0, 1.0],
        };
        roster.touch(id(1), Some(pose.clone()));
        match roster.roster() {
            PresenceEvent::Roster { users } => {
                assert_eq!(users[0].camera.as_ref(), Some(&pose));
            }
            other => panic!("expected Roster, got {other:?}"),
        }
    }
}
