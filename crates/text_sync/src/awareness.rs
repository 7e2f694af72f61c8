//! Awareness registry: ephemeral per-replica presence shared outside the CRDT.
//!
//! Every replica owns one JSON payload (name, colour, cursor, ...) stamped with
//! a clock that only its owner advances. Remote copies are last-write-wins on
//! that clock, are dropped when their owner publishes an explicit `null`, and
//! expire silently if no refresh arrives within the timeout. Nothing here is
//! persisted.

use crate::replica::ReplicaId;
use crate::text_store::CursorAnchor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

/// Default expiry for entries that stop refreshing.
pub const DEFAULT_AWARENESS_TIMEOUT_MS: u64 = 30_000;

/// Cursor colours handed out to participants.
pub const PALETTE: [&str; 8] = [
    "#2563EB", // Blue
    "#059669", // Emerald
    "#D97706", // Amber
    "#DC2626", // Red
    "#7C3AED", // Violet
    "#DB2777", // Pink
    "#4F46E5", // Indigo
    "#0891B2", // Cyan
];

/// Pick a palette colour for a replica.
pub fn color_for(replica: ReplicaId) -> &'static str {
    PALETTE[(replica.value() % PALETTE.len() as u64) as usize]
}

/// One replica's awareness state as sent on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub replica: ReplicaId,
    pub clock: u64,
    /// `None` announces that the replica left
    pub state: Option<Value>,
}

/// Which replicas' entries changed in one step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ReplicaId>,
    pub updated: Vec<ReplicaId>,
    pub removed: Vec<ReplicaId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    fn absorb(&mut self, other: AwarenessChange) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.removed.extend(other.removed);
    }
}

/// Typed presence payload published by each participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    #[serde(rename = "uid")]
    pub user_id: String,
    pub name: String,
    pub color: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorAnchor>,
}

impl Presence {
    /// Presence for a participant, coloured from the replica id.
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, replica: ReplicaId) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            color: color_for(replica).to_string(),
            active: true,
            cursor: None,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// A remote participant, ready for rendering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Collaborator {
    pub replica: ReplicaId,
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub active: bool,
    pub cursor: Option<CursorAnchor>,
    /// Last refresh (ms since epoch)
    pub last_seen_ms: u64,
}

#[derive(Clone, Debug)]
struct AwarenessEntry {
    state: Value,
    last_updated_ms: u64,
}

/// Presence of every replica in a session.
pub struct AwarenessRegistry {
    local: ReplicaId,
    local_clock: u64,
    states: HashMap<ReplicaId, AwarenessEntry>,
    /// Highest clock seen per replica; outlives removal so stale updates
    /// cannot resurrect a departed replica
    clocks: HashMap<ReplicaId, u64>,
    timeout_ms: u64,
    events: broadcast::Sender<AwarenessChange>,
}

impl AwarenessRegistry {
    /// Create a registry for `local` with the given expiry.
    pub fn new(local: ReplicaId, timeout_ms: u64) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            local,
            local_clock: 0,
            states: HashMap::new(),
            clocks: HashMap::new(),
            timeout_ms,
            events,
        }
    }

    pub fn local_replica(&self) -> ReplicaId {
        self.local
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Receive change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<AwarenessChange> {
        self.events.subscribe()
    }

    /// Publish a new local state; `None` announces departure.
    pub fn set_local_state(&mut self, state: Option<Value>) -> AwarenessUpdate {
        self.set_local_state_at(state, current_timestamp_ms())
    }

    pub fn set_local_state_at(&mut self, state: Option<Value>, now_ms: u64) -> AwarenessUpdate {
        self.local_clock += 1;
        self.clocks.insert(self.local, self.local_clock);

        let mut change = AwarenessChange::default();
        match &state {
            Some(value) => {
                let previous = self.states.insert(
                    self.local,
                    AwarenessEntry {
                        state: value.clone(),
                        last_updated_ms: now_ms,
                    },
                );
                match previous {
                    None => change.added.push(self.local),
                    Some(prev) if prev.state != *value => change.updated.push(self.local),
                    Some(_) => {}
                }
            }
            None => {
                if self.states.remove(&self.local).is_some() {
                    change.removed.push(self.local);
                }
            }
        }
        self.emit(change);

        AwarenessUpdate {
            replica: self.local,
            clock: self.local_clock,
            state,
        }
    }

    /// Current local payload, if any.
    pub fn local_state(&self) -> Option<&Value> {
        self.states.get(&self.local).map(|entry| &entry.state)
    }

    /// Every known state with its owner's clock, for a peer that just linked.
    pub fn all_updates(&self) -> Vec<AwarenessUpdate> {
        let mut updates: Vec<AwarenessUpdate> = self
            .states
            .iter()
            .map(|(replica, entry)| AwarenessUpdate {
                replica: *replica,
                clock: self.clocks.get(replica).copied().unwrap_or(0),
                state: Some(entry.state.clone()),
            })
            .collect();
        updates.sort_by_key(|update| update.replica);
        updates
    }

    /// Re-publish the local state if half the timeout has passed since the
    /// last publication, so peers do not expire it.
    pub fn refresh_local(&mut self) -> Option<AwarenessUpdate> {
        self.refresh_local_at(current_timestamp_ms())
    }

    pub fn refresh_local_at(&mut self, now_ms: u64) -> Option<AwarenessUpdate> {
        let entry = self.states.get_mut(&self.local)?;
        if now_ms.saturating_sub(entry.last_updated_ms) < self.timeout_ms / 2 {
            return None;
        }
        entry.last_updated_ms = now_ms;
        self.local_clock += 1;
        self.clocks.insert(self.local, self.local_clock);
        Some(AwarenessUpdate {
            replica: self.local,
            clock: self.local_clock,
            state: Some(entry.state.clone()),
        })
    }

    /// Merge an update received from a peer.
    pub fn apply_remote(&mut self, update: AwarenessUpdate) -> AwarenessChange {
        self.apply_remote_at(update, current_timestamp_ms())
    }

    pub fn apply_remote_at(&mut self, update: AwarenessUpdate, now_ms: u64) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        if update.replica == self.local {
            tracing::debug!(clock = update.clock, "ignoring awareness update about self");
            return change;
        }

        let known_clock = self.clocks.get(&update.replica).copied().unwrap_or(0);
        let present = self.states.contains_key(&update.replica);
        let newer = known_clock < update.clock;
        let leave_at_same_clock = known_clock == update.clock && update.state.is_none() && present;
        if !newer && !leave_at_same_clock {
            return change;
        }

        self.clocks.insert(update.replica, update.clock);
        match update.state {
            Some(state) => {
                let previous = self.states.insert(
                    update.replica,
                    AwarenessEntry {
                        state: state.clone(),
                        last_updated_ms: now_ms,
                    },
                );
                match previous {
                    None => change.added.push(update.replica),
                    Some(prev) if prev.state != state => change.updated.push(update.replica),
                    // Heartbeat: refreshed, nothing to report
                    Some(_) => {}
                }
            }
            None => {
                if self.states.remove(&update.replica).is_some() {
                    change.removed.push(update.replica);
                }
            }
        }

        self.emit(change.clone());
        change
    }

    /// Merge several updates, reporting the combined change once.
    pub fn apply_remote_batch(
        &mut self,
        updates: impl IntoIterator<Item = AwarenessUpdate>,
    ) -> AwarenessChange {
        let mut combined = AwarenessChange::default();
        for update in updates {
            combined.absorb(self.apply_remote(update));
        }
        combined
    }

    /// Drop remote entries that have not been refreshed within the timeout.
    pub fn remove_stale(&mut self) -> AwarenessChange {
        self.remove_stale_at(current_timestamp_ms())
    }

    pub fn remove_stale_at(&mut self, now_ms: u64) -> AwarenessChange {
        let local = self.local;
        let timeout = self.timeout_ms;
        let stale: Vec<ReplicaId> = self
            .states
            .iter()
            .filter(|(replica, entry)| {
                **replica != local && now_ms.saturating_sub(entry.last_updated_ms) >= timeout
            })
            .map(|(replica, _)| *replica)
            .collect();

        for replica in &stale {
            self.states.remove(replica);
        }
        let change = AwarenessChange {
            removed: stale,
            ..Default::default()
        };
        self.emit(change.clone());
        change
    }

    /// Every known state, local included.
    pub fn get_states(&self) -> HashMap<ReplicaId, Value> {
        self.states
            .iter()
            .map(|(replica, entry)| (*replica, entry.state.clone()))
            .collect()
    }

    pub fn get_state(&self, replica: ReplicaId) -> Option<&Value> {
        self.states.get(&replica).map(|entry| &entry.state)
    }

    /// Remote participants, excluding the local replica.
    pub fn collaborators(&self) -> Vec<Collaborator> {
        let mut collaborators: Vec<Collaborator> = self
            .states
            .iter()
            .filter(|(replica, _)| **replica != self.local)
            .map(|(replica, entry)| {
                let presence = Presence::from_value(&entry.state);
                Collaborator {
                    replica: *replica,
                    user_id: presence
                        .as_ref()
                        .map_or_else(|| "unknown".to_string(), |p| p.user_id.clone()),
                    display_name: presence
                        .as_ref()
                        .map_or_else(|| "Anonymous".to_string(), |p| p.name.clone()),
                    color: presence
                        .as_ref()
                        .map_or_else(|| "#000000".to_string(), |p| p.color.clone()),
                    active: presence.as_ref().is_some_and(|p| p.active),
                    cursor: presence.and_then(|p| p.cursor),
                    last_seen_ms: entry.last_updated_ms,
                }
            })
            .collect();
        collaborators.sort_by_key(|c| c.replica);
        collaborators
    }

    fn emit(&self, change: AwarenessChange) {
        if !change.is_empty() {
            // No subscribers is fine
            let _ = self.events.send(change);
        }
    }
}

/// Get the current timestamp in milliseconds since epoch
pub(crate) fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry(local: u64) -> AwarenessRegistry {
        AwarenessRegistry::new(ReplicaId(local), DEFAULT_AWARENESS_TIMEOUT_MS)
    }

    fn update(replica: u64, clock: u64, state: Option<Value>) -> AwarenessUpdate {
        AwarenessUpdate {
            replica: ReplicaId(replica),
            clock,
            state,
        }
    }

    #[test]
    fn test_set_local_state() {
        let mut reg = registry(1);
        let first = reg.set_local_state(Some(json!({"name": "Ada"})));
        let second = reg.set_local_state(Some(json!({"name": "Ada L."})));
        assert_eq!(first.clock, 1);
        assert_eq!(second.clock, 2);
        assert_eq!(reg.local_state(), Some(&json!({"name": "Ada L."})));
        let published = reg.all_updates();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].clock, 2);
    }

    #[test]
    fn test_last_writer_wins_per_clock() {
        let mut reg = registry(1);
        let change = reg.apply_remote_at(update(2, 3, Some(json!("new"))), 1_000);
        assert_eq!(change.added, vec![ReplicaId(2)]);

        // Older clock is ignored
        let change = reg.apply_remote_at(update(2, 2, Some(json!("old"))), 2_000);
        assert!(change.is_empty());
        assert_eq!(reg.get_state(ReplicaId(2)), Some(&json!("new")));

        let change = reg.apply_remote_at(update(2, 4, Some(json!("newer"))), 3_000);
        assert_eq!(change.updated, vec![ReplicaId(2)]);
    }

    #[test]
    fn test_explicit_leave() {
        let mut reg = registry(1);
        reg.apply_remote_at(update(2, 1, Some(json!({}))), 1_000);
        let change = reg.apply_remote_at(update(2, 1, None), 1_500);
        assert_eq!(change.removed, vec![ReplicaId(2)]);
        assert!(reg.get_state(ReplicaId(2)).is_none());

        // A delayed copy of the old state does not bring it back
        let change = reg.apply_remote_at(update(2, 1, Some(json!({}))), 2_000);
        assert!(change.is_empty());
    }

    #[test]
    fn test_heartbeat_refreshes_without_change() {
        let mut reg = registry(1);
        reg.apply_remote_at(update(2, 1, Some(json!({"a": 1}))), 0);
        let change = reg.apply_remote_at(update(2, 2, Some(json!({"a": 1}))), 20_000);
        assert!(change.is_empty());

        // Refreshed at 20s, so still alive at 40s
        assert!(reg.remove_stale_at(40_000).is_empty());
        assert_eq!(reg.remove_stale_at(50_000).removed, vec![ReplicaId(2)]);
    }

    #[test]
    fn test_stale_entries_expire_but_local_does_not() {
        let mut reg = registry(1);
        reg.set_local_state_at(Some(json!("me")), 0);
        reg.apply_remote_at(update(2, 1, Some(json!("you"))), 0);

        let change = reg.remove_stale_at(DEFAULT_AWARENESS_TIMEOUT_MS);
        assert_eq!(change.removed, vec![ReplicaId(2)]);
        assert!(reg.local_state().is_some());
    }

    #[test]
    fn test_refresh_local_after_half_timeout() {
        let mut reg = registry(1);
        assert!(reg.refresh_local_at(100_000).is_none());

        reg.set_local_state_at(Some(json!("me")), 0);
        assert!(reg.refresh_local_at(10_000).is_none());
        let refreshed = reg.refresh_local_at(15_000).unwrap();
        assert_eq!(refreshed.clock, 2);
        assert!(reg.refresh_local_at(20_000).is_none());
    }

    #[test]
    fn test_updates_about_self_ignored() {
        let mut reg = registry(1);
        reg.set_local_state(Some(json!("me")));
        let change = reg.apply_remote(update(1, 99, None));
        assert!(change.is_empty());
        assert!(reg.local_state().is_some());
    }

    #[tokio::test]
    async fn test_subscribers_receive_changes() {
        let mut reg = registry(1);
        let mut rx = reg.subscribe();
        reg.apply_remote(update(2, 1, Some(json!("x"))));
        let change = rx.recv().await.unwrap();
        assert_eq!(change.added, vec![ReplicaId(2)]);
    }

    #[test]
    fn test_collaborators_exclude_self() {
        let mut reg = registry(1);
        reg.set_local_state(Some(Presence::new("u1", "Me", ReplicaId(1)).to_value()));
        reg.apply_remote(update(
            2,
            1,
            Some(Presence::new("u2", "Grace", ReplicaId(2)).to_value()),
        ));
        reg.apply_remote(update(3, 1, Some(json!({"garbage": true}))));

        let collaborators = reg.collaborators();
        assert_eq!(collaborators.len(), 2);
        assert_eq!(collaborators[0].display_name, "Grace");
        assert_eq!(collaborators[0].color, PALETTE[2]);
        assert!(collaborators[0].active);
        assert_eq!(collaborators[1].display_name, "Anonymous");
        assert_eq!(collaborators[1].color, "#000000");
    }

    #[test]
    fn test_presence_user_id_travels_as_uid() {
        let value = Presence::new("u7", "Lin", ReplicaId(7)).to_value();
        assert_eq!(value["uid"], json!("u7"));
        assert!(value.get("user_id").is_none());

        let mut reg = registry(1);
        reg.apply_remote(update(
            7,
            1,
            Some(json!({"uid": "u7", "name": "Lin", "color": "#123456", "active": true})),
        ));
        assert_eq!(reg.collaborators()[0].user_id, "u7");
    }

    #[test]
    fn test_batch_merges_changes() {
        let mut reg = registry(1);
        let change = reg.apply_remote_batch(vec![
            update(2, 1, Some(json!(1))),
            update(3, 1, Some(json!(1))),
            update(2, 2, None),
        ]);
        assert_eq!(change.added, vec![ReplicaId(2), ReplicaId(3)]);
        assert_eq!(change.removed, vec![ReplicaId(2)]);
    }

    #[test]
    fn test_all_updates_carry_owner_clocks() {
        let mut reg = registry(1);
        reg.set_local_state(Some(json!("me")));
        reg.apply_remote(update(3, 7, Some(json!("them"))));
        reg.apply_remote(update(2, 4, Some(json!("gone"))));
        reg.apply_remote(update(2, 5, None));

        let updates = reg.all_updates();
        assert_eq!(
            updates,
            vec![update(1, 1, Some(json!("me"))), update(3, 7, Some(json!("them")))]
        );
    }
}
