//! Session coordinator: the synchronous core of a document session.
//!
//! The coordinator owns every piece of mutable state of one document on one
//! replica (text store, awareness, causal buffer, peers, editor binding) and
//! reacts to inputs one at a time. It never performs I/O itself; instead it
//! queues [`Outbound`] actions and [`SessionEvent`]s which the caller drains
//! after each input. [`crate::session`] drives it from a tokio task, tests
//! drive it directly.

use crate::awareness::{
    current_timestamp_ms, AwarenessChange, AwarenessRegistry, AwarenessUpdate, Presence,
};
use crate::binding::{EditorBinding, EditorEvent};
use crate::buffer::{CausalBuffer, StaleGap};
use crate::codec;
use crate::config::SessionConfig;
use crate::error::{CollabError, CollabResult};
use crate::operation::Operation;
use crate::peer::{PeerConnection, PeerOrigin, PeerState};
use crate::persistence::DocumentSnapshot;
use crate::protocol::{PeerMessage, SessionName};
use crate::replica::ReplicaId;
use crate::state_vector::StateVector;
use crate::text_store::{TextChange, TextStore};
use crate::transport::{PeerAddress, TransportError};
use std::collections::BTreeMap;
use tokio::time::Instant;

/// An action for the transport.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Send { peer: PeerAddress, message: PeerMessage },
    Connect { peer: PeerAddress },
    Disconnect { peer: PeerAddress },
}

/// Something observers of a session may care about.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Remote edits changed the visible text.
    RemoteChanges(Vec<TextChange>),
    Awareness(AwarenessChange),
    PeerState { peer: PeerAddress, state: PeerState },
    /// An operation has been waiting on a missing dependency for too long.
    CausalGap(StaleGap),
    Saved { state_vector: StateVector },
    SaveFailed(CollabError),
}

/// Snapshot content waiting to learn whether a peer already holds the
/// document.
#[derive(Debug)]
struct PendingSeed {
    content: String,
    deadline: Instant,
}

/// Synchronous state machine for one document session.
pub struct SyncCoordinator {
    name: SessionName,
    config: SessionConfig,
    store: TextStore,
    awareness: AwarenessRegistry,
    buffer: CausalBuffer,
    binding: EditorBinding,
    pending_seed: Option<PendingSeed>,
    peers: BTreeMap<PeerAddress, PeerConnection>,
    /// Local operations not yet broadcast
    outgoing: Vec<Operation>,
    flush_deadline: Option<Instant>,
    presence: Option<Presence>,
    cursor_dirty: bool,
    saved_state: StateVector,
    outbox: Vec<Outbound>,
    events: Vec<SessionEvent>,
}

impl SyncCoordinator {
    pub fn new(name: SessionName, config: SessionConfig, replica: ReplicaId) -> Self {
        let awareness = AwarenessRegistry::new(replica, config.awareness_timeout_ms);
        Self {
            name,
            config,
            store: TextStore::new(replica),
            awareness,
            buffer: CausalBuffer::new(),
            binding: EditorBinding::new(),
            pending_seed: None,
            peers: BTreeMap::new(),
            outgoing: Vec::new(),
            flush_deadline: None,
            presence: None,
            cursor_dirty: false,
            saved_state: StateVector::new(),
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn name(&self) -> &SessionName {
        &self.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn replica(&self) -> ReplicaId {
        self.store.replica()
    }

    pub fn store(&self) -> &TextStore {
        &self.store
    }

    pub fn awareness(&self) -> &AwarenessRegistry {
        &self.awareness
    }

    pub fn binding_mut(&mut self) -> (&mut EditorBinding, &TextStore) {
        (&mut self.binding, &self.store)
    }

    /// The visible text. A loaded snapshot that has not been seeded yet
    /// reads as the document.
    pub fn text(&self) -> String {
        match &self.pending_seed {
            Some(seed) if self.store.is_empty() => seed.content.clone(),
            _ => self.store.render_visible_text(),
        }
    }

    /// Whether loaded snapshot content is still waiting to be seeded.
    pub fn seed_pending(&self) -> bool {
        self.pending_seed.is_some()
    }

    pub fn peer(&self, address: &PeerAddress) -> Option<&PeerConnection> {
        self.peers.get(address)
    }

    /// Every known peer with its state.
    pub fn peer_states(&self) -> Vec<(PeerAddress, PeerState)> {
        self.peers
            .iter()
            .map(|(address, peer)| (address.clone(), peer.state()))
            .collect()
    }

    /// Operations waiting on missing dependencies.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Load the persisted snapshot, if any.
    ///
    /// The snapshot is not seeded right away: a peer that already holds the
    /// document may have moved past it, and seeding different content on two
    /// replicas would duplicate the text. The seed is dropped when the first
    /// catch-up from a peer carries operations, and applied when it carries
    /// none, on the first local edit, or once `seed_wait_ms` has passed.
    pub fn open_document(
        &mut self,
        snapshot: Option<&DocumentSnapshot>,
        now: Instant,
    ) -> CollabResult<()> {
        self.saved_state = self.store.state_vector().clone();
        let Some(snapshot) = snapshot.filter(|s| !s.content.is_empty()) else {
            return Ok(());
        };
        self.pending_seed = Some(PendingSeed {
            content: snapshot.content.clone(),
            deadline: now + self.config.seed_wait(),
        });
        if self.config.seed_wait_ms == 0 {
            self.commit_seed(now)?;
        }
        Ok(())
    }

    /// Seed the store with the pending snapshot content.
    fn commit_seed(&mut self, now: Instant) -> CollabResult<()> {
        let Some(seed) = self.pending_seed.take() else {
            return Ok(());
        };
        let clean = self.store.state_vector() == &self.saved_state;
        let Some(op) = self.binding.seed(&mut self.store, &seed.content)? else {
            return Ok(());
        };
        tracing::info!(
            document = %self.name.document_id(),
            chars = self.store.len(),
            "seeded document from snapshot"
        );
        if clean {
            self.saved_state = self.store.state_vector().clone();
        }
        // Peers that already caught up with us learn the seed as a live update
        self.outgoing.insert(0, op);
        self.schedule_flush(now);
        Ok(())
    }

    /// A peer holds the document; its history replaces the snapshot.
    fn discard_seed(&mut self, from: &PeerAddress) {
        if self.pending_seed.take().is_some() {
            tracing::info!(
                document = %self.name.document_id(),
                peer = %from,
                "peer already holds the document, dropping snapshot seed"
            );
        }
    }

    /// Actions queued for the transport since the last call.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    // --- Local input ---

    /// Apply an editor mutation and schedule its broadcast.
    pub fn local_edit(&mut self, event: EditorEvent, now: Instant) -> CollabResult<()> {
        self.commit_seed(now)?;
        let ops = self.binding.handle_local(&mut self.store, event)?;
        if self.track_cursor() || !ops.is_empty() {
            self.schedule_flush(now);
        }
        self.outgoing.extend(ops);
        if self.outgoing.len() >= self.config.max_batch_ops {
            self.flush();
        }
        Ok(())
    }

    pub fn local_insert(&mut self, offset: usize, text: &str, now: Instant) -> CollabResult<()> {
        self.local_edit(
            EditorEvent::Insert {
                offset,
                text: text.to_string(),
            },
            now,
        )
    }

    pub fn local_delete(&mut self, start: usize, end: usize, now: Instant) -> CollabResult<()> {
        self.local_edit(EditorEvent::Delete { start, end }, now)
    }

    /// Publish the local participant's presence to every verified peer.
    pub fn set_presence(&mut self, mut presence: Presence) {
        presence.cursor = Some(self.binding.cursor_anchor(&self.store));
        let update = self.awareness.set_local_state(Some(presence.to_value()));
        self.presence = Some(presence);
        self.cursor_dirty = false;
        self.broadcast_awareness(vec![update]);
    }

    /// When the next timed action is due, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        let retries = self
            .peers
            .values()
            .filter(|peer| peer.state() == PeerState::Reconnecting)
            .filter_map(PeerConnection::retry_at);
        let seed = self.pending_seed.as_ref().map(|seed| seed.deadline);
        self.flush_deadline.into_iter().chain(seed).chain(retries).min()
    }

    /// Run timed actions that are due at `now`.
    pub fn poll(&mut self, now: Instant) {
        if self.pending_seed.as_ref().is_some_and(|seed| seed.deadline <= now) {
            tracing::debug!("no peer answered in time, seeding from snapshot");
            if let Err(err) = self.commit_seed(now) {
                tracing::warn!(error = %err, "failed to seed document");
            }
        }
        if self.flush_deadline.is_some_and(|at| at <= now) {
            self.flush();
        }
        let due: Vec<PeerAddress> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.retry_due(now))
            .map(|(address, _)| address.clone())
            .collect();
        for address in due {
            tracing::debug!(peer = %address, "retrying connection");
            self.dial(address);
        }
    }

    /// Broadcast pending local operations to every streaming peer.
    pub fn flush(&mut self) {
        self.flush_deadline = None;
        if self.cursor_dirty {
            self.cursor_dirty = false;
            if let Some(presence) = &self.presence {
                let update = self.awareness.set_local_state(Some(presence.to_value()));
                self.broadcast_awareness(vec![update]);
            }
        }
        if self.outgoing.is_empty() {
            return;
        }

        let ops = std::mem::take(&mut self.outgoing);
        let targets: Vec<PeerAddress> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.is_streaming())
            .map(|(address, _)| address.clone())
            .collect();
        if targets.is_empty() {
            // Peers catch up from the state vector exchange when they link
            tracing::debug!(ops = ops.len(), "no streaming peers, holding back broadcast");
            return;
        }

        for chunk in ops.chunks(self.config.max_batch_ops) {
            let update = match codec::encode(chunk) {
                Ok(update) => update,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to encode update");
                    continue;
                }
            };
            for peer in &targets {
                self.outbox.push(Outbound::Send {
                    peer: peer.clone(),
                    message: PeerMessage::Update {
                        update: update.clone(),
                    },
                });
            }
        }
    }

    // --- Peers ---

    /// Start (or restart) connecting to `address`.
    pub fn dial(&mut self, address: PeerAddress) {
        let peer = self
            .peers
            .entry(address.clone())
            .or_insert_with(|| PeerConnection::new(address.clone(), PeerOrigin::Dialed));
        let before = peer.state();
        if peer.begin_dial() {
            self.outbox.push(Outbound::Connect {
                peer: address.clone(),
            });
        }
        self.note_state(&address, before);
    }

    /// The transport finished a dial we requested.
    pub fn connect_succeeded(&mut self, address: &PeerAddress) {
        let Some(peer) = self.peers.get_mut(address) else {
            return;
        };
        let before = peer.state();
        if peer.link_up() {
            self.on_link_up(address);
        }
        self.note_state(address, before);
    }

    /// A dial we requested failed.
    pub fn connect_failed(&mut self, address: &PeerAddress, error: &TransportError, now: Instant) {
        let backoff = self.config.reconnect.clone();
        let Some(peer) = self.peers.get_mut(address) else {
            return;
        };
        let before = peer.state();
        peer.connect_failed(now, &backoff);
        match peer.state() {
            PeerState::Disconnected => tracing::warn!(
                peer = %address,
                attempts = peer.attempts(),
                error = %error,
                "giving up on peer"
            ),
            _ => tracing::debug!(
                peer = %address,
                attempts = peer.attempts(),
                error = %error,
                "connect failed, backing off"
            ),
        }
        self.note_state(address, before);
    }

    /// A remote peer opened a link to us.
    pub fn peer_joined(&mut self, address: PeerAddress) {
        let peer = self
            .peers
            .entry(address.clone())
            .or_insert_with(|| PeerConnection::new(address.clone(), PeerOrigin::Accepted));
        let before = peer.state();
        if peer.link_up() {
            tracing::info!(peer = %address, "peer joined");
            self.on_link_up(&address);
        }
        self.note_state(&address, before);
    }

    /// The link to `address` went away.
    pub fn peer_left(&mut self, address: &PeerAddress, now: Instant) {
        let backoff = self.config.reconnect.clone();
        let Some(peer) = self.peers.get_mut(address) else {
            return;
        };
        let before = peer.state();
        match peer.origin() {
            // We cannot dial back an address we only know as a caller
            PeerOrigin::Accepted => peer.close(),
            PeerOrigin::Dialed => {
                peer.link_down(now, &backoff);
            }
        }
        tracing::info!(peer = %address, "peer left");
        self.note_state(address, before);
    }

    fn on_link_up(&mut self, address: &PeerAddress) {
        self.send(
            address,
            PeerMessage::Hello {
                channel: self.name.as_str().to_string(),
                replica: self.store.replica(),
            },
        );
        self.send(
            address,
            PeerMessage::SyncStep1 {
                state_vector: codec::compute_state_vector(&self.store),
            },
        );
        let updates = self.awareness.all_updates();
        if !updates.is_empty() {
            self.send(address, PeerMessage::Awareness { updates });
        }
    }

    /// Process bytes received from `from`.
    ///
    /// Malformed input is reported as an error; the session itself is
    /// unaffected.
    pub fn handle_message(&mut self, from: &PeerAddress, bytes: &[u8], now: Instant) -> CollabResult<()> {
        let message = PeerMessage::from_bytes(bytes)?;

        // The remote side may talk before our own connect result is in
        if !self.peers.get(from).is_some_and(|p| p.state().is_linked()) {
            self.peer_joined(from.clone());
        }
        let Some(peer) = self.peers.get_mut(from) else {
            return Err(CollabError::UnknownPeer(from.to_string()));
        };
        if peer.is_rejected() {
            return Ok(());
        }

        tracing::debug!(peer = %from, kind = message.kind(), "received message");
        match message {
            PeerMessage::Hello { channel, replica } => {
                if let Err(err) = self.name.verify(&channel) {
                    let before = peer.state();
                    peer.reject();
                    tracing::warn!(peer = %from, error = %err, "rejecting peer from another session");
                    self.outbox.push(Outbound::Disconnect { peer: from.clone() });
                    self.note_state(from, before);
                    return Err(err);
                }
                peer.verify(replica);
                Ok(())
            }
            _ if !peer.is_verified() => {
                tracing::debug!(peer = %from, "ignoring message before hello");
                Ok(())
            }
            PeerMessage::SyncStep1 { state_vector } => {
                if !peer.last_known_state().is_empty() {
                    tracing::debug!(
                        peer = %from,
                        known = ?peer.last_known_state(),
                        "returning peer asks for catch-up"
                    );
                }
                if !peer.observe_state(&state_vector) {
                    tracing::warn!(
                        peer = %from,
                        "peer reports less than it held before, sending a full catch-up"
                    );
                }
                peer.start_streaming();
                let update = codec::diff_since(&self.store, &state_vector)?;
                self.send(from, PeerMessage::SyncStep2 { update });
                Ok(())
            }
            PeerMessage::SyncStep2 { update } => {
                let ops = codec::decode(&update)?;
                let before = peer.state();
                if peer.mark_synced() {
                    tracing::info!(peer = %from, ops = ops.len(), "peer synced");
                }
                if ops.is_empty() {
                    self.commit_seed(now)?;
                } else {
                    self.discard_seed(from);
                }
                self.integrate(from, ops, now);
                self.note_state(from, before);
                Ok(())
            }
            PeerMessage::Update { update } => {
                let ops = codec::decode(&update)?;
                if !ops.is_empty() {
                    self.discard_seed(from);
                }
                self.integrate(from, ops, now);
                Ok(())
            }
            PeerMessage::Awareness { updates } => {
                let change = self.awareness.apply_remote_batch(updates);
                self.note_awareness(change);
                Ok(())
            }
        }
    }

    fn integrate(&mut self, from: &PeerAddress, ops: Vec<Operation>, now: Instant) {
        let report = self.buffer.integrate(&mut self.store, ops, now);
        if !report.rejected.is_empty() {
            tracing::warn!(
                peer = %from,
                rejected = report.rejected.len(),
                "dropped malformed operations"
            );
        }
        if report.changes.is_empty() {
            return;
        }
        self.binding.apply_remote(&report.changes);
        self.binding
            .render_presence(&self.store, self.awareness.collaborators());
        self.events.push(SessionEvent::RemoteChanges(report.changes));
    }

    // --- Housekeeping ---

    /// Periodic maintenance: presence heartbeats and expiry, causal gap
    /// warnings, due retries and flushes.
    pub fn tick(&mut self, now: Instant) {
        self.tick_at(now, current_timestamp_ms());
    }

    pub fn tick_at(&mut self, now: Instant, now_ms: u64) {
        if let Some(update) = self.awareness.refresh_local_at(now_ms) {
            self.broadcast_awareness(vec![update]);
        }
        let expired = self.awareness.remove_stale_at(now_ms);
        self.note_awareness(expired);

        for gap in self.buffer.stale_gaps(now, self.config.causal_gap_warning()) {
            tracing::warn!(
                missing = %gap.missing,
                blocked = %gap.blocked,
                waited_ms = gap.waited.as_millis() as u64,
                "operation still waiting on a missing dependency"
            );
            self.events.push(SessionEvent::CausalGap(gap));
        }

        self.poll(now);
    }

    /// Flush pending edits, announce departure and drop every link.
    pub fn leave(&mut self) {
        self.flush();
        if self.awareness.local_state().is_some() {
            let update = self.awareness.set_local_state(None);
            self.broadcast_awareness(vec![update]);
        }
        let addresses: Vec<PeerAddress> = self.peers.keys().cloned().collect();
        for address in addresses {
            let Some(peer) = self.peers.get_mut(&address) else {
                continue;
            };
            let before = peer.state();
            if before.is_linked() {
                self.outbox.push(Outbound::Disconnect {
                    peer: address.clone(),
                });
            }
            peer.close();
            self.note_state(&address, before);
        }
    }

    // --- Persistence ---

    /// Whether edits have been integrated since the last save.
    pub fn is_dirty(&self) -> bool {
        self.store.state_vector() != &self.saved_state
    }

    /// The current content, ready to persist.
    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot::new(self.text(), self.store.state_vector().clone())
    }

    /// Record a successful save of `snapshot`.
    pub fn mark_saved(&mut self, snapshot: &DocumentSnapshot) {
        self.saved_state = snapshot.state_vector.clone();
        self.events.push(SessionEvent::Saved {
            state_vector: snapshot.state_vector.clone(),
        });
    }

    pub fn save_failed(&mut self, error: CollabError) {
        tracing::warn!(document = %self.name.document_id(), error = %error, "failed to save snapshot");
        self.events.push(SessionEvent::SaveFailed(error));
    }

    // --- Helpers ---

    fn send(&mut self, peer: &PeerAddress, message: PeerMessage) {
        self.outbox.push(Outbound::Send {
            peer: peer.clone(),
            message,
        });
    }

    fn broadcast_awareness(&mut self, updates: Vec<AwarenessUpdate>) {
        let targets: Vec<PeerAddress> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.is_verified())
            .map(|(address, _)| address.clone())
            .collect();
        for peer in targets {
            self.send(
                &peer,
                PeerMessage::Awareness {
                    updates: updates.clone(),
                },
            );
        }
    }

    fn note_awareness(&mut self, change: AwarenessChange) {
        if change.is_empty() {
            return;
        }
        self.binding
            .render_presence(&self.store, self.awareness.collaborators());
        self.events.push(SessionEvent::Awareness(change));
    }

    fn note_state(&mut self, address: &PeerAddress, before: PeerState) {
        if let Some(peer) = self.peers.get(address) {
            if peer.state() != before {
                self.events.push(SessionEvent::PeerState {
                    peer: address.clone(),
                    state: peer.state(),
                });
            }
        }
    }

    /// Refresh the published cursor if the caret moved. Returns true if a
    /// presence update is now pending.
    fn track_cursor(&mut self) -> bool {
        let anchor = self.binding.cursor_anchor(&self.store);
        let Some(presence) = self.presence.as_mut() else {
            return false;
        };
        if presence.cursor != Some(anchor) {
            presence.cursor = Some(anchor);
            self.cursor_dirty = true;
        }
        self.cursor_dirty
    }

    fn schedule_flush(&mut self, now: Instant) {
        if self.flush_deadline.is_none() {
            self.flush_deadline = Some(now + self.config.debounce());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn coordinator(replica: u64) -> SyncCoordinator {
        SyncCoordinator::new(
            SessionName::derive("codecollab", "doc", "secret"),
            SessionConfig::default(),
            ReplicaId(replica),
        )
    }

    fn sent(outbound: &[Outbound]) -> Vec<(&str, &str)> {
        outbound
            .iter()
            .filter_map(|action| match action {
                Outbound::Send { peer, message } => Some((peer.as_str(), message.kind())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_link_up_sends_hello_then_state_vector() {
        let mut c = coordinator(1);
        c.dial("b".into());
        assert_eq!(c.take_outbound(), vec![Outbound::Connect { peer: "b".into() }]);
        c.connect_succeeded(&"b".into());

        let out = c.take_outbound();
        assert_eq!(sent(&out), vec![("b", "hello"), ("b", "sync_step1")]);
        assert_eq!(c.peer(&"b".into()).unwrap().state(), PeerState::Syncing);
        assert!(c
            .drain_events()
            .contains(&SessionEvent::PeerState { peer: "b".into(), state: PeerState::Syncing }));
    }

    #[test]
    fn test_edits_are_debounced_and_batched() {
        let now = Instant::now();
        let mut c = coordinator(1);
        c.peer_joined("b".into());
        let hello = PeerMessage::Hello {
            channel: c.name().as_str().to_string(),
            replica: ReplicaId(2),
        };
        c.handle_message(&"b".into(), &hello.to_bytes().unwrap(), now).unwrap();
        let step1 = PeerMessage::SyncStep1 { state_vector: StateVector::new() };
        c.handle_message(&"b".into(), &step1.to_bytes().unwrap(), now).unwrap();
        c.take_outbound();

        c.local_insert(0, "a", now).unwrap();
        c.local_insert(1, "b", now).unwrap();
        assert_eq!(c.next_deadline(), Some(now + Duration::from_millis(30)));
        c.poll(now + Duration::from_millis(10));
        assert!(c.take_outbound().is_empty());

        c.poll(now + Duration::from_millis(30));
        let out = c.take_outbound();
        assert_eq!(out.len(), 1);
        let Outbound::Send { message: PeerMessage::Update { update }, .. } = &out[0] else {
            panic!("expected update, got {out:?}");
        };
        assert_eq!(codec::decode(update).unwrap().len(), 2);
        assert_eq!(c.next_deadline(), None);
    }

    #[test]
    fn test_batches_capped() {
        let now = Instant::now();
        let mut c = SyncCoordinator::new(
            SessionName::derive("codecollab", "doc", "secret"),
            SessionConfig {
                max_batch_ops: 3,
                ..SessionConfig::default()
            },
            ReplicaId(1),
        );
        c.peer_joined("b".into());
        let hello = PeerMessage::Hello {
            channel: c.name().as_str().to_string(),
            replica: ReplicaId(2),
        };
        c.handle_message(&"b".into(), &hello.to_bytes().unwrap(), now).unwrap();
        let step1 = PeerMessage::SyncStep1 { state_vector: StateVector::new() };
        c.handle_message(&"b".into(), &step1.to_bytes().unwrap(), now).unwrap();
        c.take_outbound();

        for (i, ch) in "abc".chars().enumerate() {
            c.local_insert(i, &ch.to_string(), now).unwrap();
        }
        // Cap reached: sent without waiting for the debounce window
        assert_eq!(sent(&c.take_outbound()), vec![("b", "update")]);
    }

    #[test]
    fn test_channel_mismatch_rejects_peer() {
        let now = Instant::now();
        let mut c = coordinator(1);
        c.peer_joined("mallory".into());
        c.take_outbound();

        let hello = PeerMessage::Hello {
            channel: "codecollab-doc-elsewhere".into(),
            replica: ReplicaId(9),
        };
        let result = c.handle_message(&"mallory".into(), &hello.to_bytes().unwrap(), now);
        assert!(matches!(result, Err(CollabError::ChannelMismatch { .. })));
        assert_eq!(
            c.take_outbound(),
            vec![Outbound::Disconnect { peer: "mallory".into() }]
        );

        // Nothing it sends afterwards is integrated
        let mut other = TextStore::new(ReplicaId(9));
        let op = other.apply_local_insert(0, "x").unwrap();
        let update = PeerMessage::Update { update: codec::encode(&[op]).unwrap() };
        c.handle_message(&"mallory".into(), &update.to_bytes().unwrap(), now).unwrap();
        assert_eq!(c.text(), "");
    }

    #[test]
    fn test_messages_before_hello_are_ignored() {
        let now = Instant::now();
        let mut c = coordinator(1);
        c.peer_joined("b".into());
        c.take_outbound();
        let step1 = PeerMessage::SyncStep1 { state_vector: StateVector::new() };
        c.handle_message(&"b".into(), &step1.to_bytes().unwrap(), now).unwrap();
        assert!(c.take_outbound().is_empty());
    }

    #[test]
    fn test_garbage_is_an_error_not_a_crash() {
        let mut c = coordinator(1);
        assert!(matches!(
            c.handle_message(&"b".into(), b"not json", Instant::now()),
            Err(CollabError::Codec(_))
        ));
    }

    #[test]
    fn test_dial_retries_with_backoff() {
        let now = Instant::now();
        let mut c = coordinator(1);
        c.dial("b".into());
        c.take_outbound();

        c.connect_failed(&"b".into(), &TransportError::Unreachable("b".into()), now);
        assert_eq!(c.peer(&"b".into()).unwrap().state(), PeerState::Reconnecting);
        let retry_at = now + Duration::from_millis(500);
        assert_eq!(c.next_deadline(), Some(retry_at));

        c.poll(retry_at);
        assert_eq!(c.take_outbound(), vec![Outbound::Connect { peer: "b".into() }]);
    }

    #[test]
    fn test_accepted_peer_not_redialed() {
        let now = Instant::now();
        let mut c = coordinator(1);
        c.peer_joined("b".into());
        c.peer_left(&"b".into(), now);
        assert_eq!(c.peer(&"b".into()).unwrap().state(), PeerState::Disconnected);
        assert_eq!(c.next_deadline(), None);
    }

    #[test]
    fn test_open_document_seeds_and_stays_clean() {
        let now = Instant::now();
        let mut c = coordinator(1);
        let snapshot = DocumentSnapshot::new("fn main() {}", StateVector::new());
        c.open_document(Some(&snapshot), now).unwrap();
        assert!(c.seed_pending());
        assert_eq!(c.text(), "fn main() {}");
        assert_eq!(c.next_deadline(), Some(now + c.config().seed_wait()));

        c.poll(now + c.config().seed_wait());
        assert!(!c.seed_pending());
        assert!(c.store().is_seeded());
        assert_eq!(c.text(), "fn main() {}");
        assert!(!c.is_dirty());

        c.local_insert(0, "// ", Instant::now()).unwrap();
        assert!(c.is_dirty());
        let snapshot = c.snapshot();
        c.mark_saved(&snapshot);
        assert!(!c.is_dirty());
    }

    /// Verify "b" on `c` and let "b" ask for a catch-up from scratch.
    fn exchange_with_b(c: &mut SyncCoordinator, now: Instant) {
        c.peer_joined("b".into());
        let hello = PeerMessage::Hello {
            channel: c.name().as_str().to_string(),
            replica: ReplicaId(2),
        };
        c.handle_message(&"b".into(), &hello.to_bytes().unwrap(), now).unwrap();
        let step1 = PeerMessage::SyncStep1 { state_vector: StateVector::new() };
        c.handle_message(&"b".into(), &step1.to_bytes().unwrap(), now).unwrap();
        c.take_outbound();
    }

    #[test]
    fn test_pending_seed_dropped_when_peer_holds_document() {
        let now = Instant::now();
        let mut c = coordinator(1);
        c.open_document(Some(&DocumentSnapshot::new("hello world", StateVector::new())), now)
            .unwrap();
        exchange_with_b(&mut c, now);

        let mut peer = TextStore::new(ReplicaId(2));
        peer.seed("hello").unwrap();
        peer.apply_local_insert(5, " world").unwrap();
        let step2 = PeerMessage::SyncStep2 {
            update: codec::diff_since(&peer, &StateVector::new()).unwrap(),
        };
        c.handle_message(&"b".into(), &step2.to_bytes().unwrap(), now).unwrap();

        assert!(!c.seed_pending());
        assert!(!c.store().is_seeded());
        assert_eq!(c.text(), "hello world");
        assert_eq!(c.store().state_vector(), peer.state_vector());
    }

    #[test]
    fn test_pending_seed_applied_and_sent_when_peer_is_empty() {
        let now = Instant::now();
        let mut c = coordinator(1);
        c.open_document(Some(&DocumentSnapshot::new("draft", StateVector::new())), now)
            .unwrap();
        exchange_with_b(&mut c, now);

        let step2 = PeerMessage::SyncStep2 {
            update: codec::encode(&[]).unwrap(),
        };
        c.handle_message(&"b".into(), &step2.to_bytes().unwrap(), now).unwrap();
        assert!(c.store().is_seeded());
        assert_eq!(c.store().render_visible_text(), "draft");

        c.poll(now + c.config().debounce());
        let out = c.take_outbound();
        let Some(Outbound::Send { message: PeerMessage::Update { update }, .. }) = out.first() else {
            panic!("expected update, got {out:?}");
        };
        assert_eq!(codec::decode(update).unwrap(), c.store().history().to_vec());
    }

    #[test]
    fn test_local_edit_commits_pending_seed() {
        let now = Instant::now();
        let mut c = coordinator(1);
        c.open_document(Some(&DocumentSnapshot::new("hello", StateVector::new())), now)
            .unwrap();
        c.local_insert(5, "!", now).unwrap();
        assert!(!c.seed_pending());
        assert_eq!(c.text(), "hello!");
    }

    #[test]
    fn test_presence_published_and_left() {
        let now = Instant::now();
        let mut c = coordinator(1);
        c.peer_joined("b".into());
        let hello = PeerMessage::Hello {
            channel: c.name().as_str().to_string(),
            replica: ReplicaId(2),
        };
        c.handle_message(&"b".into(), &hello.to_bytes().unwrap(), now).unwrap();
        c.take_outbound();

        c.set_presence(Presence::new("u1", "Ada", ReplicaId(1)));
        assert_eq!(sent(&c.take_outbound()), vec![("b", "awareness")]);

        c.leave();
        let out = c.take_outbound();
        let Outbound::Send { message: PeerMessage::Awareness { updates }, .. } = &out[0] else {
            panic!("expected awareness leave, got {out:?}");
        };
        assert_eq!(updates[0].state, None);
        assert_eq!(out[1], Outbound::Disconnect { peer: "b".into() });
    }

    #[test]
    fn test_tick_expires_remote_presence() {
        let now = Instant::now();
        let mut c = coordinator(1);
        c.peer_joined("b".into());
        let hello = PeerMessage::Hello {
            channel: c.name().as_str().to_string(),
            replica: ReplicaId(2),
        };
        c.handle_message(&"b".into(), &hello.to_bytes().unwrap(), now).unwrap();
        let awareness = PeerMessage::Awareness {
            updates: vec![AwarenessUpdate {
                replica: ReplicaId(2),
                clock: 1,
                state: Some(json!({"name": "Grace"})),
            }],
        };
        c.handle_message(&"b".into(), &awareness.to_bytes().unwrap(), now).unwrap();
        assert_eq!(c.awareness().get_states().len(), 1);
        c.drain_events();

        c.tick_at(now, current_timestamp_ms() + c.config().awareness_timeout_ms);
        assert!(c.awareness().get_states().is_empty());
        assert!(matches!(c.drain_events()[..], [SessionEvent::Awareness(_)]));
    }

    #[test]
    fn test_causal_gap_reported_once() {
        let now = Instant::now();
        let mut c = coordinator(1);
        c.peer_joined("b".into());
        let hello = PeerMessage::Hello {
            channel: c.name().as_str().to_string(),
            replica: ReplicaId(2),
        };
        c.handle_message(&"b".into(), &hello.to_bytes().unwrap(), now).unwrap();

        let mut author = TextStore::new(ReplicaId(2));
        author.apply_local_insert(0, "a").unwrap();
        let second = author.apply_local_insert(1, "b").unwrap();
        let update = PeerMessage::Update { update: codec::encode(&[second]).unwrap() };
        c.handle_message(&"b".into(), &update.to_bytes().unwrap(), now).unwrap();
        assert_eq!(c.buffered_len(), 1);
        c.drain_events();

        let later = now + c.config().causal_gap_warning();
        c.tick(later);
        assert!(matches!(c.drain_events()[..], [SessionEvent::CausalGap(_)]));
        c.tick(later + Duration::from_secs(1));
        assert!(c.drain_events().is_empty());
    }
}
