//! Per-peer connection state.
//!
//! ```text
//! Disconnected -> Connecting -> Syncing -> Synced
//!                     |            ^         |
//!                     v            |         v
//!                  Reconnecting ---+---- (link lost)
//!                     |
//!                     v  (attempts exhausted)
//!                  Disconnected
//! ```

use crate::config::BackoffConfig;
use crate::replica::ReplicaId;
use crate::state_vector::StateVector;
use crate::transport::PeerAddress;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Connection status of one peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// No link and no retries scheduled
    #[default]
    Disconnected,
    /// First dial in progress
    Connecting,
    /// Link up, state vectors being exchanged
    Syncing,
    /// Caught up; live updates flowing
    Synced,
    /// Link lost, retrying with backoff
    Reconnecting,
}

impl PeerState {
    /// Whether a transport link is currently up.
    pub fn is_linked(&self) -> bool {
        matches!(self, PeerState::Syncing | PeerState::Synced)
    }
}

/// Which side opened the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerOrigin {
    Dialed,
    Accepted,
}

/// Bookkeeping for one remote peer.
#[derive(Clone, Debug)]
pub struct PeerConnection {
    address: PeerAddress,
    origin: PeerOrigin,
    state: PeerState,
    replica: Option<ReplicaId>,
    /// Hello accepted on the current link
    verified: bool,
    /// Announced a different channel; ignored from then on
    rejected: bool,
    /// Their sync request was answered on the current link, so live
    /// updates can follow
    streaming: bool,
    /// What the peer is known to have; kept across disconnects
    last_known_state: StateVector,
    attempts: u32,
    retry_at: Option<Instant>,
    connect_in_flight: bool,
}

impl PeerConnection {
    pub fn new(address: PeerAddress, origin: PeerOrigin) -> Self {
        Self {
            address,
            origin,
            state: PeerState::Disconnected,
            replica: None,
            verified: false,
            rejected: false,
            streaming: false,
            last_known_state: StateVector::new(),
            attempts: 0,
            retry_at: None,
            connect_in_flight: false,
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn origin(&self) -> PeerOrigin {
        self.origin
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn replica(&self) -> Option<ReplicaId> {
        self.replica
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn last_known_state(&self) -> &StateVector {
        &self.last_known_state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Start a dial. Returns false if one is pointless or already running.
    pub fn begin_dial(&mut self) -> bool {
        if self.rejected || self.connect_in_flight {
            return false;
        }
        match self.state {
            PeerState::Disconnected => {
                self.state = PeerState::Connecting;
                self.connect_in_flight = true;
                true
            }
            PeerState::Reconnecting => {
                self.connect_in_flight = true;
                self.retry_at = None;
                true
            }
            _ => false,
        }
    }

    /// A link came up (dialed or accepted). Returns false if one already was.
    pub fn link_up(&mut self) -> bool {
        self.connect_in_flight = false;
        if self.rejected || self.state.is_linked() {
            return false;
        }
        self.state = PeerState::Syncing;
        self.attempts = 0;
        self.retry_at = None;
        self.verified = false;
        self.streaming = false;
        true
    }

    /// The link dropped; schedule the first retry.
    pub fn link_down(&mut self, now: Instant, backoff: &BackoffConfig) -> bool {
        if !self.state.is_linked() {
            return false;
        }
        self.state = PeerState::Reconnecting;
        self.attempts = 0;
        self.retry_at = Some(now + backoff.delay_for(0));
        self.verified = false;
        self.streaming = false;
        true
    }

    /// A dial failed; back off or give up.
    pub fn connect_failed(&mut self, now: Instant, backoff: &BackoffConfig) {
        self.connect_in_flight = false;
        if self.state.is_linked() {
            return;
        }
        self.attempts += 1;
        if self.attempts >= backoff.max_attempts {
            self.state = PeerState::Disconnected;
            self.retry_at = None;
        } else {
            self.state = PeerState::Reconnecting;
            self.retry_at = Some(now + backoff.delay_for(self.attempts));
        }
    }

    /// Whether a scheduled retry should fire now.
    pub fn retry_due(&self, now: Instant) -> bool {
        self.state == PeerState::Reconnecting
            && !self.connect_in_flight
            && self.retry_at.is_some_and(|at| at <= now)
    }

    /// Hello accepted.
    pub fn verify(&mut self, replica: ReplicaId) {
        self.replica = Some(replica);
        self.verified = true;
    }

    /// Hello named another channel.
    pub fn reject(&mut self) {
        self.rejected = true;
        self.verified = false;
        self.streaming = false;
        self.state = PeerState::Disconnected;
        self.retry_at = None;
    }

    /// Their sync request was answered.
    pub fn start_streaming(&mut self) {
        self.streaming = true;
    }

    /// Our sync request was answered. Returns true on the transition.
    pub fn mark_synced(&mut self) -> bool {
        if self.state == PeerState::Syncing {
            self.state = PeerState::Synced;
            true
        } else {
            false
        }
    }

    /// Record the state the peer reports holding.
    ///
    /// Returns `false` if the peer reports less than it held before, which
    /// happens when it restarted without its snapshot.
    pub fn observe_state(&mut self, state: &StateVector) -> bool {
        let kept = state.dominates(&self.last_known_state);
        self.last_known_state = state.clone();
        kept
    }

    /// Stop tracking the link without scheduling retries.
    pub fn close(&mut self) {
        self.state = PeerState::Disconnected;
        self.retry_at = None;
        self.verified = false;
        self.streaming = false;
        self.connect_in_flight = false;
    }
}
