//! In-process transport for tests and single-process embedding.
//!
//! A [`MemoryNetwork`] is a hub that endpoints register with. Endpoints can be
//! taken offline to simulate network loss: every link they had is torn down
//! and both sides see [`TransportEvent::PeerLeft`].

use super::{EventReceiver, PeerAddress, Transport, TransportError, TransportEvent};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// A message that crossed the network, kept for inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub from: PeerAddress,
    pub to: PeerAddress,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<PeerAddress, mpsc::UnboundedSender<TransportEvent>>,
    /// Undirected links, stored with the smaller address first
    links: BTreeSet<(PeerAddress, PeerAddress)>,
    offline: HashSet<PeerAddress>,
    log: Vec<SentMessage>,
}

impl NetworkState {
    fn deliver(&mut self, to: &PeerAddress, event: TransportEvent) -> bool {
        let delivered = self
            .endpoints
            .get(to)
            .is_some_and(|tx| tx.send(event).is_ok());
        if !delivered {
            self.endpoints.remove(to);
        }
        delivered
    }

    fn linked(&self, a: &PeerAddress, b: &PeerAddress) -> bool {
        self.links.contains(&link_key(a, b))
    }
}

fn link_key(a: &PeerAddress, b: &PeerAddress) -> (PeerAddress, PeerAddress) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Shared in-memory network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint and return its transport and event stream.
    pub fn endpoint(&self, address: impl Into<PeerAddress>) -> (MemoryTransport, EventReceiver) {
        let address = address.into();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            state.endpoints.insert(address.clone(), tx);
            state.offline.remove(&address);
        }
        let transport = MemoryTransport {
            address,
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Take an endpoint offline (dropping all its links) or bring it back.
    pub fn set_online(&self, address: &PeerAddress, online: bool) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if online {
            state.offline.remove(address);
            return;
        }

        state.offline.insert(address.clone());
        let dropped: Vec<(PeerAddress, PeerAddress)> = state
            .links
            .iter()
            .filter(|(a, b)| a == address || b == address)
            .cloned()
            .collect();
        for (a, b) in dropped {
            state.links.remove(&(a.clone(), b.clone()));
            state.deliver(&a, TransportEvent::PeerLeft(b.clone()));
            state.deliver(&b, TransportEvent::PeerLeft(a));
        }
    }

    /// Whether `a` and `b` currently share a link.
    pub fn is_linked(&self, a: &PeerAddress, b: &PeerAddress) -> bool {
        self.state.lock().is_ok_and(|state| state.linked(a, b))
    }

    /// Every message sent so far.
    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.state
            .lock()
            .map(|state| state.log.clone())
            .unwrap_or_default()
    }

    pub fn clear_log(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.log.clear();
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, NetworkState>, TransportError> {
        self.state.lock().map_err(|_| TransportError::Closed)
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    address: PeerAddress,
    network: MemoryNetwork,
}

impl Transport for MemoryTransport {
    async fn connect(&self, peer: &PeerAddress) -> Result<(), TransportError> {
        let mut state = self.network.lock()?;
        if state.offline.contains(&self.address) || state.offline.contains(peer) {
            return Err(TransportError::Unreachable(peer.to_string()));
        }
        if state.linked(&self.address, peer) {
            return Ok(());
        }
        if !state.deliver(peer, TransportEvent::PeerJoined(self.address.clone())) {
            return Err(TransportError::Unreachable(peer.to_string()));
        }
        state.links.insert(link_key(&self.address, peer));
        Ok(())
    }

    async fn send(&self, peer: &PeerAddress, bytes: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.network.lock()?;
        if !state.linked(&self.address, peer) {
            return Err(TransportError::NotConnected(peer.to_string()));
        }
        state.log.push(SentMessage {
            from: self.address.clone(),
            to: peer.clone(),
            bytes: bytes.clone(),
        });
        let event = TransportEvent::Message {
            from: self.address.clone(),
            bytes,
        };
        if !state.deliver(peer, event) {
            return Err(TransportError::NotConnected(peer.to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self, peer: &PeerAddress) {
        if let Ok(mut state) = self.network.lock() {
            if state.links.remove(&link_key(&self.address, peer)) {
                state.deliver(peer, TransportEvent::PeerLeft(self.address.clone()));
            }
        }
    }

    fn local_address(&self) -> PeerAddress {
        self.address.clone()
    }
}
