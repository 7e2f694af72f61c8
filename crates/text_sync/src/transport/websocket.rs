//! WebSocket transport.
//!
//! Every endpoint both listens and dials. Each link is one WebSocket whose
//! binary frames carry session messages; a forwarder task drains a
//! per-link channel into the socket so `send` never blocks the session.

use super::{EventReceiver, PeerAddress, Transport, TransportError, TransportEvent};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};

type LinkMap = Arc<Mutex<HashMap<PeerAddress, mpsc::UnboundedSender<Message>>>>;

/// Transport over WebSockets.
pub struct WebSocketTransport {
    local: PeerAddress,
    links: LinkMap,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketTransport {
    /// Listen on `bind_addr` (e.g. `127.0.0.1:9001`) and start accepting links.
    pub async fn bind(bind_addr: &str) -> Result<(Self, EventReceiver), TransportError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local = PeerAddress::new(format!("ws://{}", listener.local_addr()?));
        tracing::info!("Sync transport listening on {}", local);

        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let transport = Self {
            local,
            links: Arc::new(Mutex::new(HashMap::new())),
            events,
            shutdown_tx,
        };

        let links = Arc::clone(&transport.links);
        let events = transport.events.clone();
        let mut shutdown_rx = transport.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let links = Arc::clone(&links);
                                let events = events.clone();
                                tokio::spawn(async move {
                                    match accept_async(stream).await {
                                        Ok(ws) => {
                                            let peer = PeerAddress::new(format!("ws://{addr}"));
                                            register_link(ws, peer.clone(), &links, &events);
                                            let _ = events.send(TransportEvent::PeerJoined(peer));
                                        }
                                        Err(e) => {
                                            tracing::warn!("WebSocket handshake failed for {}: {}", addr, e);
                                        }
                                    }
                                });
                            }
                            Err(e) => tracing::error!("Failed to accept connection: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Sync transport listener shutting down");
                        break;
                    }
                }
            }
        });

        Ok((transport, events_rx))
    }

    /// Stop accepting links and close the open ones.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Ok(mut links) = self.links.lock() {
            links.clear();
        }
    }
}

/// Spawn the reader and writer tasks of one link and record it.
fn register_link<S>(
    ws: WebSocketStream<S>,
    peer: PeerAddress,
    links: &LinkMap,
    events: &mpsc::UnboundedSender<TransportEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<Message>();
    if let Ok(mut map) = links.lock() {
        map.insert(peer.clone(), msg_tx);
    }

    // Outgoing forwarder; ends when the link is dropped from the map
    tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let links = Arc::clone(links);
    let events = events.clone();
    tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Binary(bytes)) => {
                    let _ = events.send(TransportEvent::Message {
                        from: peer.clone(),
                        bytes,
                    });
                }
                Ok(Message::Text(text)) => {
                    let _ = events.send(TransportEvent::Message {
                        from: peer.clone(),
                        bytes: text.into_bytes(),
                    });
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("WebSocket error for {}: {}", peer, e);
                    break;
                }
            }
        }

        if let Ok(mut map) = links.lock() {
            map.remove(&peer);
        }
        tracing::debug!("Link to {} closed", peer);
        let _ = events.send(TransportEvent::PeerLeft(peer));
    });
}

impl Transport for WebSocketTransport {
    async fn connect(&self, peer: &PeerAddress) -> Result<(), TransportError> {
        let already_linked = self
            .links
            .lock()
            .map_err(|_| TransportError::Closed)?
            .contains_key(peer);
        if already_linked {
            return Ok(());
        }

        let (ws, _response) = connect_async(peer.as_str())
            .await
            .map_err(|e| TransportError::Unreachable(format!("{peer}: {e}")))?;
        register_link(ws, peer.clone(), &self.links, &self.events);
        tracing::debug!("Dialed {}", peer);
        Ok(())
    }

    async fn send(&self, peer: &PeerAddress, bytes: Vec<u8>) -> Result<(), TransportError> {
        let links = self.links.lock().map_err(|_| TransportError::Closed)?;
        let link = links
            .get(peer)
            .ok_or_else(|| TransportError::NotConnected(peer.to_string()))?;
        link.send(Message::Binary(bytes))
            .map_err(|_| TransportError::NotConnected(peer.to_string()))
    }

    async fn disconnect(&self, peer: &PeerAddress) {
        if let Ok(mut links) = self.links.lock() {
            links.remove(peer);
        }
    }

    fn local_address(&self) -> PeerAddress {
        self.local.clone()
    }
}
