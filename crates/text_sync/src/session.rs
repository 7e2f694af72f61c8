//! Document session: one tokio task per open document.
//!
//! The task owns a [`SyncCoordinator`] and is the only place it is touched.
//! Editor commands, transport events, connect results and timers are all
//! funnelled into one `select!` loop, so CRDT integration never races with
//! local edits. Callers talk to the task through a cloneable
//! [`SessionHandle`].

use crate::awareness::{Collaborator, Presence};
use crate::binding::{EditorEvent, EditorSink};
use crate::config::SessionConfig;
use crate::coordinator::{Outbound, SessionEvent, SyncCoordinator};
use crate::error::{CollabError, CollabResult};
use crate::peer::PeerState;
use crate::persistence::SnapshotStore;
use crate::protocol::SessionName;
use crate::replica::ReplicaId;
use crate::state_vector::StateVector;
use crate::transport::{EventReceiver, PeerAddress, Transport, TransportError, TransportEvent};
use std::future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Who is editing on this replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalIdentity {
    pub user_id: String,
    pub display_name: String,
}

impl LocalIdentity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }

    /// The presence payload this identity publishes.
    pub fn presence(&self, replica: ReplicaId) -> Presence {
        Presence::new(self.user_id.clone(), self.display_name.clone(), replica)
    }
}

/// Everything needed to open a document session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub document_id: String,
    /// Shared secret scoping the session channel
    pub secret: String,
    pub identity: LocalIdentity,
    pub config: SessionConfig,
    /// Fixed replica id; a random one is generated when absent
    pub replica: Option<ReplicaId>,
}

impl SessionOptions {
    pub fn new(
        document_id: impl Into<String>,
        secret: impl Into<String>,
        identity: LocalIdentity,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            secret: secret.into(),
            identity,
            config: SessionConfig::default(),
            replica: None,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_replica(mut self, replica: ReplicaId) -> Self {
        self.replica = Some(replica);
        self
    }
}

enum SessionCommand {
    Edit {
        event: EditorEvent,
        reply: oneshot::Sender<CollabResult<()>>,
    },
    SetPresence {
        presence: Presence,
    },
    Text {
        reply: oneshot::Sender<String>,
    },
    StateVector {
        reply: oneshot::Sender<StateVector>,
    },
    Connect {
        peer: PeerAddress,
    },
    Peers {
        reply: oneshot::Sender<Vec<(PeerAddress, PeerState)>>,
    },
    Collaborators {
        reply: oneshot::Sender<Vec<Collaborator>>,
    },
    Save {
        reply: oneshot::Sender<CollabResult<()>>,
    },
    AttachEditor {
        sink: Box<dyn EditorSink>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Entry point for opening sessions.
pub struct DocumentSession<T: Transport> {
    coordinator: SyncCoordinator,
    transport: Arc<T>,
    transport_events: EventReceiver,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    connect_tx: mpsc::UnboundedSender<(PeerAddress, Result<(), TransportError>)>,
    connect_rx: mpsc::UnboundedReceiver<(PeerAddress, Result<(), TransportError>)>,
    events: broadcast::Sender<SessionEvent>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl<T: Transport> DocumentSession<T> {
    /// Load the document from its snapshot and spawn the session task. Must
    /// be called from within a tokio runtime.
    pub fn open(
        options: SessionOptions,
        transport: T,
        transport_events: EventReceiver,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> CollabResult<SessionHandle> {
        options.config.validate()?;
        let replica = options.replica.unwrap_or_else(ReplicaId::generate);
        let name = SessionName::derive(
            &options.config.channel_prefix,
            &options.document_id,
            &options.secret,
        );

        let snapshot = snapshots.load_snapshot(&options.document_id)?;
        let mut coordinator = SyncCoordinator::new(name, options.config, replica);
        coordinator.open_document(snapshot.as_ref(), Instant::now())?;
        coordinator.set_presence(options.identity.presence(replica));
        coordinator.drain_events();

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let local_address = transport.local_address();

        tracing::info!(
            document = %options.document_id,
            %replica,
            address = %local_address,
            "opened document session"
        );

        let session = DocumentSession {
            coordinator,
            transport: Arc::new(transport),
            transport_events,
            commands,
            connect_tx,
            connect_rx,
            events: events.clone(),
            snapshots,
        };
        tokio::spawn(session.run());

        Ok(SessionHandle {
            commands: command_tx,
            events,
            document_id: options.document_id,
            replica,
            local_address,
            identity: options.identity,
        })
    }

    async fn run(mut self) {
        let mut tick = time::interval(self.coordinator.config().tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut checkpoint = self.coordinator.config().checkpoint_interval().map(|period| {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let deadline = self.coordinator.next_deadline();
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(SessionCommand::Shutdown { reply }) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command),
                        None => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                Some(event) = self.transport_events.recv() => {
                    self.handle_transport_event(event);
                }
                Some((peer, result)) = self.connect_rx.recv() => {
                    match result {
                        Ok(()) => self.coordinator.connect_succeeded(&peer),
                        Err(err) => self.coordinator.connect_failed(&peer, &err, Instant::now()),
                    }
                }
                _ = sleep_until(deadline) => {
                    self.coordinator.poll(Instant::now());
                }
                _ = tick.tick() => {
                    self.coordinator.tick(Instant::now());
                }
                _ = next_checkpoint(&mut checkpoint) => {
                    if self.coordinator.is_dirty() {
                        // Failures are reported as events; the edits stay in memory
                        let _ = self.save();
                    }
                }
            }
            self.dispatch().await;
        }

        tracing::info!(document = %self.coordinator.name().document_id(), "session closed");
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Edit { event, reply } => {
                let _ = reply.send(self.coordinator.local_edit(event, Instant::now()));
            }
            SessionCommand::SetPresence { presence } => self.coordinator.set_presence(presence),
            SessionCommand::Text { reply } => {
                let _ = reply.send(self.coordinator.text());
            }
            SessionCommand::StateVector { reply } => {
                let _ = reply.send(self.coordinator.store().state_vector().clone());
            }
            SessionCommand::Connect { peer } => self.coordinator.dial(peer),
            SessionCommand::Peers { reply } => {
                let _ = reply.send(self.coordinator.peer_states());
            }
            SessionCommand::Collaborators { reply } => {
                let _ = reply.send(self.coordinator.awareness().collaborators());
            }
            SessionCommand::Save { reply } => {
                let _ = reply.send(self.save());
            }
            SessionCommand::AttachEditor { sink } => {
                let (binding, store) = self.coordinator.binding_mut();
                binding.attach(sink, store);
            }
            SessionCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerJoined(peer) => self.coordinator.peer_joined(peer),
            TransportEvent::PeerLeft(peer) => self.coordinator.peer_left(&peer, Instant::now()),
            TransportEvent::Message { from, bytes } => {
                if let Err(err) = self.coordinator.handle_message(&from, &bytes, Instant::now()) {
                    tracing::warn!(peer = %from, error = %err, "dropped message");
                }
            }
        }
    }

    fn save(&mut self) -> CollabResult<()> {
        let snapshot = self.coordinator.snapshot();
        let document_id = self.coordinator.name().document_id().to_string();
        match self.snapshots.save_snapshot(&document_id, &snapshot) {
            Ok(()) => {
                tracing::debug!(document = %document_id, chars = snapshot.content.chars().count(), "saved snapshot");
                self.coordinator.mark_saved(&snapshot);
                Ok(())
            }
            Err(err) => {
                let err = CollabError::from(err);
                self.coordinator.save_failed(err.clone());
                Err(err)
            }
        }
    }

    async fn shutdown(&mut self) {
        self.coordinator.leave();
        self.dispatch().await;
    }

    /// Hand queued actions to the transport and publish queued events.
    async fn dispatch(&mut self) {
        for action in self.coordinator.take_outbound() {
            match action {
                Outbound::Send { peer, message } => {
                    let bytes = match message.to_bytes() {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to encode message");
                            continue;
                        }
                    };
                    if let Err(err) = self.transport.send(&peer, bytes).await {
                        // Link loss arrives separately as PeerLeft
                        tracing::debug!(peer = %peer, kind = message.kind(), error = %err, "send failed");
                    }
                }
                Outbound::Connect { peer } => {
                    let transport = Arc::clone(&self.transport);
                    let results = self.connect_tx.clone();
                    tokio::spawn(async move {
                        let result = transport.connect(&peer).await;
                        let _ = results.send((peer, result));
                    });
                }
                Outbound::Disconnect { peer } => self.transport.disconnect(&peer).await,
            }
        }

        for event in self.coordinator.drain_events() {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn next_checkpoint(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

/// Cloneable handle to a running document session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    document_id: String,
    replica: ReplicaId,
    local_address: PeerAddress,
    identity: LocalIdentity,
}

impl SessionHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn local_address(&self) -> &PeerAddress {
        &self.local_address
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Receive session events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn insert(&self, offset: usize, text: impl Into<String>) -> CollabResult<()> {
        self.editor_event(EditorEvent::Insert {
            offset,
            text: text.into(),
        })
        .await
    }

    pub async fn delete(&self, start: usize, end: usize) -> CollabResult<()> {
        self.editor_event(EditorEvent::Delete { start, end }).await
    }

    /// Apply a mutation reported by an attached editor.
    pub async fn editor_event(&self, event: EditorEvent) -> CollabResult<()> {
        self.request(|reply| SessionCommand::Edit { event, reply })
            .await?
    }

    pub fn set_presence(&self, presence: Presence) -> CollabResult<()> {
        self.command(SessionCommand::SetPresence { presence })
    }

    /// Current visible text.
    pub async fn text(&self) -> CollabResult<String> {
        self.request(|reply| SessionCommand::Text { reply }).await
    }

    pub async fn state_vector(&self) -> CollabResult<StateVector> {
        self.request(|reply| SessionCommand::StateVector { reply })
            .await
    }

    /// Start connecting to a peer. Progress is reported as
    /// [`SessionEvent::PeerState`] events.
    pub fn connect(&self, peer: impl Into<PeerAddress>) -> CollabResult<()> {
        self.command(SessionCommand::Connect { peer: peer.into() })
    }

    pub async fn peers(&self) -> CollabResult<Vec<(PeerAddress, PeerState)>> {
        self.request(|reply| SessionCommand::Peers { reply }).await
    }

    /// Remote participants currently present.
    pub async fn collaborators(&self) -> CollabResult<Vec<Collaborator>> {
        self.request(|reply| SessionCommand::Collaborators { reply })
            .await
    }

    /// Persist the current text. On failure the document stays dirty.
    pub async fn save(&self) -> CollabResult<()> {
        self.request(|reply| SessionCommand::Save { reply }).await?
    }

    /// Bind an editor widget; it receives the current text right away.
    pub fn attach_editor(&self, sink: Box<dyn EditorSink>) -> CollabResult<()> {
        self.command(SessionCommand::AttachEditor { sink })
    }

    /// Flush pending edits, announce departure and stop the session task.
    pub async fn shutdown(&self) -> CollabResult<()> {
        self.request(|reply| SessionCommand::Shutdown { reply }).await
    }

    fn command(&self, command: SessionCommand) -> CollabResult<()> {
        self.commands
            .send(command)
            .map_err(|_| CollabError::SessionClosed)
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> SessionCommand,
    ) -> CollabResult<R> {
        let (reply, response) = oneshot::channel();
        self.command(make(reply))?;
        response.await.map_err(|_| CollabError::SessionClosed)
    }
}
