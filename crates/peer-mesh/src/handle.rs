use std::sync::Arc;

use mesh_transport::TransportAdapter;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::broadcast::{BroadcastReport, LogEntry};
use crate::config::MeshConfig;
use crate::discovery::PeerDiscovery;
use crate::error::MeshError;
use crate::registry::PeerSummary;
use crate::session::{MeshSession, SessionStatus};

/// Everything the presentation layer renders, republished after every
/// handled event.
#[derive(Debug, Clone, Serialize)]
pub struct MeshSnapshot {
    pub status: SessionStatus,
    pub local_id: Option<String>,
    /// Open peers in the order they opened.
    pub roster: Vec<String>,
    pub peers: Vec<PeerSummary>,
    pub log: Vec<LogEntry>,
    pub reconnect_attempts: u32,
    /// Automatic reconnection gave up; only a manual reconnect recovers.
    pub terminal_failure: bool,
    pub session_epoch: u64,
    pub keepalive_timers: usize,
}

impl MeshSnapshot {
    fn initial() -> Self {
        Self {
            status: SessionStatus::Uninitialized,
            local_id: None,
            roster: Vec::new(),
            peers: Vec::new(),
            log: Vec::new(),
            reconnect_attempts: 0,
            terminal_failure: false,
            session_epoch: 0,
            keepalive_timers: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.roster.iter().any(|peer| peer == peer_id)
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Broadcast {
        text: String,
        reply: oneshot::Sender<Option<BroadcastReport>>,
    },
    ConnectTo(String),
    ReconnectNow,
    ForceRefresh,
    ClearLog,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running mesh session. The session shuts down once
/// every handle is dropped.
#[derive(Debug, Clone)]
pub struct MeshHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<MeshSnapshot>,
}

impl MeshHandle {
    /// Start a session task on the current runtime and begin initializing.
    pub fn spawn(
        config: MeshConfig,
        adapter: Arc<dyn TransportAdapter>,
        discovery: Arc<dyn PeerDiscovery>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(MeshSnapshot::initial());
        let session = MeshSession::new(config, adapter, discovery, event_tx, snapshot_tx);
        tokio::spawn(session.run(command_rx, event_rx));
        Self {
            commands: command_tx,
            snapshots: snapshot_rx,
        }
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MeshSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<MeshSnapshot, MeshError>
    where
        F: FnMut(&MeshSnapshot) -> bool,
    {
        let mut snapshots = self.snapshots.clone();
        let snapshot = snapshots
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| MeshError::Stopped)?
            .clone();
        Ok(snapshot)
    }

    /// Broadcast `text` to every open peer. `None` means the text was blank
    /// and nothing was sent.
    pub async fn send_broadcast(
        &self,
        text: impl Into<String>,
    ) -> Result<Option<BroadcastReport>, MeshError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Broadcast {
            text: text.into(),
            reply,
        })?;
        response.await.map_err(|_| MeshError::Stopped)
    }

    pub fn connect_to(&self, peer_id: impl Into<String>) -> Result<(), MeshError> {
        self.send(Command::ConnectTo(peer_id.into()))
    }

    pub fn reconnect_now(&self) -> Result<(), MeshError> {
        self.send(Command::ReconnectNow)
    }

    pub fn force_refresh(&self) -> Result<(), MeshError> {
        self.send(Command::ForceRefresh)
    }

    pub fn clear_log(&self) -> Result<(), MeshError> {
        self.send(Command::ClearLog)
    }

    /// Close every connection, release the session and stop the task.
    pub async fn shutdown(&self) -> Result<(), MeshError> {
        let (done, finished) = oneshot::channel();
        self.send(Command::Shutdown { done })?;
        finished.await.map_err(|_| MeshError::Stopped)
    }

    fn send(&self, command: Command) -> Result<(), MeshError> {
        self.commands.send(command).map_err(|_| MeshError::Stopped)
    }
}
