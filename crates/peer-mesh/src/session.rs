//! The session lifecycle actor.
//!
//! One task owns all mesh state. Transport notifications, timer expiries,
//! discovery results and commands from [`crate::MeshHandle`] are handled one
//! at a time, so handlers never race each other. Anything scheduled carries
//! the session generation or connection id it was armed for and is dropped
//! when that no longer matches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mesh_transport::{
    LinkEvent, SessionEvent, SignalingErrorKind, SignalingSession, TransportAdapter,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::broadcast::{self, MessageLog};
use crate::config::MeshConfig;
use crate::connections::ConnectionManager;
use crate::discovery::{select_candidates, DiscoveryGate, PeerDiscovery};
use crate::error::DiscoveryError;
use crate::handle::{Command, MeshSnapshot};
use crate::identity::generate_peer_id;
use crate::registry::ConnectionId;
use crate::task::TaskGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub(crate) enum Event {
    Signaling {
        generation: u64,
        event: SessionEvent,
    },
    Link {
        peer: String,
        conn: ConnectionId,
        event: LinkEvent,
    },
    Discovered {
        generation: u64,
        result: Result<Vec<String>, DiscoveryError>,
    },
    Timer(TimerEvent),
}

#[derive(Debug)]
pub(crate) enum TimerEvent {
    Reinitialize { generation: u64 },
    DisconnectGrace { generation: u64 },
    DiscoveryTick { generation: u64 },
    IdleRescan { generation: u64 },
    RefreshDiscovery { generation: u64 },
    StaggeredConnect { generation: u64, peer: String },
    PeerRetry { generation: u64, peer: String },
    ConnectTimeout { peer: String, conn: ConnectionId },
    Keepalive { peer: String, conn: ConnectionId },
}

/// Delay before the `attempt`-th automatic reinitialization:
/// `min(base * 2^attempt, cap)`.
pub fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(cap, |delay| delay.min(cap))
}

#[derive(Default)]
struct SessionTimers {
    reinitialize: Option<TaskGuard>,
    disconnect_grace: Option<TaskGuard>,
    discovery: Option<TaskGuard>,
    idle_rescan: Option<TaskGuard>,
    refresh: Option<TaskGuard>,
    stagger: Vec<TaskGuard>,
    peer_retries: HashMap<String, TaskGuard>,
}

impl SessionTimers {
    fn stop_discovery(&mut self) {
        self.discovery = None;
        self.idle_rescan = None;
        self.refresh = None;
        self.stagger.clear();
        self.peer_retries.clear();
    }
}

pub(crate) struct MeshSession {
    config: MeshConfig,
    adapter: Arc<dyn TransportAdapter>,
    discovery: Arc<dyn PeerDiscovery>,
    events: mpsc::UnboundedSender<Event>,
    snapshots: watch::Sender<MeshSnapshot>,
    connections: ConnectionManager,
    log: MessageLog,
    gate: DiscoveryGate,
    status: SessionStatus,
    local_id: Option<String>,
    session: Option<Arc<dyn SignalingSession>>,
    signaling_pump: Option<TaskGuard>,
    discovery_fetch: Option<TaskGuard>,
    timers: SessionTimers,
    generation: u64,
    reconnect_attempts: u32,
    terminal_failure: bool,
}

impl MeshSession {
    pub fn new(
        config: MeshConfig,
        adapter: Arc<dyn TransportAdapter>,
        discovery: Arc<dyn PeerDiscovery>,
        events: mpsc::UnboundedSender<Event>,
        snapshots: watch::Sender<MeshSnapshot>,
    ) -> Self {
        let connections = ConnectionManager::new(&config, events.clone());
        let gate = DiscoveryGate::new(config.discovery_throttle);
        Self {
            config,
            adapter,
            discovery,
            events,
            snapshots,
            connections,
            log: MessageLog::default(),
            gate,
            status: SessionStatus::Uninitialized,
            local_id: None,
            session: None,
            signaling_pump: None,
            discovery_fetch: None,
            timers: SessionTimers::default(),
            generation: 0,
            reconnect_attempts: 0,
            terminal_failure: false,
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        self.initialize();
        self.publish();
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { done }) => {
                        self.shutdown();
                        self.publish();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        self.publish();
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
            self.publish();
        }
        debug!("mesh session task finished");
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        let registry = self.connections.registry();
        MeshSnapshot {
            status: self.status,
            local_id: self.local_id.clone(),
            roster: registry.roster(),
            peers: registry.summaries(),
            log: self.log.entries().to_vec(),
            reconnect_attempts: self.reconnect_attempts,
            terminal_failure: self.terminal_failure,
            session_epoch: self.generation,
            keepalive_timers: registry.keepalive_count(),
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Broadcast { text, reply } => {
                let report = broadcast::broadcast(self.connections.registry(), &mut self.log, &text);
                let _ = reply.send(report);
            }
            Command::ConnectTo(peer) => self.connect_to(&peer, false),
            Command::ReconnectNow => self.reconnect_now(),
            Command::ForceRefresh => self.force_refresh(),
            Command::ClearLog => self.log.clear(),
            Command::Shutdown { done } => {
                self.shutdown();
                let _ = done.send(());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Signaling { generation, event } => {
                if generation == self.generation {
                    self.on_signaling(event);
                } else {
                    trace!(generation, "dropping notification from a previous session");
                }
            }
            Event::Link { peer, conn, event } => self.on_link(peer, conn, event),
            Event::Discovered { generation, result } => self.on_discovered(generation, result),
            Event::Timer(timer) => self.on_timer(timer),
        }
    }

    /// Tear down whatever exists and register a fresh identity.
    fn initialize(&mut self) {
        self.teardown();
        self.generation += 1;
        self.terminal_failure = false;
        self.status = SessionStatus::Connecting;
        let id = generate_peer_id();
        self.local_id = Some(id.clone());
        info!(local_id = %id, generation = self.generation, "initializing session");

        match self.adapter.create_session(&id, &self.config.session) {
            Ok(channel) => {
                self.session = Some(channel.session);
                self.signaling_pump = Some(self.spawn_signaling_pump(channel.events));
            }
            Err(err) => {
                warn!(local_id = %id, error = %err, "failed to create session");
                self.status = SessionStatus::Disconnected;
                self.schedule_backoff();
            }
        }
    }

    fn spawn_signaling_pump(&self, mut events: mpsc::UnboundedReceiver<SessionEvent>) -> TaskGuard {
        let tx = self.events.clone();
        let generation = self.generation;
        TaskGuard::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(Event::Signaling { generation, event }).is_err() {
                    break;
                }
            }
        })
    }

    /// Cancel every timer, close every connection and release the session.
    fn teardown(&mut self) {
        self.timers = SessionTimers::default();
        self.discovery_fetch = None;
        self.signaling_pump = None;
        let closed = self.connections.close_all();
        if let Some(session) = self.session.take() {
            debug!(local_id = session.id(), closed, "releasing session");
            session.destroy();
        }
    }

    pub fn shutdown(&mut self) {
        self.teardown();
        self.generation += 1;
        self.status = SessionStatus::Uninitialized;
        self.local_id = None;
        self.reconnect_attempts = 0;
        self.terminal_failure = false;
        info!("mesh session shut down");
    }

    fn reconnect_now(&mut self) {
        info!("manual reconnect requested");
        self.reconnect_attempts = 0;
        self.initialize();
    }

    fn force_refresh(&mut self) {
        let closed = self.connections.close_all();
        self.timers.stagger.clear();
        self.timers.peer_retries.clear();
        info!(closed, "cleared all connections");
        if self.status == SessionStatus::Connected {
            self.timers.refresh = Some(self.timer(
                self.config.force_refresh_delay,
                TimerEvent::RefreshDiscovery {
                    generation: self.generation,
                },
            ));
        }
    }

    fn schedule_backoff(&mut self) {
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            error!(
                attempts = self.reconnect_attempts,
                "giving up on the signaling service, reconnect manually"
            );
            self.terminal_failure = true;
            return;
        }
        self.reconnect_attempts += 1;
        let delay = reconnect_delay(
            self.reconnect_attempts,
            self.config.backoff_base,
            self.config.backoff_cap,
        );
        info!(
            attempt = self.reconnect_attempts,
            max = self.config.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.schedule_reinitialize(delay);
    }

    fn schedule_reinitialize(&mut self, delay: Duration) {
        self.timers.reinitialize = Some(self.timer(
            delay,
            TimerEvent::Reinitialize {
                generation: self.generation,
            },
        ));
    }

    fn timer(&self, delay: Duration, event: TimerEvent) -> TaskGuard {
        TaskGuard::after(delay, self.events.clone(), Event::Timer(event))
    }

    fn on_signaling(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Open { id } => {
                if self.local_id.as_deref() != Some(id.as_str()) {
                    warn!(id = %id, "session opened with an unexpected id");
                    return;
                }
                self.on_connected();
            }
            SessionEvent::Error { kind, message } => self.on_signaling_error(kind, &message),
            SessionEvent::Disconnected => {
                warn!("signaling link dropped, reconnecting in place");
                self.status = SessionStatus::Disconnected;
                self.timers.stop_discovery();
                if let Some(session) = &self.session {
                    session.reconnect();
                }
                self.timers.disconnect_grace = Some(self.timer(
                    self.config.disconnect_grace,
                    TimerEvent::DisconnectGrace {
                        generation: self.generation,
                    },
                ));
            }
            SessionEvent::Incoming(connection) => {
                let local_id = self.local_id.as_deref().unwrap_or_default();
                self.connections.handle_incoming(connection, local_id);
            }
        }
    }

    fn on_connected(&mut self) {
        info!(local_id = ?self.local_id, "connected to signaling service");
        self.status = SessionStatus::Connected;
        self.reconnect_attempts = 0;
        self.terminal_failure = false;
        self.timers.disconnect_grace = None;
        self.timers.reinitialize = None;

        let generation = self.generation;
        self.timers.discovery = Some(TaskGuard::every(
            self.config.discovery_interval,
            self.events.clone(),
            move || Event::Timer(TimerEvent::DiscoveryTick { generation }),
        ));
        self.timers.idle_rescan = self.config.idle_rescan_interval.map(|interval| {
            TaskGuard::every(interval, self.events.clone(), move || {
                Event::Timer(TimerEvent::IdleRescan { generation })
            })
        });
        self.run_discovery(true);
    }

    fn on_signaling_error(&mut self, kind: SignalingErrorKind, message: &str) {
        match kind {
            SignalingErrorKind::PeerUnavailable => {
                debug!(error = message, "peer unavailable");
            }
            SignalingErrorKind::IdConflict => {
                warn!(local_id = ?self.local_id, "identity conflict, picking a new id");
                self.timers.disconnect_grace = None;
                self.schedule_reinitialize(self.config.id_conflict_delay);
            }
            SignalingErrorKind::Disconnected
            | SignalingErrorKind::Network
            | SignalingErrorKind::ServerError => {
                warn!(%kind, error = message, "signaling failure");
                self.status = SessionStatus::Disconnected;
                self.timers.disconnect_grace = None;
                self.timers.stop_discovery();
                self.schedule_backoff();
            }
            SignalingErrorKind::Other => {
                warn!(%kind, error = message, "signaling error");
            }
        }
    }

    fn on_link(&mut self, peer: String, conn: ConnectionId, event: LinkEvent) {
        let local_id = self.local_id.as_deref().unwrap_or_default();
        let retry = self
            .connections
            .handle_link_event(&peer, conn, event, local_id, &mut self.log);
        if let Some(delay) = retry {
            if self.status == SessionStatus::Connected {
                debug!(peer = %peer, delay_ms = delay.as_millis() as u64, "scheduling peer retry");
                let timer = self.timer(
                    delay,
                    TimerEvent::PeerRetry {
                        generation: self.generation,
                        peer: peer.clone(),
                    },
                );
                self.timers.peer_retries.insert(peer, timer);
            }
        }
    }

    fn on_timer(&mut self, timer: TimerEvent) {
        let current = self.generation;
        match timer {
            TimerEvent::Reinitialize { generation } if generation == current => {
                self.initialize();
            }
            TimerEvent::DisconnectGrace { generation } if generation == current => {
                self.timers.disconnect_grace = None;
                if self.status == SessionStatus::Connected
                    || self.terminal_failure
                    || self.timers.reinitialize.is_some()
                {
                    return;
                }
                info!("in-place reconnect did not recover, reinitializing");
                self.schedule_backoff();
            }
            TimerEvent::DiscoveryTick { generation } if generation == current => {
                self.run_discovery(false);
            }
            TimerEvent::IdleRescan { generation } if generation == current => {
                if self.connections.registry().open_count() == 0 {
                    self.run_discovery(true);
                }
            }
            TimerEvent::RefreshDiscovery { generation } if generation == current => {
                self.timers.refresh = None;
                self.run_discovery(true);
            }
            TimerEvent::StaggeredConnect { generation, peer } if generation == current => {
                self.connect_to(&peer, false);
            }
            TimerEvent::PeerRetry { generation, peer } if generation == current => {
                self.timers.peer_retries.remove(&peer);
                self.connect_to(&peer, true);
            }
            TimerEvent::ConnectTimeout { peer, conn } => {
                self.connections.handle_timeout(&peer, conn);
            }
            TimerEvent::Keepalive { peer, conn } => {
                self.connections.handle_keepalive(&peer, conn);
            }
            stale => trace!(?stale, "dropping stale timer"),
        }
    }

    fn connect_to(&mut self, peer: &str, bypass_cooldown: bool) {
        if self.status != SessionStatus::Connected {
            debug!(peer, "not connected, skipping connection request");
            return;
        }
        let (Some(session), Some(local_id)) = (self.session.as_ref(), self.local_id.as_deref())
        else {
            return;
        };
        self.connections
            .connect_to_peer(session.as_ref(), local_id, peer, bypass_cooldown);
    }

    /// Start a discovery fetch unless one is already in flight. `force`
    /// bypasses the throttle.
    fn run_discovery(&mut self, force: bool) {
        if self.status != SessionStatus::Connected {
            return;
        }
        if self.discovery_fetch.is_some() {
            trace!("discovery already in flight");
            return;
        }
        let open = self.connections.registry().open_count();
        if !force && !self.gate.should_fetch(open) {
            trace!(open, "skipping discovery cycle");
            return;
        }
        let discovery = Arc::clone(&self.discovery);
        let tx = self.events.clone();
        let generation = self.generation;
        self.discovery_fetch = Some(TaskGuard::spawn(async move {
            let result = discovery.list_peers().await;
            let _ = tx.send(Event::Discovered { generation, result });
        }));
    }

    fn on_discovered(&mut self, generation: u64, result: Result<Vec<String>, DiscoveryError>) {
        if generation != self.generation {
            return;
        }
        self.discovery_fetch = None;
        if self.status != SessionStatus::Connected {
            return;
        }
        let peers = match result {
            Ok(peers) => peers,
            Err(err) => {
                warn!(error = %err, "discovery fetch failed, skipping cycle");
                return;
            }
        };
        let local_id = self.local_id.as_deref().unwrap_or_default();
        let candidates = select_candidates(
            &peers,
            local_id,
            self.connections.registry(),
            Instant::now(),
            self.connections.cooldown(),
        );
        debug!(
            fetched = peers.len(),
            candidates = candidates.len(),
            "discovery cycle"
        );

        self.timers.stagger.clear();
        let mut candidates = candidates.into_iter();
        if let Some(first) = candidates.next() {
            self.connect_to(&first, false);
        }
        for (index, peer) in candidates.enumerate() {
            let delay = self.config.discovery_stagger * (index as u32 + 1);
            let timer = self.timer(
                delay,
                TimerEvent::StaggeredConnect {
                    generation: self.generation,
                    peer,
                },
            );
            self.timers.stagger.push(timer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(10);
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| reconnect_delay(attempt, base, cap).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 10, 10, 10]);
        assert_eq!(reconnect_delay(0, base, cap), base);
        assert_eq!(reconnect_delay(64, base, cap), cap);
    }

    #[test]
    fn backoff_never_decreases() {
        let base = Duration::from_millis(250);
        let cap = Duration::from_secs(7);
        let delays: Vec<Duration> = (0..40).map(|a| reconnect_delay(a, base, cap)).collect();
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays.iter().all(|delay| *delay <= cap));
    }
}
