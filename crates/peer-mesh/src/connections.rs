use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use mesh_transport::{
    ConnectOptions, Connection, LinkEvent, PeerLink, SignalingSession, TransportError,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::broadcast::{self, MessageLog, KEEPALIVE_PAYLOAD};
use crate::config::{MeshConfig, PlatformProfile};
use crate::registry::{ConnectionId, ConnectionRegistry, Direction, Phase};
use crate::session::{Event, TimerEvent};
use crate::task::TaskGuard;

/// What a connection request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnectOutcome {
    Started(ConnectionId),
    SelfTarget,
    AlreadyOpen,
    Pending,
    CoolingDown,
    Failed(TransportError),
}

/// Owns the connection registry and every per-connection timer.
pub(crate) struct ConnectionManager {
    registry: ConnectionRegistry,
    events: mpsc::UnboundedSender<Event>,
    profile: PlatformProfile,
    cooldown: Duration,
    connect_timeout: Duration,
    keepalive_interval: Option<Duration>,
    retry_after_close: Option<Duration>,
    retry_after_error: Option<Duration>,
}

impl ConnectionManager {
    pub fn new(config: &MeshConfig, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            events,
            profile: config.profile,
            cooldown: config.cooldown,
            connect_timeout: config.connect_timeout,
            keepalive_interval: config.keepalive_interval,
            retry_after_close: config.retry_after_close,
            retry_after_error: config.retry_after_error,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn connect_to_peer(
        &mut self,
        session: &dyn SignalingSession,
        local_id: &str,
        peer_id: &str,
        bypass_cooldown: bool,
    ) -> ConnectOutcome {
        let now = Instant::now();
        if peer_id == local_id {
            return ConnectOutcome::SelfTarget;
        }
        if self.registry.is_open(peer_id) {
            return ConnectOutcome::AlreadyOpen;
        }
        if self.registry.is_pending(peer_id) {
            return ConnectOutcome::Pending;
        }
        if !bypass_cooldown && self.registry.in_cooldown(peer_id, now, self.cooldown) {
            trace!(peer = peer_id, "peer still cooling down");
            return ConnectOutcome::CoolingDown;
        }

        let options = ConnectOptions::default()
            .with_metadata("platform", self.profile.as_str())
            .with_metadata("peer_id", local_id)
            .with_metadata("timestamp", unix_millis().to_string());
        let connection = match session.connect(peer_id, options) {
            Ok(connection) => connection,
            Err(err) => {
                warn!(peer = peer_id, error = %err, "failed to request connection");
                return ConnectOutcome::Failed(err);
            }
        };
        info!(peer = peer_id, "initiating connection");

        let (link, events) = connection.into_parts();
        let (conn, displaced) = self.registry.begin_attempt(peer_id, link, now);
        if let Some(old) = displaced {
            old.close();
        }
        self.install(peer_id, conn, events);
        ConnectOutcome::Started(conn)
    }

    /// Accept a connection opened by a remote peer. When both sides dialed
    /// each other, the connection initiated by the smaller id survives.
    pub fn handle_incoming(&mut self, connection: Connection, local_id: &str) -> Option<ConnectionId> {
        let (link, events) = connection.into_parts();
        let peer_id = link.peer_id().to_string();
        let glare = self.registry.get(&peer_id).is_some_and(|record| {
            record.direction() == Direction::Outbound
                && matches!(record.phase(), Phase::Attempting | Phase::Open)
        });
        if glare && local_id < peer_id.as_str() {
            debug!(peer = %peer_id, "keeping our outbound connection, closing inbound duplicate");
            link.close();
            return None;
        }

        info!(peer = %peer_id, "incoming connection");
        let (conn, displaced) = self.registry.accept_incoming(&peer_id, link);
        if let Some(old) = displaced {
            old.close();
        }
        self.install(&peer_id, conn, events);
        Some(conn)
    }

    /// Attach the handler set for a fresh connection: its event pump and its
    /// connect timeout. Both replace whatever the record held before.
    fn install(
        &mut self,
        peer_id: &str,
        conn: ConnectionId,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let tx = self.events.clone();
        let peer = peer_id.to_string();
        let pump = TaskGuard::spawn(async move {
            while let Some(event) = events.recv().await {
                let last = matches!(event, LinkEvent::Close | LinkEvent::Error(_));
                let forwarded = tx.send(Event::Link {
                    peer: peer.clone(),
                    conn,
                    event,
                });
                if forwarded.is_err() || last {
                    break;
                }
            }
        });
        self.registry.attach_pump(peer_id, conn, pump);

        let timeout = TaskGuard::after(
            self.connect_timeout,
            self.events.clone(),
            Event::Timer(TimerEvent::ConnectTimeout {
                peer: peer_id.to_string(),
                conn,
            }),
        );
        self.registry.arm_timeout(peer_id, conn, timeout);
    }

    /// Apply one transport notification. Returns the delay after which the
    /// peer should be redialed, if the profile asks for that.
    pub fn handle_link_event(
        &mut self,
        peer_id: &str,
        conn: ConnectionId,
        event: LinkEvent,
        local_id: &str,
        log: &mut MessageLog,
    ) -> Option<Duration> {
        match event {
            LinkEvent::Open => {
                self.on_open(peer_id, conn, local_id);
                None
            }
            LinkEvent::Data(payload) => {
                if self.registry.is_current(peer_id, conn) {
                    broadcast::receive(log, peer_id, &payload);
                } else {
                    trace!(peer = peer_id, "dropping data from superseded connection");
                }
                None
            }
            LinkEvent::Close => {
                let previous = self.registry.mark_closed(peer_id, conn)?;
                info!(peer = peer_id, ?previous, "connection closed");
                self.retry_after_close
            }
            LinkEvent::Error(message) => {
                let previous = self.registry.mark_errored(peer_id, conn, &message)?;
                warn!(peer = peer_id, ?previous, error = %message, "connection error");
                self.retry_after_error
            }
        }
    }

    fn on_open(&mut self, peer_id: &str, conn: ConnectionId, local_id: &str) {
        let Some(link) = self.registry.mark_open(peer_id, conn) else {
            return;
        };
        let remote_platform = link
            .metadata()
            .get("platform")
            .map(String::as_str)
            .unwrap_or("unknown");
        info!(peer = peer_id, remote_platform, "connection open");

        let greeting = format!("Hello from {local_id} ({})!", self.profile);
        if let Err(err) = link.send(Bytes::from(greeting)) {
            warn!(peer = peer_id, error = %err, "failed to send greeting");
        }

        if let Some(interval) = self.keepalive_interval {
            let peer = peer_id.to_string();
            let timer = TaskGuard::every(interval, self.events.clone(), move || {
                Event::Timer(TimerEvent::Keepalive {
                    peer: peer.clone(),
                    conn,
                })
            });
            self.registry.set_keepalive(peer_id, conn, timer);
        }
    }

    /// Give up on an attempt that never opened. No retry is scheduled; the
    /// peer becomes eligible again once its cooldown elapses.
    pub fn handle_timeout(&mut self, peer_id: &str, conn: ConnectionId) {
        if let Some(pending) = self
            .registry
            .downgrade_to_cooldown(peer_id, conn, Instant::now())
        {
            info!(
                peer = peer_id,
                timeout_ms = self.connect_timeout.as_millis() as u64,
                "connection attempt timed out"
            );
            pending.close();
        }
    }

    pub fn handle_keepalive(&mut self, peer_id: &str, conn: ConnectionId) {
        if !self.registry.is_current(peer_id, conn) {
            return;
        }
        let sent = match self.registry.live_link(peer_id, conn) {
            Some(link) if link.is_open() => link
                .send(Bytes::from_static(KEEPALIVE_PAYLOAD))
                .map_err(|err| warn!(peer = peer_id, error = %err, "keepalive send failed"))
                .is_ok(),
            _ => false,
        };
        if sent {
            trace!(peer = peer_id, "keepalive sent");
        } else {
            self.registry.cancel_keepalive(peer_id);
        }
    }

    /// Close every held connection and forget all records, history included.
    pub fn close_all(&mut self) -> usize {
        let links: Vec<(String, Arc<dyn PeerLink>)> = self.registry.clear();
        for (peer, link) in &links {
            debug!(peer = %peer, "closing connection");
            link.close();
        }
        links.len()
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}
