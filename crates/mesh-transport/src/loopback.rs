//! In-process signaling hub. Every session and link lives in one shared
//! table, which makes it usable both as a local demo network and as a fault
//! injecting fixture for mesh tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    ConnectOptions, Connection, LinkEvent, PeerLink, SessionEvent, SessionOptions,
    SignalingChannel, SignalingErrorKind, SignalingSession, TransportAdapter, TransportError,
    TransportResult,
};

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub id: String,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub from: String,
    pub to: String,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub from: String,
    pub to: String,
    pub payload: Bytes,
}

struct SessionSlot {
    instance: u64,
    open: bool,
    events: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Default)]
struct NetworkState {
    sessions: HashMap<String, SessionSlot>,
    order: Vec<String>,
    next_instance: u64,
    next_link: u64,
    links: HashMap<u64, Arc<LinkPair>>,
    scripted_failures: VecDeque<(SignalingErrorKind, String)>,
    unreachable: HashSet<String>,
    reconnect_blocked: bool,
    discovery_outage: bool,
    discovery_requests: usize,
    session_requests: Vec<SessionRequest>,
    connect_attempts: Vec<ConnectAttempt>,
    frames: Vec<Frame>,
}

impl NetworkState {
    fn take_links_between(&mut self, a: &str, b: &str) -> Vec<Arc<LinkPair>> {
        let ids: Vec<u64> = self
            .links
            .iter()
            .filter(|(_, pair)| pair.joins(a, b))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.links.remove(&id))
            .collect()
    }

    fn take_links_of(&mut self, owner: &str) -> Vec<Arc<LinkPair>> {
        let ids: Vec<u64> = self
            .links
            .iter()
            .filter(|(_, pair)| pair.ends.iter().any(|end| end.owner == owner))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.links.remove(&id))
            .collect()
    }
}

struct LinkEnd {
    owner: String,
    events: mpsc::UnboundedSender<LinkEvent>,
}

struct LinkPair {
    id: u64,
    ends: [LinkEnd; 2],
    open: AtomicBool,
    closed: AtomicBool,
}

impl LinkPair {
    fn joins(&self, a: &str, b: &str) -> bool {
        let (x, y) = (&self.ends[0].owner, &self.ends[1].owner);
        (x == a && y == b) || (x == b && y == a)
    }

    fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        for end in &self.ends {
            let _ = end.events.send(LinkEvent::Open);
        }
    }

    /// Returns false if the pair was already shut down.
    fn shutdown(&self, event: LinkEvent) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.open.store(false, Ordering::SeqCst);
        for end in &self.ends {
            let _ = end.events.send(event.clone());
        }
        true
    }
}

/// In-memory signaling service implementing [`TransportAdapter`].
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackNetwork")
            .field("sessions", &state.order)
            .field("links", &state.links.len())
            .finish()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of sessions currently registered and open, in registration order.
    pub fn list_peers(&self) -> TransportResult<Vec<String>> {
        let mut state = self.state.lock();
        state.discovery_requests += 1;
        if state.discovery_outage {
            return Err(TransportError::Rejected(
                "discovery endpoint unavailable".into(),
            ));
        }
        let peers = state
            .order
            .iter()
            .filter(|id| state.sessions.get(*id).is_some_and(|slot| slot.open))
            .cloned()
            .collect();
        Ok(peers)
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.state.lock().sessions.contains_key(id)
    }

    /// The next `count` session creations fail with `kind` instead of opening.
    pub fn fail_next_sessions(&self, kind: SignalingErrorKind, count: usize) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state
                .scripted_failures
                .push_back((kind, format!("scripted {kind} failure")));
        }
    }

    pub fn clear_session_failures(&self) {
        self.state.lock().scripted_failures.clear();
    }

    /// Drop the signaling link of `id` without an explicit error.
    pub fn drop_signaling(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        match state.sessions.get_mut(id) {
            Some(slot) if slot.open => {
                slot.open = false;
                let _ = slot.events.send(SessionEvent::Disconnected);
                true
            }
            _ => false,
        }
    }

    /// Report a signaling error to `id`; the link is marked down for
    /// connection-level kinds.
    pub fn fail_signaling(&self, id: &str, kind: SignalingErrorKind) -> bool {
        let mut state = self.state.lock();
        let Some(slot) = state.sessions.get_mut(id) else {
            return false;
        };
        if matches!(
            kind,
            SignalingErrorKind::Disconnected
                | SignalingErrorKind::Network
                | SignalingErrorKind::ServerError
        ) {
            slot.open = false;
        }
        let _ = slot.events.send(SessionEvent::Error {
            kind,
            message: format!("injected {kind}"),
        });
        true
    }

    pub fn set_reconnect_blocked(&self, blocked: bool) {
        self.state.lock().reconnect_blocked = blocked;
    }

    /// Links to or from an unreachable peer are requested but never open.
    pub fn set_unreachable(&self, id: &str, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(id.to_string());
        } else {
            state.unreachable.remove(id);
        }
    }

    /// Close every link between `a` and `b` as if the transport dropped.
    pub fn sever(&self, a: &str, b: &str) -> usize {
        let pairs = self.state.lock().take_links_between(a, b);
        pairs
            .iter()
            .filter(|pair| pair.shutdown(LinkEvent::Close))
            .count()
    }

    /// Fail every link between `a` and `b` with a transport error.
    pub fn break_links(&self, a: &str, b: &str, message: &str) -> usize {
        let pairs = self.state.lock().take_links_between(a, b);
        pairs
            .iter()
            .filter(|pair| pair.shutdown(LinkEvent::Error(message.to_string())))
            .count()
    }

    pub fn set_discovery_outage(&self, outage: bool) {
        self.state.lock().discovery_outage = outage;
    }

    pub fn discovery_requests(&self) -> usize {
        self.state.lock().discovery_requests
    }

    pub fn session_requests(&self) -> Vec<SessionRequest> {
        self.state.lock().session_requests.clone()
    }

    pub fn connect_attempts(&self, from: &str, to: &str) -> Vec<Instant> {
        self.state
            .lock()
            .connect_attempts
            .iter()
            .filter(|attempt| attempt.from == from && attempt.to == to)
            .map(|attempt| attempt.at)
            .collect()
    }

    pub fn frames(&self, from: &str, to: &str) -> Vec<Bytes> {
        self.state
            .lock()
            .frames
            .iter()
            .filter(|frame| frame.from == from && frame.to == to)
            .map(|frame| frame.payload.clone())
            .collect()
    }

    pub fn count_frames(&self, from: &str, to: &str, payload: &[u8]) -> usize {
        self.state
            .lock()
            .frames
            .iter()
            .filter(|frame| frame.from == from && frame.to == to && frame.payload == payload)
            .count()
    }

    /// Number of links currently open between `a` and `b`.
    pub fn open_links(&self, a: &str, b: &str) -> usize {
        self.state
            .lock()
            .links
            .values()
            .filter(|pair| pair.joins(a, b) && pair.open.load(Ordering::SeqCst))
            .count()
    }
}

impl TransportAdapter for LoopbackNetwork {
    fn create_session(
        &self,
        id: &str,
        options: &SessionOptions,
    ) -> TransportResult<SignalingChannel> {
        let mut state = self.state.lock();
        state.session_requests.push(SessionRequest {
            id: id.to_string(),
            at: Instant::now(),
        });
        state.next_instance += 1;
        let instance = state.next_instance;
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(LoopbackSession {
            id: id.to_string(),
            instance,
            network: self.clone(),
        });
        trace!(
            id,
            ice_servers = options.ice_servers.len(),
            pool = options.ice_candidate_pool_size,
            "loopback session requested"
        );

        if let Some((kind, message)) = state.scripted_failures.pop_front() {
            debug!(id, %kind, "loopback session failing by script");
            let _ = tx.send(SessionEvent::Error { kind, message });
        } else if state.sessions.contains_key(id) {
            let _ = tx.send(SessionEvent::Error {
                kind: SignalingErrorKind::IdConflict,
                message: format!("ID \"{id}\" is taken"),
            });
        } else {
            state.sessions.insert(
                id.to_string(),
                SessionSlot {
                    instance,
                    open: true,
                    events: tx.clone(),
                },
            );
            state.order.push(id.to_string());
            let _ = tx.send(SessionEvent::Open { id: id.to_string() });
        }

        Ok(SignalingChannel {
            session,
            events: rx,
        })
    }
}

struct LoopbackSession {
    id: String,
    instance: u64,
    network: LoopbackNetwork,
}

impl SignalingSession for LoopbackSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.network
            .state
            .lock()
            .sessions
            .get(&self.id)
            .is_some_and(|slot| slot.instance == self.instance && slot.open)
    }

    fn connect(&self, peer_id: &str, options: ConnectOptions) -> TransportResult<Connection> {
        let mut state = self.network.state.lock();
        let own_events = match state.sessions.get(&self.id) {
            Some(slot) if slot.instance == self.instance && slot.open => slot.events.clone(),
            _ => return Err(TransportError::SessionClosed),
        };
        state.connect_attempts.push(ConnectAttempt {
            from: self.id.clone(),
            to: peer_id.to_string(),
            at: Instant::now(),
        });

        state.next_link += 1;
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let pair = Arc::new(LinkPair {
            id: state.next_link,
            ends: [
                LinkEnd {
                    owner: self.id.clone(),
                    events: local_tx,
                },
                LinkEnd {
                    owner: peer_id.to_string(),
                    events: remote_tx,
                },
            ],
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let local = LoopbackLink {
            pair: Arc::clone(&pair),
            side: 0,
            remote: peer_id.to_string(),
            metadata: HashMap::new(),
            network: self.network.clone(),
        };
        let connection = Connection::new(Arc::new(local), local_rx);

        let target = state
            .sessions
            .get(peer_id)
            .filter(|slot| slot.open)
            .map(|slot| slot.events.clone());
        let Some(target) = target else {
            let _ = own_events.send(SessionEvent::Error {
                kind: SignalingErrorKind::PeerUnavailable,
                message: format!("Could not connect to peer {peer_id}"),
            });
            return Ok(connection);
        };

        if state.unreachable.contains(&self.id) || state.unreachable.contains(peer_id) {
            debug!(from = %self.id, to = peer_id, "loopback link will never open");
            return Ok(connection);
        }

        let remote = LoopbackLink {
            pair: Arc::clone(&pair),
            side: 1,
            remote: self.id.clone(),
            metadata: options.metadata,
            network: self.network.clone(),
        };
        if target
            .send(SessionEvent::Incoming(Connection::new(
                Arc::new(remote),
                remote_rx,
            )))
            .is_err()
        {
            return Ok(connection);
        }
        state.links.insert(pair.id, Arc::clone(&pair));
        pair.open();
        Ok(connection)
    }

    fn reconnect(&self) {
        let mut state = self.network.state.lock();
        let blocked = state.reconnect_blocked;
        if let Some(slot) = state.sessions.get_mut(&self.id) {
            if slot.instance == self.instance && !slot.open && !blocked {
                slot.open = true;
                let _ = slot.events.send(SessionEvent::Open {
                    id: self.id.clone(),
                });
            }
        }
    }

    fn destroy(&self) {
        let pairs = {
            let mut state = self.network.state.lock();
            let owned = state
                .sessions
                .get(&self.id)
                .is_some_and(|slot| slot.instance == self.instance);
            if !owned {
                return;
            }
            state.sessions.remove(&self.id);
            state.order.retain(|id| id != &self.id);
            state.take_links_of(&self.id)
        };
        for pair in pairs {
            pair.shutdown(LinkEvent::Close);
        }
    }
}

pub struct LoopbackLink {
    pair: Arc<LinkPair>,
    side: usize,
    remote: String,
    metadata: HashMap<String, String>,
    network: LoopbackNetwork,
}

impl fmt::Debug for LoopbackLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackLink")
            .field("link", &self.pair.id)
            .field("remote", &self.remote)
            .field("open", &self.is_open())
            .finish()
    }
}

impl PeerLink for LoopbackLink {
    fn peer_id(&self) -> &str {
        &self.remote
    }

    fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    fn is_open(&self) -> bool {
        self.pair.open.load(Ordering::SeqCst) && !self.pair.closed.load(Ordering::SeqCst)
    }

    fn send(&self, payload: Bytes) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        let local = &self.pair.ends[self.side];
        let other = &self.pair.ends[1 - self.side];
        self.network.state.lock().frames.push(Frame {
            from: local.owner.clone(),
            to: other.owner.clone(),
            payload: payload.clone(),
        });
        other
            .events
            .send(LinkEvent::Data(payload))
            .map_err(|_| TransportError::NotOpen)
    }

    fn close(&self) {
        self.network.state.lock().links.remove(&self.pair.id);
        self.pair.shutdown(LinkEvent::Close);
    }
}
