use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mesh_transport::PeerLink;
use serde::Serialize;
use tokio::time::Instant;

use crate::task::TaskGuard;

/// Identifies one transport connection; stale notifications carry an id that
/// no longer matches the record they were meant for.
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Attempting,
    Open,
    Closed,
    Errored,
    CooldownOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub peer_id: String,
    pub phase: Phase,
    pub direction: Direction,
}

/// Bookkeeping for one remote peer.
///
/// Only `Attempting` (pending handle) and `Open` (live handle) records hold a
/// transport handle; every other phase holds none. Guards for the event pump,
/// the connect timeout and the keepalive timer live on the record so that
/// replacing it cancels all of them.
#[derive(Debug)]
pub struct ConnectionRecord {
    peer_id: String,
    conn_id: Option<ConnectionId>,
    direction: Direction,
    phase: Phase,
    link: Option<Arc<dyn PeerLink>>,
    opened_seq: u64,
    last_attempt_at: Option<Instant>,
    last_error: Option<String>,
    pump: Option<TaskGuard>,
    timeout: Option<TaskGuard>,
    keepalive: Option<TaskGuard>,
}

impl ConnectionRecord {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn conn_id(&self) -> Option<ConnectionId> {
        self.conn_id
    }

    pub fn last_attempt_at(&self) -> Option<Instant> {
        self.last_attempt_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn has_keepalive(&self) -> bool {
        self.keepalive.is_some()
    }

    /// The transport handle, only while the connection is open.
    pub fn live_link(&self) -> Option<&Arc<dyn PeerLink>> {
        match self.phase {
            Phase::Open => self.link.as_ref(),
            _ => None,
        }
    }

    fn is_current(&self, conn: ConnectionId) -> bool {
        self.conn_id == Some(conn)
    }

    /// Cancel everything armed for this record and hand back its handle.
    fn release(&mut self) -> Option<Arc<dyn PeerLink>> {
        self.pump = None;
        self.timeout = None;
        self.keepalive = None;
        self.conn_id = None;
        self.link.take()
    }

    fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.peer_id.clone(),
            phase: self.phase,
            direction: self.direction,
        }
    }
}

/// One record per peer id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    records: HashMap<String, ConnectionRecord>,
    next_conn: ConnectionId,
    next_open_seq: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: &str) -> Option<&ConnectionRecord> {
        self.records.get(peer_id)
    }

    pub fn phase(&self, peer_id: &str) -> Option<Phase> {
        self.records.get(peer_id).map(ConnectionRecord::phase)
    }

    pub fn is_open(&self, peer_id: &str) -> bool {
        self.phase(peer_id) == Some(Phase::Open)
    }

    pub fn is_pending(&self, peer_id: &str) -> bool {
        self.phase(peer_id) == Some(Phase::Attempting)
    }

    pub fn in_cooldown(&self, peer_id: &str, now: Instant, window: Duration) -> bool {
        self.records
            .get(peer_id)
            .and_then(ConnectionRecord::last_attempt_at)
            .is_some_and(|at| now.saturating_duration_since(at) < window)
    }

    pub fn is_current(&self, peer_id: &str, conn: ConnectionId) -> bool {
        self.records
            .get(peer_id)
            .is_some_and(|record| record.is_current(conn))
    }

    /// Track a new outbound attempt, stamping `last_attempt_at`. Returns the
    /// new connection id and whatever handle the previous record still held.
    pub fn begin_attempt(
        &mut self,
        peer_id: &str,
        link: Arc<dyn PeerLink>,
        now: Instant,
    ) -> (ConnectionId, Option<Arc<dyn PeerLink>>) {
        self.install(peer_id, link, Direction::Outbound, Some(now))
    }

    /// Track an inbound connection, overwriting any existing record but
    /// keeping its attempt history.
    pub fn accept_incoming(
        &mut self,
        peer_id: &str,
        link: Arc<dyn PeerLink>,
    ) -> (ConnectionId, Option<Arc<dyn PeerLink>>) {
        let history = self.records.get(peer_id).and_then(|r| r.last_attempt_at);
        self.install(peer_id, link, Direction::Inbound, history)
    }

    fn install(
        &mut self,
        peer_id: &str,
        link: Arc<dyn PeerLink>,
        direction: Direction,
        last_attempt_at: Option<Instant>,
    ) -> (ConnectionId, Option<Arc<dyn PeerLink>>) {
        self.next_conn += 1;
        let conn = self.next_conn;
        let displaced = self
            .records
            .remove(peer_id)
            .and_then(|mut previous| previous.release());
        self.records.insert(
            peer_id.to_string(),
            ConnectionRecord {
                peer_id: peer_id.to_string(),
                conn_id: Some(conn),
                direction,
                phase: Phase::Attempting,
                link: Some(link),
                opened_seq: 0,
                last_attempt_at,
                last_error: None,
                pump: None,
                timeout: None,
                keepalive: None,
            },
        );
        (conn, displaced)
    }

    fn current_mut(&mut self, peer_id: &str, conn: ConnectionId) -> Option<&mut ConnectionRecord> {
        self.records
            .get_mut(peer_id)
            .filter(|record| record.is_current(conn))
    }

    /// Install the event pump for a connection, replacing any previous one.
    pub fn attach_pump(&mut self, peer_id: &str, conn: ConnectionId, pump: TaskGuard) -> bool {
        match self.current_mut(peer_id, conn) {
            Some(record) => {
                record.pump = Some(pump);
                true
            }
            None => false,
        }
    }

    pub fn arm_timeout(&mut self, peer_id: &str, conn: ConnectionId, timer: TaskGuard) -> bool {
        match self.current_mut(peer_id, conn) {
            Some(record) if record.phase == Phase::Attempting => {
                record.timeout = Some(timer);
                true
            }
            _ => false,
        }
    }

    /// Promote a pending connection to `Open`, cancelling its timeout.
    pub fn mark_open(&mut self, peer_id: &str, conn: ConnectionId) -> Option<Arc<dyn PeerLink>> {
        self.next_open_seq += 1;
        let seq = self.next_open_seq;
        let record = self.current_mut(peer_id, conn)?;
        if record.phase != Phase::Attempting {
            return None;
        }
        record.phase = Phase::Open;
        record.opened_seq = seq;
        record.timeout = None;
        record.link.clone()
    }

    /// Replace the keepalive timer of an open connection. At most one timer
    /// exists per peer because the slot is overwritten, never appended to.
    pub fn set_keepalive(&mut self, peer_id: &str, conn: ConnectionId, timer: TaskGuard) -> bool {
        match self.current_mut(peer_id, conn) {
            Some(record) if record.phase == Phase::Open => {
                record.keepalive = Some(timer);
                true
            }
            _ => false,
        }
    }

    pub fn cancel_keepalive(&mut self, peer_id: &str) -> bool {
        self.records
            .get_mut(peer_id)
            .and_then(|record| record.keepalive.take())
            .is_some()
    }

    pub fn mark_closed(&mut self, peer_id: &str, conn: ConnectionId) -> Option<Phase> {
        self.finish(peer_id, conn, Phase::Closed, None)
    }

    pub fn mark_errored(&mut self, peer_id: &str, conn: ConnectionId, reason: &str) -> Option<Phase> {
        self.finish(peer_id, conn, Phase::Errored, Some(reason.to_string()))
    }

    fn finish(
        &mut self,
        peer_id: &str,
        conn: ConnectionId,
        phase: Phase,
        reason: Option<String>,
    ) -> Option<Phase> {
        let record = self.current_mut(peer_id, conn)?;
        let previous = record.phase;
        record.release();
        record.phase = phase;
        if reason.is_some() {
            record.last_error = reason;
        }
        Some(previous)
    }

    /// Give up on a pending attempt. The record keeps only the retry window;
    /// the pending handle is returned for the caller to close.
    pub fn downgrade_to_cooldown(
        &mut self,
        peer_id: &str,
        conn: ConnectionId,
        now: Instant,
    ) -> Option<Arc<dyn PeerLink>> {
        let record = self.current_mut(peer_id, conn)?;
        if record.phase != Phase::Attempting {
            return None;
        }
        let pending = record.release();
        record.phase = Phase::CooldownOnly;
        record.last_attempt_at = Some(now);
        pending
    }

    pub fn live_link(&self, peer_id: &str, conn: ConnectionId) -> Option<Arc<dyn PeerLink>> {
        self.records
            .get(peer_id)
            .filter(|record| record.is_current(conn))
            .and_then(|record| record.live_link().cloned())
    }

    /// Open connections in the order they opened.
    pub fn open_links(&self) -> Vec<(String, Arc<dyn PeerLink>)> {
        let mut open: Vec<&ConnectionRecord> = self
            .records
            .values()
            .filter(|record| record.phase == Phase::Open)
            .collect();
        open.sort_by_key(|record| record.opened_seq);
        open.into_iter()
            .filter_map(|record| {
                record
                    .live_link()
                    .map(|link| (record.peer_id.clone(), Arc::clone(link)))
            })
            .collect()
    }

    /// Peers with an open connection, in the order they opened.
    pub fn roster(&self) -> Vec<String> {
        self.open_links().into_iter().map(|(peer, _)| peer).collect()
    }

    /// Every tracked peer: open ones first in open order, the rest by id.
    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut records: Vec<&ConnectionRecord> = self.records.values().collect();
        let rank = |record: &ConnectionRecord| match record.phase {
            Phase::Open => (0, record.opened_seq),
            _ => (1, 0),
        };
        records.sort_by(|a, b| {
            rank(*a)
                .cmp(&rank(*b))
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        records.into_iter().map(ConnectionRecord::summary).collect()
    }

    pub fn open_count(&self) -> usize {
        self.records
            .values()
            .filter(|record| record.phase == Phase::Open)
            .count()
    }

    pub fn keepalive_count(&self) -> usize {
        self.records
            .values()
            .filter(|record| record.has_keepalive())
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record, history included. Returns the handles that were
    /// still held so the caller can close them.
    pub fn clear(&mut self) -> Vec<(String, Arc<dyn PeerLink>)> {
        self.records
            .drain()
            .filter_map(|(peer, mut record)| record.release().map(|link| (peer, link)))
            .collect()
    }
}
