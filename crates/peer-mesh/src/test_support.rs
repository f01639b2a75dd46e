use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use mesh_transport::{
    ConnectOptions, Connection, PeerLink, SignalingSession, TransportError, TransportResult,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Debug)]
pub(crate) struct FakeLink {
    peer: String,
    open: AtomicBool,
    failing: AtomicBool,
    close_calls: AtomicUsize,
    sent: Mutex<Vec<Bytes>>,
    metadata: HashMap<String, String>,
}

impl FakeLink {
    fn build(peer: &str, open: bool, failing: bool) -> Arc<Self> {
        Arc::new(Self {
            peer: peer.to_string(),
            open: AtomicBool::new(open),
            failing: AtomicBool::new(failing),
            close_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            metadata: HashMap::new(),
        })
    }

    pub fn open(peer: &str) -> Arc<Self> {
        Self::build(peer, true, false)
    }

    pub fn pending(peer: &str) -> Arc<Self> {
        Self::build(peer, false, false)
    }

    /// Reports open but rejects every send.
    pub fn failing(peer: &str) -> Arc<Self> {
        Self::build(peer, true, true)
    }

    /// Wrap a link into a connection whose event stream stays silent.
    pub fn connection(link: &Arc<Self>) -> Connection {
        let (_tx, rx) = mpsc::unbounded_channel();
        Connection::new(link.clone(), rx)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|payload| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl PeerLink for FakeLink {
    fn peer_id(&self) -> &str {
        &self.peer
    }

    fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, payload: Bytes) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("send failed".into()));
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Signaling session whose outbound connections never open on their own.
pub(crate) struct FakeSession {
    id: String,
    dialed: Mutex<Vec<(String, ConnectOptions)>>,
    links: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeSession {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            dialed: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
        }
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed
            .lock()
            .iter()
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    pub fn last_metadata(&self) -> HashMap<String, String> {
        self.dialed
            .lock()
            .last()
            .map(|(_, options)| options.metadata.clone())
            .unwrap_or_default()
    }

    pub fn links(&self) -> Vec<Arc<FakeLink>> {
        self.links.lock().clone()
    }
}

impl SignalingSession for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_open(&self) -> bool {
        true
    }

    fn connect(&self, peer_id: &str, options: ConnectOptions) -> TransportResult<Connection> {
        self.dialed.lock().push((peer_id.to_string(), options));
        let link = FakeLink::pending(peer_id);
        self.links.lock().push(link.clone());
        Ok(FakeLink::connection(&link))
    }

    fn reconnect(&self) {}

    fn destroy(&self) {}
}
