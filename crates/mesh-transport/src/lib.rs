use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod loopback;

pub use loopback::LoopbackNetwork;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection is not open")]
    NotOpen,
    #[error("signaling session is closed")]
    SessionClosed,
    #[error("transport rejected request: {0}")]
    Rejected(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Error categories reported by the signaling service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingErrorKind {
    PeerUnavailable,
    IdConflict,
    Disconnected,
    Network,
    ServerError,
    Other,
}

impl SignalingErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalingErrorKind::PeerUnavailable => "peer-unavailable",
            SignalingErrorKind::IdConflict => "unavailable-id",
            SignalingErrorKind::Disconnected => "disconnected",
            SignalingErrorKind::Network => "network",
            SignalingErrorKind::ServerError => "server-error",
            SignalingErrorKind::Other => "other",
        }
    }

    pub fn from_wire(value: &str) -> Self {
        match value {
            "peer-unavailable" => SignalingErrorKind::PeerUnavailable,
            "unavailable-id" => SignalingErrorKind::IdConflict,
            "disconnected" => SignalingErrorKind::Disconnected,
            "network" => SignalingErrorKind::Network,
            "server-error" => SignalingErrorKind::ServerError,
            _ => SignalingErrorKind::Other,
        }
    }
}

impl fmt::Display for SignalingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications raised by a signaling session.
#[derive(Debug)]
pub enum SessionEvent {
    Open { id: String },
    Error {
        kind: SignalingErrorKind,
        message: String,
    },
    /// The signaling link dropped without an explicit error.
    Disconnected,
    Incoming(Connection),
}

/// Notifications raised by a single peer connection, delivered in the order
/// `Open`, zero or more `Data`, then at most one of `Close` / `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Open,
    Data(Bytes),
    Close,
    Error(String),
}

/// Owned handle to a direct data channel with one remote peer.
pub trait PeerLink: Send + Sync + fmt::Debug {
    fn peer_id(&self) -> &str;
    /// Metadata the initiating side attached to the connection request.
    fn metadata(&self) -> &HashMap<String, String>;
    fn is_open(&self) -> bool;
    fn send(&self, payload: Bytes) -> TransportResult<()>;
    /// Closing an already closed link is a no-op.
    fn close(&self);
}

/// A connection handle together with its event stream.
pub struct Connection {
    pub link: Arc<dyn PeerLink>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Connection {
    pub fn new(link: Arc<dyn PeerLink>, events: mpsc::UnboundedReceiver<LinkEvent>) -> Self {
        Self { link, events }
    }

    pub fn peer_id(&self) -> &str {
        self.link.peer_id()
    }

    pub fn into_parts(self) -> (Arc<dyn PeerLink>, mpsc::UnboundedReceiver<LinkEvent>) {
        (self.link, self.events)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer_id", &self.link.peer_id())
            .field("open", &self.link.is_open())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub reliable: bool,
    pub metadata: HashMap<String, String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            reliable: true,
            metadata: HashMap::new(),
        }
    }
}

impl ConnectOptions {
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Options passed to the signaling service when a local session is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub ice_servers: Vec<String>,
    pub ice_candidate_pool_size: u8,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
                "stun:stun3.l.google.com:19302".to_string(),
                "stun:stun4.l.google.com:19302".to_string(),
            ],
            ice_candidate_pool_size: 5,
        }
    }
}

/// A registration with the signaling service.
pub trait SignalingSession: Send + Sync {
    fn id(&self) -> &str;
    fn is_open(&self) -> bool;
    /// Request an outbound connection. The returned connection reports `Open`
    /// once negotiation completes, or nothing at all if the peer never answers.
    fn connect(&self, peer_id: &str, options: ConnectOptions) -> TransportResult<Connection>;
    /// Re-establish the signaling link in place, keeping the same identity.
    fn reconnect(&self);
    fn destroy(&self);
}

/// A freshly created signaling session and the stream of its notifications.
pub struct SignalingChannel {
    pub session: Arc<dyn SignalingSession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

pub trait TransportAdapter: Send + Sync {
    fn create_session(&self, id: &str, options: &SessionOptions)
    -> TransportResult<SignalingChannel>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_round_trip_wire_names() {
        for kind in [
            SignalingErrorKind::PeerUnavailable,
            SignalingErrorKind::IdConflict,
            SignalingErrorKind::Disconnected,
            SignalingErrorKind::Network,
            SignalingErrorKind::ServerError,
        ] {
            assert_eq!(SignalingErrorKind::from_wire(kind.as_str()), kind);
        }
        assert_eq!(
            SignalingErrorKind::from_wire("browser-incompatible"),
            SignalingErrorKind::Other
        );
    }

    #[test]
    fn default_session_options_use_public_stun() {
        let options = SessionOptions::default();
        assert_eq!(options.ice_servers.len(), 5);
        assert!(options.ice_servers.iter().all(|url| url.starts_with("stun:")));
    }
}
