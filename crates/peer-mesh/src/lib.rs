//! Self-healing mesh of direct peer connections.
//!
//! A [`MeshHandle`] runs one session against a signaling service reached
//! through a [`mesh_transport::TransportAdapter`]. The session keeps a fresh
//! identity registered, discovers peers through a [`PeerDiscovery`] source,
//! dials and repairs connections, and broadcasts text to every open peer.

pub mod broadcast;
pub mod config;
mod connections;
pub mod discovery;
pub mod error;
mod handle;
pub mod identity;
pub mod registry;
mod session;
pub mod task;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use broadcast::{BroadcastReport, EntryKind, LogEntry, KEEPALIVE_PAYLOAD};
pub use config::{DiscoveryThrottle, MeshConfig, PlatformProfile};
pub use discovery::{HttpDiscovery, PeerDiscovery};
pub use error::{DiscoveryError, MeshError};
pub use handle::{MeshHandle, MeshSnapshot};
pub use registry::{Direction, Phase, PeerSummary};
pub use session::{reconnect_delay, SessionStatus};
