use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use mesh_transport::LoopbackNetwork;
use rand::Rng;
use tokio::time::Instant;
use tracing::trace;
use url::Url;

use crate::config::DiscoveryThrottle;
use crate::error::DiscoveryError;
use crate::registry::ConnectionRegistry;

/// Source of the roster of peer ids currently known to the signaling service.
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn list_peers(&self) -> Result<Vec<String>, DiscoveryError>;
}

#[async_trait]
impl PeerDiscovery for LoopbackNetwork {
    async fn list_peers(&self) -> Result<Vec<String>, DiscoveryError> {
        LoopbackNetwork::list_peers(self).map_err(|err| DiscoveryError::Unavailable(err.to_string()))
    }
}

/// Discovery endpoint served next to the signaling service:
/// `GET <base>/peerjs/peers` returning a JSON array of ids.
#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    endpoint: Url,
    client: reqwest::Client,
}

impl HttpDiscovery {
    pub fn new(base: impl AsRef<str>) -> Result<Self, DiscoveryError> {
        let mut base = base.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(DiscoveryError::InvalidConfig(
                "discovery base url cannot be empty".into(),
            ));
        }
        if !base.contains("://") {
            let inferred_scheme = infer_scheme(&base);
            base = format!("{inferred_scheme}{base}");
        }
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)
            .and_then(|parsed| parsed.join("peerjs/peers"))
            .map_err(|err| DiscoveryError::InvalidConfig(format!("invalid discovery url: {err}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl PeerDiscovery for HttpDiscovery {
    async fn list_peers(&self) -> Result<Vec<String>, DiscoveryError> {
        let response = self.client.get(self.endpoint.clone()).send().await?;
        if !response.status().is_success() {
            return Err(DiscoveryError::HttpStatus(response.status()));
        }
        let peers = response.json::<Vec<String>>().await?;
        trace!(count = peers.len(), "discovery roster fetched");
        Ok(peers)
    }
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    let private_172 = host_lower
        .strip_prefix("172.")
        .and_then(|rest| rest.split('.').next())
        .and_then(|octet| octet.parse::<u8>().ok())
        .is_some_and(|octet| (16..32).contains(&octet));
    if host_lower.starts_with("localhost")
        || host_lower.starts_with("0.0.0.0")
        || host_lower.starts_with("127.")
        || host_lower == "::1"
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || private_172
    {
        "http://"
    } else {
        "https://"
    }
}

/// Peers worth attempting from a fetched roster, in roster order: no
/// duplicates, not ourselves, nothing already open or pending, and nothing
/// attempted within the cooldown window.
pub fn select_candidates(
    fetched: &[String],
    local_id: &str,
    registry: &ConnectionRegistry,
    now: Instant,
    cooldown: Duration,
) -> Vec<String> {
    let mut seen = HashSet::new();
    fetched
        .iter()
        .filter(|peer| peer.as_str() != local_id)
        .filter(|peer| seen.insert(peer.as_str()))
        .filter(|peer| !registry.is_open(peer) && !registry.is_pending(peer))
        .filter(|peer| !registry.in_cooldown(peer, now, cooldown))
        .cloned()
        .collect()
}

/// Decides whether a scheduled discovery cycle should hit the endpoint.
/// With no open peers every cycle fetches.
#[derive(Debug)]
pub struct DiscoveryGate {
    throttle: DiscoveryThrottle,
    skipped: u32,
}

impl DiscoveryGate {
    pub fn new(throttle: DiscoveryThrottle) -> Self {
        Self {
            throttle,
            skipped: 0,
        }
    }

    pub fn should_fetch(&mut self, open_count: usize) -> bool {
        if open_count == 0 {
            self.skipped = 0;
            return true;
        }
        match self.throttle {
            DiscoveryThrottle::Always => true,
            DiscoveryThrottle::EveryNth(n) => {
                self.skipped += 1;
                if self.skipped >= n.max(1) {
                    self.skipped = 0;
                    true
                } else {
                    false
                }
            }
            DiscoveryThrottle::Probabilistic { skip_probability } => {
                rand::thread_rng().gen::<f64>() >= skip_probability
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeLink;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn infers_http_for_private_hosts() {
        assert_eq!(infer_scheme("localhost:9000"), "http://");
        assert_eq!(infer_scheme("192.168.1.20:9000/peerjs"), "http://");
        assert_eq!(infer_scheme("172.20.0.5"), "http://");
        assert_eq!(infer_scheme("[::1]:9000"), "http://");
        assert_eq!(infer_scheme("172.40.0.5"), "https://");
        assert_eq!(infer_scheme("mesh.example.com"), "https://");
    }

    #[test]
    fn endpoint_appends_roster_path() {
        let discovery = HttpDiscovery::new("localhost:9000").unwrap();
        assert_eq!(
            discovery.endpoint().as_str(),
            "http://localhost:9000/peerjs/peers"
        );
        let nested = HttpDiscovery::new("https://mesh.example.com/signal").unwrap();
        assert_eq!(
            nested.endpoint().as_str(),
            "https://mesh.example.com/signal/peerjs/peers"
        );
        assert!(matches!(
            HttpDiscovery::new("   "),
            Err(DiscoveryError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn candidates_skip_self_open_pending_and_cooling_peers() {
        let mut registry = ConnectionRegistry::new();
        let start = Instant::now();
        let cooldown = Duration::from_secs(30);
        let now = start + cooldown * 2;

        let (open, _) = registry.begin_attempt("open", FakeLink::open("open"), start);
        registry.mark_open("open", open);
        registry.accept_incoming("pending", FakeLink::pending("pending"));
        let (cooling, _) =
            registry.begin_attempt("cooling", FakeLink::pending("cooling"), now);
        registry.downgrade_to_cooldown("cooling", cooling, now);
        let (stale, _) =
            registry.begin_attempt("stale", FakeLink::pending("stale"), start + cooldown);
        registry.mark_closed("stale", stale);

        let fetched = ids(&["me", "open", "pending", "cooling", "stale", "fresh", "fresh"]);
        let candidates = select_candidates(&fetched, "me", &registry, now, cooldown);
        assert_eq!(candidates, ids(&["stale", "fresh"]));
    }

    #[test]
    fn gate_always_fetches_without_open_peers() {
        let mut gate = DiscoveryGate::new(DiscoveryThrottle::Probabilistic {
            skip_probability: 1.0,
        });
        assert!((0..10).all(|_| gate.should_fetch(0)));
        assert!((0..10).all(|_| !gate.should_fetch(2)));
    }

    #[test]
    fn every_nth_gate_fetches_once_per_window() {
        let mut gate = DiscoveryGate::new(DiscoveryThrottle::EveryNth(3));
        let pattern: Vec<bool> = (0..6).map(|_| gate.should_fetch(1)).collect();
        assert_eq!(pattern, vec![false, false, true, false, false, true]);

        gate.should_fetch(1);
        assert!(gate.should_fetch(0));
        assert!(!gate.should_fetch(1));
    }
}
