use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use mesh_transport::SessionOptions;
use serde::Serialize;

use crate::error::MeshError;

/// Client platform the tuning constants are resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformProfile {
    Desktop,
    Ios,
    Android,
}

impl PlatformProfile {
    /// Classify a browser user agent string.
    pub fn detect(user_agent: &str) -> Self {
        if ["iPad", "iPhone", "iPod"]
            .iter()
            .any(|needle| user_agent.contains(needle))
        {
            PlatformProfile::Ios
        } else if user_agent.to_ascii_lowercase().contains("android") {
            PlatformProfile::Android
        } else {
            PlatformProfile::Desktop
        }
    }

    /// Mobile browsers suspend idle sockets in the background.
    pub fn is_mobile(&self) -> bool {
        matches!(self, PlatformProfile::Ios | PlatformProfile::Android)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformProfile::Desktop => "desktop",
            PlatformProfile::Ios => "ios",
            PlatformProfile::Android => "android",
        }
    }
}

impl fmt::Display for PlatformProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformProfile {
    type Err = MeshError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(PlatformProfile::Desktop),
            "ios" => Ok(PlatformProfile::Ios),
            "android" => Ok(PlatformProfile::Android),
            other => Err(MeshError::InvalidConfig(format!(
                "unknown platform profile '{other}'"
            ))),
        }
    }
}

/// How scheduled discovery cycles are thinned out once the mesh has peers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiscoveryThrottle {
    Always,
    /// While at least one peer is open, fetch on every n-th cycle only.
    EveryNth(u32),
    /// While at least one peer is open, skip a cycle with this probability.
    Probabilistic { skip_probability: f64 },
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub profile: PlatformProfile,
    pub discovery_interval: Duration,
    /// Extra discovery timer that only fires a fetch while no peer is open.
    pub idle_rescan_interval: Option<Duration>,
    pub discovery_stagger: Duration,
    pub discovery_throttle: DiscoveryThrottle,
    pub cooldown: Duration,
    pub connect_timeout: Duration,
    pub keepalive_interval: Option<Duration>,
    pub retry_after_close: Option<Duration>,
    pub retry_after_error: Option<Duration>,
    pub max_reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub id_conflict_delay: Duration,
    pub disconnect_grace: Duration,
    pub force_refresh_delay: Duration,
    pub session: SessionOptions,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::for_profile(PlatformProfile::Desktop)
    }
}

impl MeshConfig {
    pub fn for_profile(profile: PlatformProfile) -> Self {
        let mobile = profile.is_mobile();
        let session = SessionOptions {
            ice_candidate_pool_size: if profile == PlatformProfile::Ios { 10 } else { 5 },
            ..SessionOptions::default()
        };
        Self {
            profile,
            discovery_interval: Duration::from_secs(20),
            idle_rescan_interval: mobile.then(|| Duration::from_secs(15)),
            discovery_stagger: if mobile {
                Duration::from_millis(500)
            } else {
                Duration::from_millis(250)
            },
            discovery_throttle: DiscoveryThrottle::EveryNth(3),
            cooldown: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: mobile.then(|| Duration::from_secs(30)),
            retry_after_close: mobile.then(|| Duration::from_secs(2)),
            retry_after_error: mobile.then(|| Duration::from_secs(3)),
            max_reconnect_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(10),
            id_conflict_delay: Duration::from_millis(500),
            disconnect_grace: Duration::from_secs(2),
            force_refresh_delay: Duration::from_millis(500),
            session,
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve the configuration from an arbitrary key lookup. Unparseable
    /// values fall back to the profile defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let profile = lookup("MESH_PLATFORM")
            .and_then(|value| value.parse().ok())
            .unwrap_or(PlatformProfile::Desktop);
        let mut config = Self::for_profile(profile);
        let millis = |key: &str| {
            lookup(key)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        if let Some(interval) = millis("MESH_DISCOVERY_INTERVAL_MS").filter(|d| !d.is_zero()) {
            config.discovery_interval = interval;
        }
        if let Some(cooldown) = millis("MESH_COOLDOWN_MS") {
            config.cooldown = cooldown;
        }
        if let Some(timeout) = millis("MESH_CONNECT_TIMEOUT_MS").filter(|d| !d.is_zero()) {
            config.connect_timeout = timeout;
        }
        if let Some(keepalive) = millis("MESH_KEEPALIVE_INTERVAL_MS") {
            config.keepalive_interval = (!keepalive.is_zero()).then_some(keepalive);
        }
        if let Some(attempts) = lookup("MESH_MAX_RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok())
        {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(base) = millis("MESH_BACKOFF_BASE_MS") {
            config.backoff_base = base;
        }
        if let Some(cap) = millis("MESH_BACKOFF_CAP_MS") {
            config.backoff_cap = cap;
        }
        if let Some(probability) = lookup("MESH_DISCOVERY_SKIP_PROBABILITY")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|p| (0.0..=1.0).contains(p))
        {
            config.discovery_throttle = DiscoveryThrottle::Probabilistic {
                skip_probability: probability,
            };
        }
        config
    }

    pub fn keepalive_enabled(&self) -> bool {
        self.keepalive_interval.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn detects_platform_from_user_agent() {
        assert_eq!(
            PlatformProfile::detect("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X)"),
            PlatformProfile::Ios
        );
        assert_eq!(
            PlatformProfile::detect("Mozilla/5.0 (Linux; Android 14; Pixel 8)"),
            PlatformProfile::Android
        );
        assert_eq!(
            PlatformProfile::detect("Mozilla/5.0 (X11; Linux x86_64)"),
            PlatformProfile::Desktop
        );
    }

    #[test]
    fn mobile_profiles_enable_keepalive_and_peer_retry() {
        let ios = MeshConfig::for_profile(PlatformProfile::Ios);
        assert_eq!(ios.keepalive_interval, Some(Duration::from_secs(30)));
        assert_eq!(ios.retry_after_close, Some(Duration::from_secs(2)));
        assert_eq!(ios.session.ice_candidate_pool_size, 10);

        let desktop = MeshConfig::default();
        assert!(!desktop.keepalive_enabled());
        assert!(desktop.retry_after_close.is_none());
        assert!(desktop.idle_rescan_interval.is_none());
        assert_eq!(desktop.session.ice_candidate_pool_size, 5);
    }

    #[test]
    fn lookup_overrides_defaults() {
        let config = MeshConfig::from_lookup(lookup_from(&[
            ("MESH_PLATFORM", "android"),
            ("MESH_DISCOVERY_INTERVAL_MS", "5000"),
            ("MESH_KEEPALIVE_INTERVAL_MS", "0"),
            ("MESH_MAX_RECONNECT_ATTEMPTS", "7"),
            ("MESH_DISCOVERY_SKIP_PROBABILITY", "0.7"),
        ]));
        assert_eq!(config.profile, PlatformProfile::Android);
        assert_eq!(config.discovery_interval, Duration::from_secs(5));
        assert!(config.keepalive_interval.is_none());
        assert_eq!(config.max_reconnect_attempts, 7);
        assert_eq!(
            config.discovery_throttle,
            DiscoveryThrottle::Probabilistic {
                skip_probability: 0.7
            }
        );
    }

    #[test]
    fn lookup_ignores_garbage() {
        let config = MeshConfig::from_lookup(lookup_from(&[
            ("MESH_PLATFORM", "toaster"),
            ("MESH_COOLDOWN_MS", "soon"),
            ("MESH_DISCOVERY_SKIP_PROBABILITY", "2.5"),
        ]));
        assert_eq!(config.profile, PlatformProfile::Desktop);
        assert_eq!(config.cooldown, Duration::from_secs(30));
        assert_eq!(config.discovery_throttle, DiscoveryThrottle::EveryNth(3));
    }

    #[test]
    fn profile_parses_case_insensitively() {
        assert_eq!("IOS".parse::<PlatformProfile>().unwrap(), PlatformProfile::Ios);
        assert!("palm".parse::<PlatformProfile>().is_err());
    }
}
