use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::registry::ConnectionRegistry;

/// Reserved payload sent by keepalive timers. Never shown to the user.
pub const KEEPALIVE_PAYLOAD: &[u8] = b"__ping__";

pub fn is_keepalive(payload: &[u8]) -> bool {
    payload == KEEPALIVE_PAYLOAD
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum EntryKind {
    Sent,
    Received { from: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    #[serde(flatten)]
    pub kind: EntryKind,
    pub text: String,
}

impl LogEntry {
    pub fn sent(text: impl Into<String>) -> Self {
        Self {
            at: OffsetDateTime::now_utc(),
            kind: EntryKind::Sent,
            text: text.into(),
        }
    }

    pub fn received(from: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            at: OffsetDateTime::now_utc(),
            kind: EntryKind::Received { from: from.into() },
            text: text.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clock = self
            .at
            .format(format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| fmt::Error)?;
        match &self.kind {
            EntryKind::Sent => write!(f, "{clock}: You sent: {}", self.text),
            EntryKind::Received { from } => {
                write!(f, "{clock}: Received from {from}: {}", self.text)
            }
        }
    }
}

/// Append-only record of user traffic.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: Vec<LogEntry>,
}

impl MessageLog {
    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

/// Send `message` to every open connection. Blank input is ignored and
/// returns `None`; otherwise the message is logged as sent even when no peer
/// received it.
pub fn broadcast(
    registry: &ConnectionRegistry,
    log: &mut MessageLog,
    message: &str,
) -> Option<BroadcastReport> {
    if message.trim().is_empty() {
        return None;
    }
    let payload = Bytes::copy_from_slice(message.as_bytes());
    let mut report = BroadcastReport::default();
    for (peer, link) in registry.open_links() {
        match link.send(payload.clone()) {
            Ok(()) => report.delivered.push(peer),
            Err(err) => {
                warn!(peer = %peer, error = %err, "failed to deliver broadcast");
                report.failed.push(peer);
            }
        }
    }
    debug!(
        delivered = report.delivered.len(),
        failed = report.failed.len(),
        "broadcast sent"
    );
    log.push(LogEntry::sent(message));
    Some(report)
}

/// Record an inbound payload. Returns false for keepalive traffic.
pub fn receive(log: &mut MessageLog, peer: &str, payload: &[u8]) -> bool {
    if is_keepalive(payload) {
        return false;
    }
    let text = String::from_utf8_lossy(payload);
    log.push(LogEntry::received(peer, text));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeLink;
    use tokio::time::Instant;

    fn registry_with(links: &[std::sync::Arc<FakeLink>]) -> ConnectionRegistry {
        let mut registry = ConnectionRegistry::new();
        for link in links {
            let peer = link.peer().to_string();
            let (conn, _) = registry.begin_attempt(&peer, link.clone(), Instant::now());
            registry.mark_open(&peer, conn);
        }
        registry
    }

    #[tokio::test]
    async fn blank_messages_are_ignored() {
        let bob = FakeLink::open("bob");
        let registry = registry_with(&[bob.clone()]);
        let mut log = MessageLog::default();
        assert!(broadcast(&registry, &mut log, "   \n\t").is_none());
        assert!(log.is_empty());
        assert!(bob.sent().is_empty());
    }

    #[tokio::test]
    async fn one_failing_peer_does_not_stop_delivery() {
        let bob = FakeLink::failing("bob");
        let carol = FakeLink::open("carol");
        let registry = registry_with(&[bob.clone(), carol.clone()]);
        let mut log = MessageLog::default();

        let report = broadcast(&registry, &mut log, " hi ").unwrap();
        assert_eq!(report.delivered, vec!["carol".to_string()]);
        assert_eq!(report.failed, vec!["bob".to_string()]);
        assert_eq!(carol.sent(), vec![" hi ".to_string()]);
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].kind, EntryKind::Sent);
        assert_eq!(log.entries()[0].text, " hi ");
    }

    #[tokio::test]
    async fn sent_message_is_logged_without_recipients() {
        let registry = ConnectionRegistry::new();
        let mut log = MessageLog::default();
        let report = broadcast(&registry, &mut log, "anyone?").unwrap();
        assert!(report.delivered.is_empty());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn keepalive_payloads_never_reach_the_log() {
        let mut log = MessageLog::default();
        assert!(!receive(&mut log, "bob", KEEPALIVE_PAYLOAD));
        assert!(receive(&mut log, "bob", b"hello"));
        assert_eq!(
            log.entries()[0].kind,
            EntryKind::Received {
                from: "bob".into()
            }
        );
        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn entries_render_with_clock_prefix() {
        let entry = LogEntry {
            at: time::macros::datetime!(2024-05-01 09:05:07 UTC),
            kind: EntryKind::Received {
                from: "peer_x".into(),
            },
            text: "hey".into(),
        };
        assert_eq!(entry.to_string(), "09:05:07: Received from peer_x: hey");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["direction"], "received");
        assert_eq!(json["from"], "peer_x");
        assert_eq!(json["at"], "2024-05-01T09:05:07Z");
    }
}
