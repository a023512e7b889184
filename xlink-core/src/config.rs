//! Tunables for links, device sessions and the TCP/IP platform.
//!
//! Every struct deserializes with `#[serde(default)]`, so a config file only
//! needs the keys it changes. Durations are stored in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{MAX_PACKETS_PER_STREAM, PACKET_LENGTH};

/// Per-link settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Budget for buffered incoming bytes across all streams of one link.
    pub pool_limit: usize,
    /// Largest padded payload accepted in a single frame.
    pub max_packet_size: usize,
    /// Depth of the outbound frame queue feeding the writer task.
    pub outbound_queue: usize,
    /// Deadline for the ping issued right after connecting.
    pub ping_timeout_ms: u64,
    /// Deadline for the remote reset handshake.
    pub reset_timeout_ms: u64,
    /// Deadline for stream create/close round trips.
    pub request_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            pool_limit: 64 * 1024 * 1024,
            max_packet_size: PACKET_LENGTH * MAX_PACKETS_PER_STREAM,
            outbound_queue: 128,
            ping_timeout_ms: 2_000,
            reset_timeout_ms: 2_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl LinkConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Discovery and boot retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of discovery rounds before giving up with `NotFound`.
    pub discovery_attempts: u32,
    /// Delay before the second attempt; doubles on every retry.
    pub retry_backoff_ms: u64,
    /// Upper bound for the backoff delay.
    pub max_backoff_ms: u64,
    /// Number of boot attempts per device.
    pub boot_attempts: u32,
    /// How long to wait for a booted device to re-enumerate.
    pub boot_timeout_ms: u64,
    /// Settings applied to every link the session opens.
    pub link: LinkConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discovery_attempts: 5,
            retry_backoff_ms: 100,
            max_backoff_ms: 2_000,
            boot_attempts: 3,
            boot_timeout_ms: 10_000,
            link: LinkConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }
}

/// TCP/IP platform settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Hosts probed during discovery. Empty means broadcast.
    pub targets: Vec<String>,
    /// Port carrying link traffic.
    pub link_port: u16,
    /// Port answering discovery datagrams.
    pub discovery_port: u16,
    /// How long discovery collects replies.
    pub discovery_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            link_port: 11490,
            discovery_port: 11491,
            discovery_timeout_ms: 200,
        }
    }
}

impl TcpConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.backoff(0), Duration::from_millis(100));
        assert_eq!(cfg.backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3), Duration::from_millis(800));
        assert_eq!(cfg.backoff(10), Duration::from_millis(2_000));
        assert_eq!(cfg.backoff(200), Duration::from_millis(2_000));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: SessionConfig =
            serde_json::from_str(r#"{"boot_attempts": 1, "link": {"pool_limit": 4096}}"#).unwrap();
        assert_eq!(cfg.boot_attempts, 1);
        assert_eq!(cfg.link.pool_limit, 4096);
        assert_eq!(cfg.discovery_attempts, 5);
        assert_eq!(cfg.link.ping_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn tcp_defaults() {
        let cfg: TcpConfig = serde_json::from_str(r#"{"targets": ["10.0.0.2"]}"#).unwrap();
        assert_eq!(cfg.link_port, 11490);
        assert_eq!(cfg.discovery_port, 11491);
        assert_eq!(cfg.targets, vec!["10.0.0.2".to_string()]);
    }
}
