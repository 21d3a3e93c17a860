//! TOML file configuration structures.
//!
//! These structs directly map to the `refsync.toml` file format. Every field
//! has a default, so an empty file is a valid (all-defaults) configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use refsync_core::config::{
    DEFAULT_CLOSE_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEALTH_CHECK_INTERVAL,
    DEFAULT_MAX_RETRIES, DEFAULT_RECEIVE_TIMEOUT, DEFAULT_RETRY_DELAY, DEFAULT_STREAM_MAX_LEN,
};
use refsync_sdk::naming::DEFAULT_NAMESPACE;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub messaging: MessagingSection,
    pub producer: ProducerSection,
    pub consumer: ConsumerSection,
}

/// `[messaging]`: broker connection and event layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingSection {
    /// When false the producer goes straight to the HTTP fallback and the
    /// consumer does not subscribe.
    pub enabled: bool,
    pub redis_url: String,
    pub namespace: String,
    /// Identity stamped on every published envelope.
    pub source: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub health_check_interval_secs: u64,
    pub connect_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    pub stream_max_len: usize,
    pub close_timeout_ms: u64,
}

impl Default for MessagingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            source: "refsync".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL.as_secs(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT.as_millis() as u64,
            stream_max_len: DEFAULT_STREAM_MAX_LEN,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT.as_millis() as u64,
        }
    }
}

/// `[producer]`: where match lists come from and where they go when
/// messaging is down. Reloaded on SIGHUP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSection {
    /// JSON file holding the current list of match assignments.
    pub matches_file: PathBuf,
    pub poll_interval_secs: u64,
    /// HTTP fallback receiver. Without it, a failed publish loses the cycle.
    pub fallback_url: Option<String>,
}

impl Default for ProducerSection {
    fn default() -> Self {
        Self {
            matches_file: PathBuf::from("./matches.json"),
            poll_interval_secs: 300,
            fallback_url: None,
        }
    }
}

/// `[consumer]`: status endpoint and the calendar service to sync into.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSection {
    pub status_listen: SocketAddr,
    /// Calendar sync endpoint. Without it, snapshots are only logged.
    pub calendar_sync_url: Option<String>,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            status_listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            calendar_sync_url: None,
        }
    }
}
