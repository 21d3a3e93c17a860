//! Runtime configuration for the messaging core.
//!
//! These are the validated values the core works with. Loading them from a
//! TOML file and the environment is the server crate's job.

mod config_store;

pub use config_store::{ConfigStore, ConfigWatcher};

use std::time::Duration;

use refsync_sdk::naming::{ChannelNames, DEFAULT_NAMESPACE};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STREAM_MAX_LEN: usize = 1000;

/// Reconnection and health-check policy of a [`ConnectionManager`].
///
/// [`ConnectionManager`]: crate::connection::ConnectionManager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Attempts per `ensure_connection()` call before reporting unavailable.
    pub max_retries: u32,
    /// Fixed pause between attempts.
    pub retry_delay: Duration,
    /// Minimum time between two pings of a live connection.
    pub health_check_interval: Duration,
    /// Upper bound on one connect (or ping) against the broker. An
    /// unresponsive broker counts as a failed attempt after this long.
    pub connect_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Everything a publisher or subscriber needs to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingConfig {
    /// When false, publishers report failure immediately and subscribers
    /// refuse to start, so producers go straight to the HTTP fallback.
    pub enabled: bool,
    pub namespace: String,
    /// Identity stamped into the `source` field of every envelope.
    pub source: String,
    pub connection: ConnectionSettings,
    /// Upper bound on one blocking receive; also the worst-case delay before
    /// a stop request is noticed.
    pub receive_timeout: Duration,
    /// How long `close()` waits for the receive loop before aborting it.
    pub close_timeout: Duration,
    /// Approximate cap on every event stream.
    pub stream_max_len: usize,
}

impl MessagingConfig {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn channel_names(&self) -> ChannelNames {
        ChannelNames::new(self.namespace.clone())
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: DEFAULT_NAMESPACE.to_string(),
            source: "refsync".to_string(),
            connection: ConnectionSettings::default(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            stream_max_len: DEFAULT_STREAM_MAX_LEN,
        }
    }
}
