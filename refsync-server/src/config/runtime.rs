//! Validated runtime settings built from the file configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use refsync_core::config::MessagingConfig;
use url::Url;

/// Producer settings. Lives in a `ConfigStore` and is swapped on SIGHUP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSettings {
    pub matches_file: PathBuf,
    pub poll_interval: Duration,
    pub fallback_url: Option<Url>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub status_listen: SocketAddr,
    pub calendar_sync_url: Option<Url>,
}

/// Everything one load of the configuration file produces.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub messaging: MessagingConfig,
    pub redis_url: String,
    pub producer: ProducerSettings,
    pub consumer: ConsumerSettings,
}
