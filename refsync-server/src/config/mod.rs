//! Configuration module for refsync-server.
//!
//! Handles loading configuration from the TOML file and environment
//! variables, and turning it into validated runtime settings.

pub mod file;
pub mod runtime;

use crate::config::file::FileConfig;
use crate::config::runtime::{ConsumerSettings, LoadedConfig, ProducerSettings};
use refsync_core::config::{ConnectionSettings, MessagingConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Overrides `[messaging] redis_url`.
pub const ENV_REDIS_URL: &str = "REFSYNC_REDIS_URL";
/// Overrides `[producer] fallback_url`.
pub const ENV_FALLBACK_URL: &str = "REFSYNC_FALLBACK_URL";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: PathBuf,
}

impl ConfigLoader {
    pub fn new(config_path: impl AsRef<Path>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Load and process the configuration.
    ///
    /// 1. Read the TOML file
    /// 2. Apply environment overrides
    /// 3. Validate
    /// 4. Build runtime settings
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        self.load_with_env(|key| std::env::var(key).ok())
    }

    /// Reload the configuration (used during SIGHUP).
    pub fn reload(&self) -> Result<LoadedConfig, ConfigError> {
        self.load()
    }

    fn load_with_env(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<LoadedConfig, ConfigError> {
        let content =
            std::fs::read_to_string(&self.config_path).map_err(|source| ConfigError::IoError {
                path: self.config_path.clone(),
                source,
            })?;
        let mut file_config: FileConfig = toml::from_str(&content)?;

        if let Some(url) = env(ENV_REDIS_URL) {
            file_config.messaging.redis_url = url;
        }
        if let Some(url) = env(ENV_FALLBACK_URL) {
            file_config.producer.fallback_url = Some(url);
        }

        validate(&file_config)?;
        build_loaded_config(file_config)
    }
}

fn validate(config: &FileConfig) -> Result<(), ConfigError> {
    let m = &config.messaging;
    if m.namespace.is_empty() || m.namespace.contains(char::is_whitespace) {
        return Err(ConfigError::ValidationError(format!(
            "messaging.namespace must be a non-empty word, got {:?}",
            m.namespace
        )));
    }
    if m.source.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "messaging.source must not be empty".to_string(),
        ));
    }
    if m.max_retries == 0 {
        return Err(ConfigError::ValidationError(
            "messaging.max_retries must be at least 1".to_string(),
        ));
    }
    for (name, value) in [
        ("messaging.connect_timeout_ms", m.connect_timeout_ms),
        ("messaging.receive_timeout_ms", m.receive_timeout_ms),
        ("messaging.stream_max_len", m.stream_max_len as u64),
        ("producer.poll_interval_secs", config.producer.poll_interval_secs),
    ] {
        if value == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{name} must be greater than zero"
            )));
        }
    }
    if m.enabled {
        let url = parse_url("messaging.redis_url", &m.redis_url)?;
        if !matches!(url.scheme(), "redis" | "rediss" | "redis+unix") {
            return Err(ConfigError::ValidationError(format!(
                "messaging.redis_url must use a redis:// or rediss:// scheme, got {}",
                url.scheme()
            )));
        }
    }
    Ok(())
}

fn parse_url(field: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value)
        .map_err(|e| ConfigError::ValidationError(format!("{field} is not a valid URL: {e}")))
}

fn parse_http_url(field: &str, value: Option<&str>) -> Result<Option<Url>, ConfigError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let url = parse_url(field, value)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::ValidationError(format!(
            "{field} must be an http(s) URL"
        )));
    }
    Ok(Some(url))
}

fn build_loaded_config(file_config: FileConfig) -> Result<LoadedConfig, ConfigError> {
    let FileConfig {
        messaging: m,
        producer,
        consumer,
    } = file_config;

    Ok(LoadedConfig {
        messaging: MessagingConfig {
            enabled: m.enabled,
            namespace: m.namespace,
            source: m.source,
            connection: ConnectionSettings {
                max_retries: m.max_retries,
                retry_delay: Duration::from_millis(m.retry_delay_ms),
                health_check_interval: Duration::from_secs(m.health_check_interval_secs),
                connect_timeout: Duration::from_millis(m.connect_timeout_ms),
            },
            receive_timeout: Duration::from_millis(m.receive_timeout_ms),
            close_timeout: Duration::from_millis(m.close_timeout_ms),
            stream_max_len: m.stream_max_len,
        },
        redis_url: m.redis_url,
        producer: ProducerSettings {
            fallback_url: parse_http_url(
                "producer.fallback_url",
                producer.fallback_url.as_deref(),
            )?,
            matches_file: producer.matches_file,
            poll_interval: Duration::from_secs(producer.poll_interval_secs),
        },
        consumer: ConsumerSettings {
            status_listen: consumer.status_listen,
            calendar_sync_url: parse_http_url(
                "consumer.calendar_sync_url",
                consumer.calendar_sync_url.as_deref(),
            )?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_load_builds_runtime_settings() {
        let file = write_config(
            r#"
[messaging]
namespace = "fogis"
retry_delay_ms = 250
health_check_interval_secs = 10

[producer]
poll_interval_secs = 60
fallback_url = "http://calendar:9083/sync"
"#,
        );
        let loaded = ConfigLoader::new(file.path()).load_with_env(no_env).unwrap();

        assert_eq!(loaded.messaging.namespace, "fogis");
        assert_eq!(loaded.messaging.connection.retry_delay, Duration::from_millis(250));
        assert_eq!(
            loaded.messaging.connection.health_check_interval,
            Duration::from_secs(10)
        );
        assert_eq!(loaded.producer.poll_interval, Duration::from_secs(60));
        assert_eq!(
            loaded.producer.fallback_url.unwrap().as_str(),
            "http://calendar:9083/sync"
        );
        assert!(loaded.consumer.calendar_sync_url.is_none());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let file = write_config("[messaging]\nredis_url = \"redis://file:6379\"\n");
        let loaded = ConfigLoader::new(file.path())
            .load_with_env(|key| match key {
                ENV_REDIS_URL => Some("redis://env:6380/1".to_string()),
                ENV_FALLBACK_URL => Some("https://fallback.example/notify".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(loaded.redis_url, "redis://env:6380/1");
        assert_eq!(
            loaded.producer.fallback_url.unwrap().host_str(),
            Some("fallback.example")
        );
    }

    #[test]
    fn test_validation_errors_name_the_field() {
        let cases = [
            ("[messaging]\nmax_retries = 0\n", "max_retries"),
            ("[messaging]\nnamespace = \"\"\n", "namespace"),
            ("[messaging]\nstream_max_len = 0\n", "stream_max_len"),
            ("[messaging]\nredis_url = \"http://nope\"\n", "redis_url"),
            ("[producer]\nfallback_url = \"ftp://x\"\n", "fallback_url"),
            ("[consumer]\ncalendar_sync_url = \"not a url\"\n", "calendar_sync_url"),
        ];
        for (content, field) in cases {
            let file = write_config(content);
            match ConfigLoader::new(file.path()).load_with_env(no_env) {
                Err(ConfigError::ValidationError(msg)) => {
                    assert!(msg.contains(field), "{msg} should mention {field}")
                }
                other => panic!("expected validation error for {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_disabled_messaging_skips_broker_url_check() {
        let file = write_config("[messaging]\nenabled = false\nredis_url = \"\"\n");
        let loaded = ConfigLoader::new(file.path()).load_with_env(no_env).unwrap();
        assert!(!loaded.messaging.enabled);
    }

    #[test]
    fn test_reload_picks_up_changes() {
        let file = write_config("[producer]\npoll_interval_secs = 60\n");
        let loader = ConfigLoader::new(file.path());
        assert_eq!(
            loader.load_with_env(no_env).unwrap().producer.poll_interval,
            Duration::from_secs(60)
        );

        std::fs::write(file.path(), "[producer]\npoll_interval_secs = 5\n").unwrap();
        assert_eq!(
            loader.load_with_env(no_env).unwrap().producer.poll_interval,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let err = ConfigLoader::new("/nonexistent/refsync.toml")
            .load_with_env(no_env)
            .unwrap_err();
        assert!(matches!(err, ConfigError::IoError { .. }));
    }
}
