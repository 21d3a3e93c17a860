//! Producer loop: poll the match source, publish what changed.

use std::sync::Arc;

use refsync_core::config::ConfigStore;
use refsync_core::processors::{FallbackSink, MatchNotifier, NotifyOutcome};
use refsync_core::publisher::Publisher;
use refsync_sdk::client::FallbackClient;
use refsync_sdk::objects::AlertLevel;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::source::MatchFileSource;
use crate::config::runtime::ProducerSettings;

pub struct Producer {
    publisher: Option<Arc<Publisher>>,
    settings: ConfigStore<ProducerSettings>,
    source: String,
    shutdown_rx: watch::Receiver<bool>,
    polls: u64,
}

impl Producer {
    /// `publisher` is `None` when messaging is disabled; every poll then
    /// goes to the HTTP fallback.
    pub fn new(
        publisher: Option<Arc<Publisher>>,
        settings: ConfigStore<ProducerSettings>,
        source: impl Into<String>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            publisher,
            settings,
            source: source.into(),
            shutdown_rx,
            polls: 0,
        }
    }

    /// Run until shutdown. Settings changes (SIGHUP) apply from the next
    /// poll on.
    pub async fn run(mut self) {
        let mut settings = self.settings.current();
        let mut watcher = self.settings.subscribe();
        let mut watching = true;
        let mut notifier = self.notifier(&settings);
        let mut ticker = new_ticker(&settings);

        info!(
            matches_file = %settings.matches_file.display(),
            poll_interval_secs = settings.poll_interval.as_secs(),
            "Producer started"
        );
        if let Some(publisher) = &self.publisher {
            publisher.publish_lifecycle(true).await;
        }

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Producer received shutdown signal");
                        break;
                    }
                }

                changed = watcher.changed(), if watching => {
                    let Some(new_settings) = changed else {
                        watching = false;
                        continue;
                    };
                    info!(
                        matches_file = %new_settings.matches_file.display(),
                        poll_interval_secs = new_settings.poll_interval.as_secs(),
                        "Producer settings reloaded"
                    );
                    if new_settings.poll_interval != settings.poll_interval {
                        ticker = new_ticker(&new_settings);
                    }
                    notifier = self.notifier(&new_settings);
                    settings = new_settings;
                }

                _ = ticker.tick() => {
                    self.poll_once(&settings, &notifier).await;
                }
            }
        }

        if let Some(publisher) = &self.publisher {
            publisher.publish_lifecycle(false).await;
            publisher.close().await;
        }
        info!("Producer shutdown complete");
    }

    fn notifier(&self, settings: &ProducerSettings) -> MatchNotifier {
        let fallback = settings
            .fallback_url
            .clone()
            .map(|url| Arc::new(FallbackClient::new(url)) as Arc<dyn FallbackSink>);
        MatchNotifier::new(self.publisher.clone(), fallback, &self.source)
    }

    /// One poll cycle. `None` when the source could not be read.
    pub async fn poll_once(
        &mut self,
        settings: &ProducerSettings,
        notifier: &MatchNotifier,
    ) -> Option<NotifyOutcome> {
        self.polls += 1;
        let source = MatchFileSource::new(&settings.matches_file);

        let matches = match source.load().await {
            Ok(matches) => matches,
            Err(e) => {
                error!(error = %e, "Failed to load match list");
                if let Some(publisher) = &self.publisher {
                    publisher
                        .publish_alert(AlertLevel::Error, &format!("match source unreadable: {e}"))
                        .await;
                }
                return None;
            }
        };

        let count = matches.len();
        let mut metadata = Map::new();
        metadata.insert(
            "matches_file".into(),
            Value::String(settings.matches_file.display().to_string()),
        );
        metadata.insert("poll".into(), json!(self.polls));

        let outcome = notifier.notify(matches, metadata).await;
        debug!(count, outcome = ?outcome, poll = self.polls, "Poll finished");

        if let Some(publisher) = &self.publisher {
            publisher
                .publish_status(
                    "poll",
                    json!({"count": count, "delivered": outcome.delivered(), "poll": self.polls}),
                )
                .await;
        }
        Some(outcome)
    }
}

fn new_ticker(settings: &ProducerSettings) -> Interval {
    let mut ticker = tokio::time::interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
