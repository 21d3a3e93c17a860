//! MatchNotifier: publish over the broker, fall back to HTTP when that
//! is not possible.

use std::sync::Arc;

use async_trait::async_trait;
use refsync_sdk::client::{ClientError, FallbackClient};
use refsync_sdk::objects::{FallbackPayload, MatchRecord};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::publisher::Publisher;

/// Where match lists go when pub/sub is not an option.
#[async_trait]
pub trait FallbackSink: Send + Sync {
    async fn deliver(&self, payload: &FallbackPayload) -> Result<(), ClientError>;
}

#[async_trait]
impl FallbackSink for FallbackClient {
    async fn deliver(&self, payload: &FallbackPayload) -> Result<(), ClientError> {
        self.send(payload).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Published,
    FallbackDelivered,
    /// Neither path worked; the list is lost for this cycle.
    Failed,
}

impl NotifyOutcome {
    pub fn delivered(self) -> bool {
        !matches!(self, NotifyOutcome::Failed)
    }
}

pub struct MatchNotifier {
    publisher: Option<Arc<Publisher>>,
    fallback: Option<Arc<dyn FallbackSink>>,
    source: String,
}

impl MatchNotifier {
    /// `publisher` is `None` when messaging is disabled in configuration.
    pub fn new(
        publisher: Option<Arc<Publisher>>,
        fallback: Option<Arc<dyn FallbackSink>>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            fallback,
            source: source.into(),
        }
    }

    pub fn publisher(&self) -> Option<&Arc<Publisher>> {
        self.publisher.as_ref()
    }

    pub async fn notify(
        &self,
        matches: Vec<MatchRecord>,
        metadata: Map<String, Value>,
    ) -> NotifyOutcome {
        if let Some(publisher) = &self.publisher {
            if publisher
                .publish_match_events(matches.clone(), metadata.clone())
                .await
            {
                return NotifyOutcome::Published;
            }
            warn!(count = matches.len(), "Publishing failed, trying HTTP fallback");
        }

        let Some(fallback) = &self.fallback else {
            error!(
                count = matches.len(),
                "Match list not delivered: messaging failed and no fallback is configured"
            );
            return NotifyOutcome::Failed;
        };

        let count = matches.len();
        let payload = FallbackPayload::new(matches, &self.source, metadata);
        match fallback.deliver(&payload).await {
            Ok(()) => {
                info!(count, "Match list delivered over HTTP fallback");
                NotifyOutcome::FallbackDelivered
            }
            Err(e) => {
                error!(count, error = %e, "HTTP fallback delivery failed");
                NotifyOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::MessagingConfig;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        payloads: Mutex<Vec<FallbackPayload>>,
    }

    #[async_trait]
    impl FallbackSink for RecordingSink {
        async fn deliver(&self, payload: &FallbackPayload) -> Result<(), ClientError> {
            self.payloads.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl FallbackSink for BrokenSink {
        async fn deliver(&self, _payload: &FallbackPayload) -> Result<(), ClientError> {
            Err(ClientError::Json(
                serde_json::from_str::<Value>("{").unwrap_err(),
            ))
        }
    }

    fn publisher(broker: &MemoryBroker) -> Arc<Publisher> {
        let mut config = MessagingConfig::new("producer");
        config.connection.retry_delay = Duration::from_millis(5);
        Arc::new(Publisher::new(Arc::new(broker.clone()), config))
    }

    fn matches() -> Vec<MatchRecord> {
        vec![MatchRecord::new(1), MatchRecord::new(2)]
    }

    #[tokio::test]
    async fn test_publishes_when_broker_is_up() {
        let broker = MemoryBroker::new();
        let sink = Arc::new(RecordingSink::default());
        let notifier = MatchNotifier::new(Some(publisher(&broker)), Some(sink.clone()), "producer");

        assert_eq!(notifier.notify(matches(), Map::new()).await, NotifyOutcome::Published);
        assert!(sink.payloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_falls_back_when_broker_is_down() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let sink = Arc::new(RecordingSink::default());
        let notifier = MatchNotifier::new(Some(publisher(&broker)), Some(sink.clone()), "producer");

        let mut metadata = Map::new();
        metadata.insert("run".into(), Value::from(7));
        assert_eq!(
            notifier.notify(matches(), metadata).await,
            NotifyOutcome::FallbackDelivered
        );

        let payloads = sink.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].matches.len(), 2);
        assert_eq!(payloads[0].source, "producer");
        assert_eq!(payloads[0].metadata["run"], Value::from(7));
    }

    #[tokio::test]
    async fn test_disabled_messaging_goes_straight_to_fallback() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = MatchNotifier::new(None, Some(sink.clone()), "producer");
        assert_eq!(
            notifier.notify(matches(), Map::new()).await,
            NotifyOutcome::FallbackDelivered
        );
    }

    #[tokio::test]
    async fn test_reports_failure_when_nothing_works() {
        let broker = MemoryBroker::new();
        broker.set_available(false);

        let without_sink = MatchNotifier::new(Some(publisher(&broker)), None, "producer");
        let outcome = without_sink.notify(matches(), Map::new()).await;
        assert_eq!(outcome, NotifyOutcome::Failed);
        assert!(!outcome.delivered());

        let broken = MatchNotifier::new(None, Some(Arc::new(BrokenSink)), "producer");
        assert_eq!(broken.notify(matches(), Map::new()).await, NotifyOutcome::Failed);
    }
}
