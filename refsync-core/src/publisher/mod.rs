//! Publisher: envelopes out, snapshot diffing for match lists.
//!
//! Every event goes to the all-events channel, its type channel and, for
//! `matches.*`, the domain shortcut channel. A flattened copy is appended
//! to the capped category stream.

pub mod diff;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use refsync_sdk::naming::ChannelNames;
use refsync_sdk::objects::{AlertLevel, Envelope, EventType, MatchRecord, UnknownEventType};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::{BrokerError, Connector};
use crate::config::MessagingConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use diff::{MatchDiff, Snapshot, diff_snapshots, index_matches};

/// Why a publish did not go through. Callers of the `bool` API treat all of
/// these as "take the fallback path".
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("messaging is disabled")]
    Disabled,

    #[error("broker unavailable: {}", .0.as_deref().unwrap_or("unknown error"))]
    Unavailable(Option<String>),

    #[error(transparent)]
    UnknownType(#[from] UnknownEventType),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("send failed: {0}")]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub failed: u64,
}

/// Publishes envelopes through its own [`ConnectionManager`].
///
/// Safe to share between tasks; concurrent `publish_match_events` calls are
/// serialized on the snapshot lock so every diff sees the snapshot the
/// previous call left behind.
pub struct Publisher {
    connection: ConnectionManager,
    names: ChannelNames,
    config: MessagingConfig,
    snapshot: Mutex<Snapshot>,
    published: AtomicU64,
    failed: AtomicU64,
}

impl Publisher {
    pub fn new(connector: Arc<dyn Connector>, config: MessagingConfig) -> Self {
        Self {
            connection: ConnectionManager::new("publisher", connector, config.connection),
            names: config.channel_names(),
            config,
            snapshot: Mutex::new(Snapshot::new()),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Publish one event. Returns false on any I/O or serialization failure;
    /// a publish nobody is listening to still returns true.
    pub async fn publish_event(
        &self,
        event_type: EventType,
        data: Value,
        metadata: Map<String, Value>,
    ) -> bool {
        let envelope = Envelope::new(event_type, &self.config.source, data, metadata);
        self.publish_envelope(&envelope).await.is_ok()
    }

    /// Publish a prepared envelope. The `Result` form of
    /// [`publish_event`](Self::publish_event).
    pub async fn publish_envelope(&self, envelope: &Envelope) -> Result<(), PublishError> {
        match self.try_publish(envelope).await {
            Ok(receivers) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event_type = %envelope.event_type,
                    message_id = %envelope.message_id,
                    receivers,
                    "Published event"
                );
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_type = %envelope.event_type,
                    message_id = %envelope.message_id,
                    error = %e,
                    "Failed to publish event"
                );
                Err(e)
            }
        }
    }

    async fn try_publish(&self, envelope: &Envelope) -> Result<usize, PublishError> {
        if !self.config.enabled {
            return Err(PublishError::Disabled);
        }
        let kind = envelope.kind()?;
        let body = envelope.to_json()?;
        let fields = envelope.flatten()?;

        let Some(conn) = self.connection.connection().await else {
            return Err(PublishError::Unavailable(self.connection.last_error().await));
        };

        let mut receivers = 0;
        for channel in self.names.targets(kind) {
            match conn.publish(&channel, &body).await {
                Ok(n) => receivers += n,
                Err(e) => {
                    self.connection.mark_failed(&e).await;
                    return Err(e.into());
                }
            }
        }

        let key = self.names.stream_key(kind);
        if let Err(e) = conn
            .append_stream(&key, &fields, self.config.stream_max_len)
            .await
        {
            self.connection.mark_failed(&e).await;
            return Err(e.into());
        }

        Ok(receivers)
    }

    /// Diff `matches` against the previous call and publish the result.
    ///
    /// Emits one event per non-empty category (`matches.added`,
    /// `matches.updated`, `matches.removed`) and always a `matches.all`
    /// snapshot. The retained snapshot is replaced after every call, failed
    /// or not, so the next call only reports what changed since this one.
    pub async fn publish_match_events(
        &self,
        matches: Vec<MatchRecord>,
        metadata: Map<String, Value>,
    ) -> bool {
        let mut snapshot = self.snapshot.lock().await;
        let current = index_matches(matches);
        let diff = diff_snapshots(&snapshot, &current);

        let published = match self.emit_match_events(&diff, &current, metadata).await {
            Ok(()) => {
                info!(
                    total = current.len(),
                    added = diff.added.len(),
                    updated = diff.updated.len(),
                    removed = diff.removed.len(),
                    "Published match events"
                );
                true
            }
            Err(e) => {
                warn!(error = %e, "Match events not fully published");
                false
            }
        };
        *snapshot = current;
        published
    }

    async fn emit_match_events(
        &self,
        diff: &MatchDiff,
        current: &Snapshot,
        mut metadata: Map<String, Value>,
    ) -> Result<(), PublishError> {
        metadata.insert("has_changes".into(), json!(diff.has_changes()));
        metadata.insert("added".into(), json!(diff.added.len()));
        metadata.insert("updated".into(), json!(diff.updated.len()));
        metadata.insert("removed".into(), json!(diff.removed.len()));

        if !diff.added.is_empty() {
            let payload = json!({ "matches": diff.added, "count": diff.added.len() });
            self.emit(EventType::MatchesAdded, payload, &metadata).await?;
        }
        if !diff.updated.is_empty() {
            let payload = json!({
                "matches": diff.updated,
                "count": diff.updated.len(),
                "changes": diff.changes,
            });
            self.emit(EventType::MatchesUpdated, payload, &metadata).await?;
        }
        if !diff.removed.is_empty() {
            let payload = json!({ "matches": diff.removed, "count": diff.removed.len() });
            self.emit(EventType::MatchesRemoved, payload, &metadata).await?;
        }

        let all: Vec<&MatchRecord> = current.values().collect();
        let payload = json!({ "matches": all, "count": all.len() });
        self.emit(EventType::MatchesSnapshot, payload, &metadata).await
    }

    async fn emit(
        &self,
        event_type: EventType,
        payload: Value,
        metadata: &Map<String, Value>,
    ) -> Result<(), PublishError> {
        let envelope = Envelope::new(event_type, &self.config.source, payload, metadata.clone());
        self.publish_envelope(&envelope).await
    }

    /// `system.processing_status` for operators watching a run.
    pub async fn publish_status(&self, stage: &str, detail: Value) -> bool {
        let payload = json!({ "stage": stage, "detail": detail });
        self.publish_event(EventType::ProcessingStatus, payload, Map::new())
            .await
    }

    /// `system.alert` at the given severity.
    pub async fn publish_alert(&self, level: AlertLevel, message: &str) -> bool {
        let payload = json!({ "level": level, "message": message });
        self.publish_event(EventType::SystemAlert, payload, Map::new())
            .await
    }

    /// `service.started` / `service.stopped` for this publisher's source.
    pub async fn publish_lifecycle(&self, started: bool) -> bool {
        let kind = if started {
            EventType::ServiceStarted
        } else {
            EventType::ServiceStopped
        };
        let payload = json!({ "service": self.config.source });
        self.publish_event(kind, payload, Map::new()).await
    }

    /// Number of records in the retained snapshot.
    pub async fn snapshot_len(&self) -> usize {
        self.snapshot.lock().await.len()
    }

    pub fn stats(&self) -> PublishStats {
        PublishStats {
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub fn channel_names(&self) -> &ChannelNames {
        &self.names
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    /// Length of the stream events of `event_type` are appended to.
    pub async fn stream_len(&self, event_type: EventType) -> Option<usize> {
        let conn = self.connection.connection().await?;
        conn.stream_len(&self.names.stream_key(event_type)).await.ok()
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConnection, Frame, FrameStream, MemoryBroker};
    use std::time::Duration;

    fn config() -> MessagingConfig {
        let mut config = MessagingConfig::new("test-producer");
        config.namespace = "t".into();
        config.connection.retry_delay = Duration::from_millis(5);
        config
    }

    fn record(id: u64, venue: &str) -> MatchRecord {
        MatchRecord {
            venue: venue.into(),
            ..MatchRecord::new(id)
        }
    }

    /// Subscribe directly on the broker and collect what a publish produced.
    async fn tap(
        broker: &MemoryBroker,
        channel: &str,
    ) -> (Arc<dyn BrokerConnection>, Box<dyn FrameStream>) {
        let conn = broker.connect().await.unwrap();
        let mut stream = conn.subscribe(&[channel.to_string()]).await.unwrap();
        assert!(matches!(
            stream.next_frame().await.unwrap(),
            Some(Frame::Subscribed { .. })
        ));
        (conn, stream)
    }

    async fn drain(stream: &mut Box<dyn FrameStream>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(Ok(Some(Frame::Message { payload, .. }))) =
            tokio::time::timeout(Duration::from_millis(50), stream.next_frame()).await
        {
            out.push(Envelope::from_json(&payload).unwrap());
        }
        out
    }

    fn types(envelopes: &[Envelope]) -> Vec<&str> {
        envelopes.iter().map(|e| e.event_type.as_str()).collect()
    }

    #[tokio::test]
    async fn test_event_fans_out_to_all_target_channels() {
        let broker = MemoryBroker::new();
        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        let (_c1, mut all) = tap(&broker, "t.events.all").await;
        let (_c2, mut typed) = tap(&broker, "t.events.matches.added").await;
        let (_c3, mut shortcut) = tap(&broker, "t.matches.all").await;

        assert!(
            publisher
                .publish_event(EventType::MatchesAdded, json!({"count": 0}), Map::new())
                .await
        );

        for stream in [&mut all, &mut typed, &mut shortcut] {
            let got = drain(stream).await;
            assert_eq!(types(&got), vec!["matches.added"]);
            assert_eq!(got[0].source, "test-producer");
        }
        assert_eq!(broker.stream_entries("t:events:matches").len(), 1);
    }

    #[tokio::test]
    async fn test_system_events_skip_match_shortcut() {
        let broker = MemoryBroker::new();
        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        let (_c, mut shortcut) = tap(&broker, "t.matches.all").await;

        assert!(publisher.publish_alert(AlertLevel::Warning, "slow").await);
        assert!(drain(&mut shortcut).await.is_empty());
        assert_eq!(broker.stream_entries("t:events:system").len(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let broker = MemoryBroker::new();
        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        assert!(publisher.publish_status("fetch", json!({"pages": 2})).await);
        assert_eq!(publisher.stats(), PublishStats { published: 1, failed: 0 });
    }

    #[tokio::test]
    async fn test_publish_fails_when_broker_down_or_disabled() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        assert!(!publisher.publish_lifecycle(true).await);

        let mut disabled = config();
        disabled.enabled = false;
        let publisher = Publisher::new(Arc::new(MemoryBroker::new()), disabled);
        assert!(!publisher.publish_lifecycle(true).await);
        assert_eq!(publisher.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_match_event_scenarios() {
        let broker = MemoryBroker::new();
        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        let (_c, mut stream) = tap(&broker, "t.matches.all").await;

        // First call: everything is new.
        assert!(publisher.publish_match_events(vec![record(1, "Tele2 Arena")], Map::new()).await);
        let got = drain(&mut stream).await;
        assert_eq!(types(&got), vec!["matches.added", "matches.all"]);
        assert_eq!(got[0].payload["matches"][0]["match_id"], json!(1));
        assert_eq!(got[1].metadata["has_changes"], json!(true));

        // Same list again: snapshot only, flagged unchanged.
        assert!(publisher.publish_match_events(vec![record(1, "Tele2 Arena")], Map::new()).await);
        let got = drain(&mut stream).await;
        assert_eq!(types(&got), vec!["matches.all"]);
        assert_eq!(got[0].metadata["has_changes"], json!(false));

        // Venue moved: exactly one update.
        assert!(publisher.publish_match_events(vec![record(1, "Friends Arena")], Map::new()).await);
        let got = drain(&mut stream).await;
        assert_eq!(types(&got), vec!["matches.updated", "matches.all"]);
        assert_eq!(got[0].payload["count"], json!(1));
        assert_eq!(got[0].payload["matches"][0]["venue"], json!("Friends Arena"));
        assert_eq!(got[0].payload["changes"][0]["fields"], json!(["venue"]));

        // Gone from the source: removed carries the old version.
        assert!(publisher.publish_match_events(vec![], Map::new()).await);
        let got = drain(&mut stream).await;
        assert_eq!(types(&got), vec!["matches.removed", "matches.all"]);
        assert_eq!(got[0].payload["matches"][0]["venue"], json!("Friends Arena"));
        assert_eq!(got[1].payload["count"], json!(0));
        assert_eq!(publisher.snapshot_len().await, 0);
    }

    #[tokio::test]
    async fn test_caller_metadata_is_kept() {
        let broker = MemoryBroker::new();
        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        let (_c, mut stream) = tap(&broker, "t.events.matches.all").await;

        let mut metadata = Map::new();
        metadata.insert("run_id".into(), json!("r-17"));
        assert!(publisher.publish_match_events(vec![record(5, "Borås Arena")], metadata).await);

        let got = drain(&mut stream).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].metadata["run_id"], json!("r-17"));
        assert_eq!(got[0].metadata["added"], json!(1));
    }

    #[tokio::test]
    async fn test_failed_publish_still_replaces_snapshot() {
        let broker = MemoryBroker::new();
        let publisher = Publisher::new(Arc::new(broker.clone()), config());

        broker.set_available(false);
        let list = vec![record(1, "Tele2 Arena")];
        assert!(!publisher.publish_match_events(list.clone(), Map::new()).await);
        assert_eq!(publisher.snapshot_len().await, 1);

        broker.set_available(true);
        let (_c, mut stream) = tap(&broker, "t.matches.all").await;
        assert!(publisher.publish_match_events(list, Map::new()).await);
        // Diffed against the failed call's list: nothing new to announce.
        let events = drain(&mut stream).await;
        assert_eq!(types(&events), vec!["matches.all"]);
        assert!(!events[0].has_changes());
    }

    #[tokio::test]
    async fn test_stream_never_exceeds_cap() {
        let broker = MemoryBroker::new();
        let mut config = config();
        config.stream_max_len = 20;
        let publisher = Publisher::new(Arc::new(broker.clone()), config);

        for i in 0..45 {
            assert!(publisher.publish_status("tick", json!(i)).await);
            assert!(broker.stream_entries("t:events:system").len() <= 20);
        }
        assert_eq!(publisher.stream_len(EventType::ProcessingStatus).await, Some(20));
    }
}
