//! MessageDispatcher: per-type processing of validated envelopes.
//!
//! - `matches.all` with changes -> injected [`CalendarSync`] callback
//! - other `matches.*` -> counted and logged (the snapshot supersedes them)
//! - `system.processing_status` -> bounded history for operators
//! - `system.alert` -> logged at the level named in the payload
//! - health probes and service lifecycle -> logged
//!
//! Nothing here returns an error to the caller: every failure is folded into
//! a [`DispatchOutcome`] and the statistics.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kanau::processor::Processor;
use refsync_sdk::objects::{AlertLevel, Envelope, EventType, MatchRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::events::{DispatchOutcome, EventHandler, HandlerError};

/// Entries kept in the processing-status history.
pub const STATUS_HISTORY_LEN: usize = 100;

/// Failures reported by the calendar sync collaborator.
#[derive(Debug, Error)]
pub enum CalendarSyncError {
    #[error("calendar sync request failed: {0}")]
    Request(String),

    #[error("calendar sync rejected the update: {0}")]
    Rejected(String),
}

/// Pushes the current match list into the calendar. Implemented outside the
/// messaging core (HTTP call to the calendar service, or a test double).
#[async_trait]
pub trait CalendarSync: Send + Sync {
    /// `Ok(false)` means the collaborator ran but reported failure.
    async fn sync_matches(
        &self,
        matches: Vec<MatchRecord>,
        metadata: &Map<String, Value>,
    ) -> Result<bool, CalendarSyncError>;
}

/// One `system.processing_status` event kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub message_id: String,
    pub timestamp: String,
    pub source: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Snapshots that carried `has_changes: false`.
    pub skipped_no_changes: u64,
    pub sync_invocations: u64,
    pub alerts: u64,
    pub last_error: Option<String>,
}

/// Routes envelopes by [`EventType`] with an exhaustive match.
pub struct MessageDispatcher {
    calendar_sync: Arc<dyn CalendarSync>,
    history: Mutex<VecDeque<StatusEntry>>,
    stats: Mutex<DispatcherStats>,
}

impl MessageDispatcher {
    pub fn new(calendar_sync: Arc<dyn CalendarSync>) -> Self {
        Self {
            calendar_sync,
            history: Mutex::new(VecDeque::with_capacity(STATUS_HISTORY_LEN)),
            stats: Mutex::new(DispatcherStats::default()),
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.lock_stats().clone()
    }

    /// Processing-status history, oldest first.
    pub fn status_history(&self) -> Vec<StatusEntry> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn lock_stats(&self) -> MutexGuard<'_, DispatcherStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle one envelope whose type is already resolved.
    pub async fn dispatch(&self, kind: EventType, envelope: Envelope) -> DispatchOutcome {
        let outcome = match self.route(kind, &envelope).await {
            Ok(()) => DispatchOutcome::succeeded(&envelope),
            Err(e) => {
                warn!(
                    event_type = %kind,
                    message_id = %envelope.message_id,
                    error = %e,
                    "Dispatch failed"
                );
                DispatchOutcome::failed_for(&envelope, &e)
            }
        };
        self.record(&outcome);
        outcome
    }

    fn record(&self, outcome: &DispatchOutcome) {
        let mut stats = self.lock_stats();
        stats.processed += 1;
        if outcome.success {
            stats.succeeded += 1;
        } else {
            stats.failed += 1;
            stats.last_error = outcome.error.clone();
        }
    }

    async fn route(&self, kind: EventType, envelope: &Envelope) -> Result<(), HandlerError> {
        match kind {
            EventType::MatchesSnapshot => self.sync_snapshot(envelope).await,
            EventType::MatchesAdded | EventType::MatchesUpdated | EventType::MatchesRemoved => {
                let count = envelope
                    .payload
                    .get("count")
                    .and_then(Value::as_u64)
                    .unwrap_or_default();
                info!(
                    event_type = %kind,
                    count,
                    source = %envelope.source,
                    "Match change received"
                );
                Ok(())
            }
            EventType::ProcessingStatus => {
                self.push_status(envelope);
                Ok(())
            }
            EventType::SystemAlert => {
                self.log_alert(envelope);
                Ok(())
            }
            EventType::HealthCheck => {
                debug!(message_id = %envelope.message_id, "Health probe received");
                Ok(())
            }
            EventType::ServiceStarted | EventType::ServiceStopped => {
                info!(event_type = %kind, source = %envelope.source, "Service lifecycle event");
                Ok(())
            }
        }
    }

    async fn sync_snapshot(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        if !envelope.has_changes() {
            self.lock_stats().skipped_no_changes += 1;
            debug!(message_id = %envelope.message_id, "No match changes, calendar sync skipped");
            return Ok(());
        }

        let matches: Vec<MatchRecord> = match envelope.payload.get("matches") {
            Some(list) => serde_json::from_value(list.clone())?,
            None => Vec::new(),
        };
        let count = matches.len();

        self.lock_stats().sync_invocations += 1;
        info!(count, message_id = %envelope.message_id, "Triggering calendar sync");

        match self
            .calendar_sync
            .sync_matches(matches, &envelope.metadata)
            .await
        {
            Ok(true) => {
                info!(count, "Calendar sync completed");
                Ok(())
            }
            Ok(false) => Err(HandlerError::SyncRejected),
            Err(e) => Err(e.into()),
        }
    }

    fn push_status(&self, envelope: &Envelope) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() == STATUS_HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(StatusEntry {
            message_id: envelope.message_id.clone(),
            timestamp: envelope.timestamp.clone(),
            source: envelope.source.clone(),
            payload: envelope.payload.clone(),
        });
    }

    fn log_alert(&self, envelope: &Envelope) {
        self.lock_stats().alerts += 1;
        let message = envelope
            .payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("(no message)");
        let source = envelope.source.as_str();
        match AlertLevel::from_payload(&envelope.payload) {
            AlertLevel::Critical | AlertLevel::Error => error!(source, "System alert: {message}"),
            AlertLevel::Warning => warn!(source, "System alert: {message}"),
            AlertLevel::Info => info!(source, "System alert: {message}"),
            AlertLevel::Debug => debug!(source, "System alert: {message}"),
        }
    }
}

#[async_trait]
impl EventHandler for MessageDispatcher {
    async fn handle(&self, kind: EventType, envelope: Envelope) -> DispatchOutcome {
        self.dispatch(kind, envelope).await
    }
}

/// Standalone entry point for envelopes that have not been resolved against
/// the catalog yet (e.g. replayed from the stream).
impl Processor<Envelope> for MessageDispatcher {
    type Output = DispatchOutcome;
    type Error = Infallible;

    async fn process(&self, envelope: Envelope) -> Result<DispatchOutcome, Infallible> {
        match envelope.kind() {
            Ok(kind) => Ok(self.dispatch(kind, envelope).await),
            Err(e) => {
                let outcome = DispatchOutcome::failed_for(&envelope, &e);
                self.record(&outcome);
                Ok(outcome)
            }
        }
    }
}
