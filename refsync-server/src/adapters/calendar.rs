//! Calendar sync collaborators for the consumer.

use std::time::Duration;

use async_trait::async_trait;
use refsync_core::processors::{CalendarSync, CalendarSyncError};
use refsync_sdk::objects::MatchRecord;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};
use url::Url;

#[derive(Serialize)]
struct SyncRequest<'a> {
    matches: &'a [MatchRecord],
    metadata: &'a Map<String, Value>,
}

/// POSTs `{matches, metadata}` to the calendar service.
///
/// A 2xx answer counts as success unless its JSON body says
/// `"success": false`. Other statuses are reported as a failed sync, not an
/// error, so the dispatcher records them the same way.
pub struct HttpCalendarSync {
    http: reqwest::Client,
    url: Url,
}

impl HttpCalendarSync {
    pub fn new(url: Url) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            url,
        }
    }
}

#[async_trait]
impl CalendarSync for HttpCalendarSync {
    async fn sync_matches(
        &self,
        matches: Vec<MatchRecord>,
        metadata: &Map<String, Value>,
    ) -> Result<bool, CalendarSyncError> {
        let resp = self
            .http
            .post(self.url.clone())
            .json(&SyncRequest {
                matches: &matches,
                metadata,
            })
            .send()
            .await
            .map_err(|e| CalendarSyncError::Request(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!(status = status.as_u16(), body = %body, "Calendar service rejected sync");
            return Ok(false);
        }

        let reported = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("success").and_then(Value::as_bool))
            .unwrap_or(true);
        Ok(reported)
    }
}

/// Used when no calendar service is configured: logs and succeeds.
pub struct LoggingCalendarSync;

#[async_trait]
impl CalendarSync for LoggingCalendarSync {
    async fn sync_matches(
        &self,
        matches: Vec<MatchRecord>,
        _metadata: &Map<String, Value>,
    ) -> Result<bool, CalendarSyncError> {
        info!(count = matches.len(), "No calendar service configured, snapshot only logged");
        Ok(true)
    }
}
