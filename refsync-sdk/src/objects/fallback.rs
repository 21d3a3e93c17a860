//! Degraded-mode notification sent over HTTP when pub/sub is unavailable.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::matches::MatchRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackPayload {
    pub matches: Vec<MatchRecord>,
    pub timestamp: String,
    pub source: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl FallbackPayload {
    pub fn new(
        matches: Vec<MatchRecord>,
        source: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            matches,
            timestamp: super::now_rfc3339(),
            source: source.into(),
            metadata,
        }
    }
}
