//! Operator-facing status of a messaging participant.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStats {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
}

/// Snapshot returned by status endpoints and the `status` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub enabled: bool,
    pub connected: bool,
    pub subscribed_channels: Vec<String>,
    pub last_error: Option<String>,
    pub stats: MessageStats,
}
