use refsync_sdk::objects::{Envelope, UnknownEventType, ValidationError};
use serde::Serialize;
use thiserror::Error;

use crate::processors::CalendarSyncError;

/// Why a handler could not process an envelope.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid envelope: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    UnknownType(#[from] UnknownEventType),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("calendar sync failed: {0}")]
    Sync(#[from] CalendarSyncError),

    #[error("calendar sync reported failure")]
    SyncRejected,

    #[error("handler panicked")]
    Panicked,
}

/// Result of handling one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub success: bool,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchOutcome {
    pub fn succeeded(envelope: &Envelope) -> Self {
        Self {
            success: true,
            event_type: Some(envelope.event_type.clone()),
            message_id: Some(envelope.message_id.clone()),
            error: None,
        }
    }

    pub fn failed(
        event_type: Option<String>,
        message_id: Option<String>,
        error: impl std::fmt::Display,
    ) -> Self {
        Self {
            success: false,
            event_type,
            message_id,
            error: Some(error.to_string()),
        }
    }

    pub fn failed_for(envelope: &Envelope, error: impl std::fmt::Display) -> Self {
        Self::failed(
            Some(envelope.event_type.clone()),
            Some(envelope.message_id.clone()),
            error,
        )
    }
}
