//! The standard event envelope and the closed event catalog.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use uuid::Uuid;

/// Schema version stamped on every envelope.
pub const ENVELOPE_VERSION: &str = "1.0";

/// Fields that must be present before an envelope is dispatched.
///
/// `metadata` is free-form and defaults to an empty object when absent.
pub const REQUIRED_FIELDS: [&str; 6] = [
    "message_id",
    "timestamp",
    "source",
    "version",
    "type",
    "payload",
];

/// Every event kind the system knows about.
///
/// Adding a kind is a compile-time decision: the dispatcher matches on this
/// enum exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "matches.added")]
    MatchesAdded,
    #[serde(rename = "matches.updated")]
    MatchesUpdated,
    #[serde(rename = "matches.removed")]
    MatchesRemoved,
    /// Full snapshot of the current match list, emitted on every publish.
    #[serde(rename = "matches.all")]
    MatchesSnapshot,
    #[serde(rename = "system.processing_status")]
    ProcessingStatus,
    #[serde(rename = "system.alert")]
    SystemAlert,
    #[serde(rename = "system.health_check")]
    HealthCheck,
    #[serde(rename = "service.started")]
    ServiceStarted,
    #[serde(rename = "service.stopped")]
    ServiceStopped,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::MatchesAdded,
        EventType::MatchesUpdated,
        EventType::MatchesRemoved,
        EventType::MatchesSnapshot,
        EventType::ProcessingStatus,
        EventType::SystemAlert,
        EventType::HealthCheck,
        EventType::ServiceStarted,
        EventType::ServiceStopped,
    ];

    pub const MATCH_EVENTS: [EventType; 4] = [
        EventType::MatchesAdded,
        EventType::MatchesUpdated,
        EventType::MatchesRemoved,
        EventType::MatchesSnapshot,
    ];

    /// The dot-namespaced wire name, e.g. `matches.updated`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MatchesAdded => "matches.added",
            EventType::MatchesUpdated => "matches.updated",
            EventType::MatchesRemoved => "matches.removed",
            EventType::MatchesSnapshot => "matches.all",
            EventType::ProcessingStatus => "system.processing_status",
            EventType::SystemAlert => "system.alert",
            EventType::HealthCheck => "system.health_check",
            EventType::ServiceStarted => "service.started",
            EventType::ServiceStopped => "service.stopped",
        }
    }

    /// The category prefix used to pick a stream, e.g. `matches`.
    pub fn prefix(&self) -> &'static str {
        let name = self.as_str();
        match name.split_once('.') {
            Some((prefix, _)) => prefix,
            None => name,
        }
    }

    /// Whether this is one of the `matches.*` lifecycle events.
    pub fn is_match_event(&self) -> bool {
        self.prefix() == "matches"
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a wire `type` is not part of the catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// Severity carried in the payload of a `system.alert` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    /// Reads `payload.level`; anything missing or unknown is `Info`.
    pub fn from_payload(payload: &Value) -> Self {
        payload
            .get("level")
            .cloned()
            .and_then(|level| serde_json::from_value(level).ok())
            .unwrap_or_default()
    }
}

/// Why an incoming message could not be turned into an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("payload is not valid UTF-8: {0}")]
    InvalidEncoding(String),

    #[error("envelope must be a JSON object")]
    NotAnObject,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    /// The offending field, if the error is about a specific one.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ValidationError::MissingField(field) | ValidationError::InvalidField { field, .. } => {
                Some(*field)
            }
            _ => None,
        }
    }
}

/// Standard JSON wrapper around every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub timestamp: String,
    pub source: String,
    pub version: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Envelope {
    /// Build a fresh envelope with a new message id and the current time.
    pub fn new(
        event_type: EventType,
        source: impl Into<String>,
        payload: Value,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            timestamp: super::now_rfc3339(),
            source: source.into(),
            version: ENVELOPE_VERSION.to_string(),
            event_type: event_type.as_str().to_string(),
            payload,
            metadata,
        }
    }

    /// Parse and validate a raw wire message.
    pub fn from_json(text: &str) -> Result<Self, ValidationError> {
        Self::from_value(Self::parse_value(text)?)
    }

    /// First validation step: the text must be a JSON object.
    pub fn parse_value(text: &str) -> Result<Value, ValidationError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ValidationError::MalformedJson(e.to_string()))?;
        if !value.is_object() {
            return Err(ValidationError::NotAnObject);
        }
        Ok(value)
    }

    /// Second validation step: required-field and type checks.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(mut object) = value else {
            return Err(ValidationError::NotAnObject);
        };

        for field in REQUIRED_FIELDS {
            if !object.contains_key(field) {
                return Err(ValidationError::MissingField(field));
            }
        }

        let metadata = match object.remove("metadata") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(ValidationError::InvalidField {
                    field: "metadata",
                    reason: format!("expected object, got {}", json_kind(&other)),
                });
            }
        };

        Ok(Self {
            message_id: take_string(&mut object, "message_id")?,
            timestamp: take_string(&mut object, "timestamp")?,
            source: take_string(&mut object, "source")?,
            version: take_string(&mut object, "version")?,
            event_type: take_string(&mut object, "type")?,
            payload: object.remove("payload").unwrap_or(Value::Null),
            metadata,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Resolve the wire `type` against the catalog.
    pub fn kind(&self) -> Result<EventType, UnknownEventType> {
        self.event_type.parse()
    }

    /// `metadata.has_changes`, treating an absent flag as `true`.
    pub fn has_changes(&self) -> bool {
        self.metadata
            .get("has_changes")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// Flat field/value pairs for appending to a stream.
    ///
    /// Payload and metadata are JSON-encoded so each entry stays a plain
    /// string map.
    pub fn flatten(&self) -> Result<Vec<(String, String)>, serde_json::Error> {
        Ok(vec![
            ("message_id".to_string(), self.message_id.clone()),
            ("timestamp".to_string(), self.timestamp.clone()),
            ("source".to_string(), self.source.clone()),
            ("version".to_string(), self.version.clone()),
            ("type".to_string(), self.event_type.clone()),
            ("payload".to_string(), serde_json::to_string(&self.payload)?),
            ("metadata".to_string(), serde_json::to_string(&self.metadata)?),
        ])
    }
}

fn take_string(
    object: &mut Map<String, Value>,
    field: &'static str,
) -> Result<String, ValidationError> {
    match object.remove(field) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(ValidationError::InvalidField {
            field,
            reason: format!("expected string, got {}", json_kind(&other)),
        }),
        None => Err(ValidationError::MissingField(field)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
