pub mod envelope;
pub mod fallback;
pub mod matches;
pub mod status;

pub use envelope::{
    AlertLevel, ENVELOPE_VERSION, Envelope, EventType, REQUIRED_FIELDS, UnknownEventType,
    ValidationError,
};
pub use fallback::FallbackPayload;
pub use matches::{MatchId, MatchRecord, Referee, TRACKED_FIELDS};
pub use status::{MessageStats, StatusReport};

/// Current UTC time as an RFC 3339 string.
///
/// Falls back to the unix timestamp if formatting fails, which only happens
/// for dates outside the four-digit year range.
pub fn now_rfc3339() -> String {
    let now = time::OffsetDateTime::now_utc();
    now.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}
