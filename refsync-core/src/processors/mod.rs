//! Consumers of the event flow.
//!
//! - `MessageDispatcher`: routes validated envelopes by type, drives calendar sync
//! - `MatchNotifier`: producer side, publishes match lists or falls back to HTTP

pub mod dispatcher;
pub mod notifier;

pub use dispatcher::{
    CalendarSync, CalendarSyncError, DispatcherStats, MessageDispatcher, STATUS_HISTORY_LEN,
    StatusEntry,
};
pub use notifier::{FallbackSink, MatchNotifier, NotifyOutcome};
