//! Service-specific glue around the messaging core.
//!
//! - `HttpCalendarSync`: consumer side, pushes snapshots to the calendar service
//! - `MatchFileSource`: producer side, reads the current assignment list
//! - `Producer`: polls the source and publishes through `MatchNotifier`

pub mod calendar;
pub mod producer;
pub mod source;

pub use calendar::{HttpCalendarSync, LoggingCalendarSync};
pub use producer::Producer;
