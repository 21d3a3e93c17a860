//! Handler-side event types.
//!
//! # Event Flow
//!
//! 1. `Publisher` wraps domain data in an `Envelope` and publishes it to the
//!    all-events, type-specific and (for match events) domain channels
//! 2. `Subscriber` receives the frame, validates the envelope and looks up
//!    the [`EventHandler`] registered for its `EventType`
//! 3. The handler (usually `MessageDispatcher`) returns a [`DispatchOutcome`]
//!    that the subscriber folds into its statistics
//!
//! Delivery is at-most-once per live subscriber. Nothing a handler does can
//! stop the receive loop.

pub mod handler;
pub mod outcome;

pub use handler::EventHandler;
pub use outcome::{DispatchOutcome, HandlerError};
