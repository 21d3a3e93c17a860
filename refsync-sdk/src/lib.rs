//! Shared wire types for the refsync event layer.
//!
//! Every service that publishes or consumes match-assignment events depends
//! on this crate, so the envelope schema, the event catalog and the channel
//! naming rules are defined exactly once.

pub mod naming;
pub mod objects;

#[cfg(feature = "client")]
pub mod client;
