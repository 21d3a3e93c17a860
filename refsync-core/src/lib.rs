#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod broker;
pub mod config;
pub mod connection;
pub mod events;
pub mod harness;
pub mod processors;
pub mod publisher;
pub mod subscriber;
