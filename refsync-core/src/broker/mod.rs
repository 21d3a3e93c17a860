//! Broker abstraction.
//!
//! The messaging core never talks to a concrete broker directly. A
//! [`Connector`] opens [`BrokerConnection`]s; a connection publishes,
//! appends to capped streams and opens [`FrameStream`] subscriptions.
//!
//! - [`memory::MemoryBroker`]: in-process broker for tests, the monitoring
//!   harness and single-process deployments. Can simulate outages.
//! - [`redis::RedisConnector`] (feature `redis`): Redis pub/sub + streams.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryBroker;

/// Connection-level failures. Never crosses the messaging API boundary;
/// callers see these only as an "unavailable" status and a `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker operation timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("broker command failed: {0}")]
    Command(String),
}

/// One item read from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The broker confirmed a channel subscription.
    Subscribed { channel: String },
    /// A published message.
    Message { channel: String, payload: String },
    /// A message whose body is not valid UTF-8.
    Undecodable { channel: String, reason: String },
}

impl Frame {
    /// Frame for a message body as read off the wire.
    pub fn from_bytes(channel: String, payload: Vec<u8>) -> Self {
        match String::from_utf8(payload) {
            Ok(payload) => Frame::Message { channel, payload },
            Err(e) => Frame::Undecodable {
                channel,
                reason: e.utf8_error().to_string(),
            },
        }
    }
}

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;

    /// Human-readable target for logs, without credentials.
    fn describe(&self) -> String;
}

/// A live handle to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn ping(&self) -> Result<(), BrokerError>;

    /// Publish to one channel. Returns the number of receivers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError>;

    /// Append an entry to a stream, trimming it to roughly `max_len`
    /// entries (oldest first). Returns the entry id.
    async fn append_stream(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: usize,
    ) -> Result<String, BrokerError>;

    async fn stream_len(&self, key: &str) -> Result<usize, BrokerError>;

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn FrameStream>, BrokerError>;

    /// Release the handle. Safe to call more than once.
    async fn close(&self);
}

/// Receiving side of a subscription.
///
/// `next_frame` must be cancel-safe: the receive loop races it against a
/// timeout and drops the future when the timeout wins.
#[async_trait]
pub trait FrameStream: Send {
    /// `Ok(None)` once the subscription has ended.
    async fn next_frame(&mut self) -> Result<Option<Frame>, BrokerError>;
}
