//! Redis backend: pub/sub for delivery, streams (`XADD MAXLEN ~`) for the
//! capped event log.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use redis::AsyncCommands;
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::streams::StreamMaxlen;

use super::{BrokerConnection, BrokerError, Connector, Frame, FrameStream};
use crate::config::DEFAULT_CONNECT_TIMEOUT;

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() {
            BrokerError::Timeout
        } else if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
            BrokerError::Unavailable(e.to_string())
        } else {
            BrokerError::Command(e.to_string())
        }
    }
}

/// Opens multiplexed Redis connections.
#[derive(Clone)]
pub struct RedisConnector {
    client: redis::Client,
    timeout: Duration,
}

impl RedisConnector {
    /// Parse the URL without connecting.
    pub fn new(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url).map_err(|e| BrokerError::Command(e.to_string()))?;
        Ok(Self {
            client,
            timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Bound on connecting and on every command response.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let conn = self
            .client
            .get_multiplexed_async_connection_with_timeouts(self.timeout, self.timeout)
            .await?;
        Ok(Arc::new(RedisConnection {
            client: self.client.clone(),
            conn,
            timeout: self.timeout,
        }))
    }

    fn describe(&self) -> String {
        let info = self.client.get_connection_info();
        format!("redis://{}/{}", info.addr, info.redis.db)
    }
}

struct RedisConnection {
    client: redis::Client,
    conn: MultiplexedConnection,
    timeout: Duration,
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.req_packed_command(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError> {
        let mut conn = self.conn.clone();
        let receivers: usize = conn.publish(channel, payload).await?;
        Ok(receivers)
    }

    async fn append_stream(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: usize,
    ) -> Result<String, BrokerError> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd_maxlen(key, StreamMaxlen::Approx(max_len), "*", fields)
            .await?;
        Ok(id)
    }

    async fn stream_len(&self, key: &str) -> Result<usize, BrokerError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.xlen(key).await?;
        Ok(len)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn FrameStream>, BrokerError> {
        // Pub/sub needs its own connection; the multiplexed one stays usable.
        let mut pubsub = tokio::time::timeout(self.timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| BrokerError::Timeout)??;
        let mut acks = VecDeque::with_capacity(channels.len());
        for channel in channels {
            pubsub.subscribe(channel).await?;
            acks.push_back(Frame::Subscribed {
                channel: channel.clone(),
            });
        }
        Ok(Box::new(RedisFrameStream {
            acks,
            messages: Box::pin(pubsub.into_on_message()),
        }))
    }

    async fn close(&self) {
        // Multiplexed connections close when the last clone is dropped.
    }
}

struct RedisFrameStream {
    acks: VecDeque<Frame>,
    messages: Pin<Box<dyn Stream<Item = redis::Msg> + Send>>,
}

#[async_trait]
impl FrameStream for RedisFrameStream {
    async fn next_frame(&mut self) -> Result<Option<Frame>, BrokerError> {
        if let Some(ack) = self.acks.pop_front() {
            return Ok(Some(ack));
        }
        Ok(self.messages.next().await.map(|msg| {
            Frame::from_bytes(
                msg.get_channel_name().to_string(),
                msg.get_payload_bytes().to_vec(),
            )
        }))
    }
}
