//! In-process broker.
//!
//! Implements the same pub/sub and capped-stream semantics as the Redis
//! backend, so the whole messaging core can run without infrastructure.
//! [`MemoryBroker::set_available`] simulates an outage: while unavailable,
//! every connection attempt fails, existing connections start failing, and
//! open subscriptions end.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{BrokerConnection, BrokerError, Connector, Frame, FrameStream};

/// Shared in-memory broker. Cloning yields another handle to the same hub.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    hub: Arc<Hub>,
}

#[derive(Default)]
struct Hub {
    unavailable: AtomicBool,
    /// Bumped on every outage so connections opened before it go stale.
    generation: AtomicU64,
    state: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    subscribers: Vec<SubscriberSlot>,
    streams: HashMap<String, VecDeque<StreamEntry>>,
    next_entry: u64,
}

struct SubscriberSlot {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<Frame>,
}

/// One stream entry as stored by the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

impl Hub {
    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, generation: u64) -> Result<(), BrokerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("memory broker is down".into()));
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn deliver(&self, channel: &str, payload: &str) -> usize {
        self.deliver_with(channel, || Frame::Message {
            channel: channel.to_string(),
            payload: payload.to_string(),
        })
    }

    fn deliver_with(&self, channel: &str, frame: impl Fn() -> Frame) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|slot| !slot.tx.is_closed());
        let mut delivered = 0;
        for slot in state.subscribers.iter().filter(|slot| slot.channels.contains(channel)) {
            if slot.tx.send(frame()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the broker up or down.
    ///
    /// Going down ends every open subscription and invalidates every open
    /// connection; clients have to reconnect once it is back up.
    pub fn set_available(&self, available: bool) {
        let was_unavailable = self.hub.unavailable.swap(!available, Ordering::SeqCst);
        if !available && !was_unavailable {
            self.hub.generation.fetch_add(1, Ordering::SeqCst);
            self.hub.lock().subscribers.clear();
            debug!("memory broker went down");
        } else if available && was_unavailable {
            debug!("memory broker is back up");
        }
    }

    pub fn is_available(&self) -> bool {
        !self.hub.unavailable.load(Ordering::SeqCst)
    }

    /// Deliver a raw payload, bypassing any connection. Returns the number
    /// of receivers.
    pub fn inject(&self, channel: &str, payload: &str) -> usize {
        self.hub.deliver(channel, payload)
    }

    /// Like [`inject`](Self::inject), for bodies that may not be UTF-8.
    pub fn inject_bytes(&self, channel: &str, payload: &[u8]) -> usize {
        self.hub.deliver_with(channel, || {
            Frame::from_bytes(channel.to_string(), payload.to_vec())
        })
    }

    /// Number of live subscriptions listening on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.hub
            .lock()
            .subscribers
            .iter()
            .filter(|slot| !slot.tx.is_closed() && slot.channels.contains(channel))
            .count()
    }

    /// Copy of a stream's current entries, oldest first.
    pub fn stream_entries(&self, key: &str) -> Vec<StreamEntry> {
        self.hub
            .lock()
            .streams
            .get(key)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let generation = self.hub.generation.load(Ordering::SeqCst);
        self.hub.check(generation)?;
        Ok(Arc::new(MemoryConnection {
            hub: Arc::clone(&self.hub),
            generation,
            closed: AtomicBool::new(false),
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryConnection {
    hub: Arc<Hub>,
    generation: u64,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn check(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.hub.check(self.generation)
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn ping(&self) -> Result<(), BrokerError> {
        self.check()
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError> {
        self.check()?;
        Ok(self.hub.deliver(channel, payload))
    }

    async fn append_stream(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: usize,
    ) -> Result<String, BrokerError> {
        self.check()?;
        let mut state = self.hub.lock();
        state.next_entry += 1;
        let id = format!("{}-0", state.next_entry);
        let entries = state.streams.entry(key.to_string()).or_default();
        entries.push_back(StreamEntry {
            id: id.clone(),
            fields: fields.to_vec(),
        });
        while entries.len() > max_len.max(1) {
            entries.pop_front();
        }
        Ok(id)
    }

    async fn stream_len(&self, key: &str) -> Result<usize, BrokerError> {
        self.check()?;
        Ok(self.hub.lock().streams.get(key).map_or(0, VecDeque::len))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn FrameStream>, BrokerError> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        for channel in channels {
            // The receiver is alive right here, so this cannot fail.
            let _ = tx.send(Frame::Subscribed {
                channel: channel.clone(),
            });
        }
        self.hub.lock().subscribers.push(SubscriberSlot {
            channels: channels.iter().cloned().collect(),
            tx,
        });
        Ok(Box::new(MemoryFrameStream { rx }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MemoryFrameStream {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameStream for MemoryFrameStream {
    async fn next_frame(&mut self) -> Result<Option<Frame>, BrokerError> {
        Ok(self.rx.recv().await)
    }
}
