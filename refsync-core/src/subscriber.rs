//! Subscriber: one background receive loop per instance.
//!
//! The loop races a bounded-timeout receive against the shutdown signal, so
//! a stop request is seen within one `receive_timeout`. A broken
//! subscription (broker outage) is re-established on the same channels once
//! the broker is reachable again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures_util::FutureExt;
use refsync_sdk::naming::ChannelNames;
use refsync_sdk::objects::{Envelope, EventType, MessageStats, StatusReport, ValidationError};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, Connector, Frame, FrameStream};
use crate::config::MessagingConfig;
use crate::connection::ConnectionManager;
use crate::events::{DispatchOutcome, EventHandler, HandlerError};

/// Message ids remembered for duplicate suppression. A match event arrives
/// once on the shortcut channel and once on the all-events channel.
const RECENT_IDS: usize = 256;

type HandlerMap = HashMap<EventType, Arc<dyn EventHandler>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    pub total_messages: u64,
    pub successful_messages: u64,
    pub failed_messages: u64,
    /// Valid envelopes of a type nobody registered for.
    pub dropped_messages: u64,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Shared {
    running: AtomicBool,
    stats: Mutex<SubscriptionStats>,
    channels: Mutex<Vec<String>>,
}

impl Shared {
    fn stats(&self) -> MutexGuard<'_, SubscriptionStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_channels(&self, channels: Vec<String>) {
        *self.channels.lock().unwrap_or_else(PoisonError::into_inner) = channels;
    }

    fn channels(&self) -> Vec<String> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct RunningTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Receives envelopes and hands them to registered [`EventHandler`]s.
pub struct Subscriber {
    connection: Arc<ConnectionManager>,
    config: MessagingConfig,
    names: ChannelNames,
    handlers: Arc<RwLock<HandlerMap>>,
    shared: Arc<Shared>,
    task: tokio::sync::Mutex<Option<RunningTask>>,
}

impl Subscriber {
    pub fn new(connector: Arc<dyn Connector>, config: MessagingConfig) -> Self {
        Self {
            connection: Arc::new(ConnectionManager::new(
                "subscriber",
                connector,
                config.connection,
            )),
            names: config.channel_names(),
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            shared: Arc::new(Shared::default()),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Route `event_type` to `handler`, replacing any previous registration.
    /// Takes effect immediately, also on a running loop.
    pub fn register_handler(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_type, handler);
        debug!(event_type = %event_type, "Registered handler");
    }

    /// Register one handler for every `matches.*` type.
    pub fn register_match_handler(&self, handler: Arc<dyn EventHandler>) {
        for event_type in EventType::MATCH_EVENTS {
            self.register_handler(event_type, Arc::clone(&handler));
        }
    }

    /// Spawn the receive loop on `channels` (default: the match shortcut
    /// channel plus the all-events channel).
    ///
    /// Returns false when messaging is disabled, a loop is already running,
    /// or the broker cannot be reached right now.
    pub async fn start_subscription(&self, channels: Option<Vec<String>>) -> bool {
        if !self.config.enabled {
            warn!("Messaging disabled, not starting subscription");
            return false;
        }

        let mut task = self.task.lock().await;
        if self.shared.running.load(Ordering::SeqCst) {
            warn!("Subscription already running, ignoring start request");
            return false;
        }

        if !self.connection.ensure_connection().await {
            let error = self.connection.last_error().await;
            warn!(
                error = error.as_deref().unwrap_or("unknown"),
                "Cannot start subscription, broker unavailable"
            );
            return false;
        }

        let channels = channels.unwrap_or_else(|| self.names.default_subscription());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            connection: Arc::clone(&self.connection),
            handlers: Arc::clone(&self.handlers),
            shared: Arc::clone(&self.shared),
            channels,
            receive_timeout: self.config.receive_timeout,
            retry_delay: self.config.connection.retry_delay,
            recent: RecentIds::new(RECENT_IDS),
        };

        self.shared.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(worker.run(shutdown_rx));
        *task = Some(RunningTask {
            shutdown_tx,
            handle,
        });
        true
    }

    /// Ask the loop to stop. It exits at the latest after one
    /// `receive_timeout`.
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.as_ref() {
            // The worker may already be gone; nothing to signal then.
            let _ = task.shutdown_tx.send(true);
        }
    }

    /// Stop, wait up to `close_timeout` for the loop (aborting it after
    /// that), then release the connection.
    pub async fn close(&self) {
        let task = self.task.lock().await.take();
        if let Some(RunningTask {
            shutdown_tx,
            mut handle,
        }) = task
        {
            let _ = shutdown_tx.send(true);
            if tokio::time::timeout(self.config.close_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!(
                    timeout_ms = self.config.close_timeout.as_millis() as u64,
                    "Receive loop did not stop in time, aborting it"
                );
                handle.abort();
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.set_channels(Vec::new());
        self.connection.close().await;
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.shared.stats().clone()
    }

    /// Channels the loop is currently subscribed to; empty while stopped or
    /// reconnecting.
    pub fn active_channels(&self) -> Vec<String> {
        self.shared.channels()
    }

    pub fn channel_names(&self) -> &ChannelNames {
        &self.names
    }

    pub async fn status(&self) -> StatusReport {
        let stats = self.stats();
        let last_error = match stats.last_error {
            Some(e) => Some(e),
            None => self.connection.last_error().await,
        };
        StatusReport {
            enabled: self.config.enabled,
            connected: self.connection.is_connected().await,
            subscribed_channels: self.active_channels(),
            last_error,
            stats: MessageStats {
                total: stats.total_messages,
                success: stats.successful_messages,
                failure: stats.failed_messages,
            },
        }
    }
}

/// Bounded set of recently seen message ids, oldest evicted first.
struct RecentIds {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// False when `id` was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

enum Delivery {
    Handled(DispatchOutcome),
    Unhandled(EventType),
    Duplicate,
}

struct Worker {
    connection: Arc<ConnectionManager>,
    handlers: Arc<RwLock<HandlerMap>>,
    shared: Arc<Shared>,
    channels: Vec<String>,
    receive_timeout: Duration,
    retry_delay: Duration,
    recent: RecentIds,
}

impl Worker {
    async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(channels = ?self.channels, "Subscription loop started");

        'subscription: while let Some(mut stream) = self.open_stream(&mut shutdown_rx).await {
            loop {
                tokio::select! {
                    biased;

                    res = shutdown_rx.changed() => {
                        if res.is_err() || *shutdown_rx.borrow() {
                            break 'subscription;
                        }
                    }

                    received = tokio::time::timeout(self.receive_timeout, stream.next_frame()) => {
                        match received {
                            // Timeout only bounds how long a stop request can go unseen.
                            Err(_) => continue,
                            Ok(Ok(Some(frame))) => self.on_frame(frame).await,
                            Ok(Ok(None)) => {
                                self.subscription_lost(&BrokerError::Closed).await;
                                break;
                            }
                            Ok(Err(e)) => {
                                self.subscription_lost(&e).await;
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.shared.set_channels(Vec::new());
        self.shared.running.store(false, Ordering::SeqCst);
        info!("Subscription loop stopped");
    }

    /// Subscribe, reconnecting every `retry_delay` until it works. `None`
    /// once shutdown was requested.
    async fn open_stream(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<Box<dyn FrameStream>> {
        loop {
            if *shutdown_rx.borrow() {
                return None;
            }

            if let Some(conn) = self.connection.connection().await {
                match conn.subscribe(&self.channels).await {
                    Ok(stream) => {
                        self.shared.set_channels(self.channels.clone());
                        info!(channels = ?self.channels, "Subscribed");
                        return Some(stream);
                    }
                    Err(e) => {
                        warn!(error = %e, "Subscribe failed");
                        self.connection.mark_failed(&e).await;
                    }
                }
            }

            tokio::select! {
                biased;
                res = shutdown_rx.changed() => {
                    if res.is_err() {
                        return None;
                    }
                }
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    async fn subscription_lost(&self, error: &BrokerError) {
        warn!(error = %error, "Subscription lost, reconnecting");
        self.shared.set_channels(Vec::new());
        self.connection.mark_failed(error).await;
    }

    async fn on_frame(&mut self, frame: Frame) {
        let (channel, delivery) = match frame {
            Frame::Subscribed { channel } => {
                debug!(channel = %channel, "Subscription confirmed");
                return;
            }
            Frame::Message { channel, payload } => {
                let delivery = self.deliver(&payload).await;
                (channel, delivery)
            }
            Frame::Undecodable { channel, reason } => {
                let error = HandlerError::from(ValidationError::InvalidEncoding(reason));
                (channel, Delivery::Handled(DispatchOutcome::failed(None, None, error)))
            }
        };

        match delivery {
            Delivery::Duplicate => {}
            Delivery::Unhandled(kind) => {
                debug!(
                    channel = %channel,
                    event_type = %kind,
                    "No handler registered, message dropped"
                );
                let mut stats = self.shared.stats();
                stats.total_messages += 1;
                stats.dropped_messages += 1;
            }
            Delivery::Handled(outcome) => {
                let mut stats = self.shared.stats();
                stats.total_messages += 1;
                if outcome.success {
                    stats.successful_messages += 1;
                } else {
                    stats.failed_messages += 1;
                    stats.last_error = outcome.error.clone();
                    warn!(
                        channel = %channel,
                        event_type = outcome.event_type.as_deref().unwrap_or("?"),
                        message_id = outcome.message_id.as_deref().unwrap_or("?"),
                        error = outcome.error.as_deref().unwrap_or("unknown"),
                        "Message processing failed"
                    );
                }
            }
        }
    }

    async fn deliver(&mut self, payload: &str) -> Delivery {
        let value = match Envelope::parse_value(payload) {
            Ok(value) => value,
            Err(e) => {
                let error = HandlerError::from(e);
                return Delivery::Handled(DispatchOutcome::failed(None, None, error));
            }
        };

        let hint = |field: &str| value.get(field).and_then(Value::as_str).map(str::to_owned);
        let (type_hint, id_hint) = (hint("type"), hint("message_id"));

        let envelope = match Envelope::from_value(value) {
            Ok(envelope) => envelope,
            Err(e) => {
                return Delivery::Handled(DispatchOutcome::failed(
                    type_hint,
                    id_hint,
                    HandlerError::from(e),
                ));
            }
        };

        if !self.recent.insert(&envelope.message_id) {
            return Delivery::Duplicate;
        }

        let kind = match envelope.kind() {
            Ok(kind) => kind,
            Err(e) => {
                let error = HandlerError::from(e);
                return Delivery::Handled(DispatchOutcome::failed_for(&envelope, error));
            }
        };

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned();
        let Some(handler) = handler else {
            return Delivery::Unhandled(kind);
        };

        let event_type = envelope.event_type.clone();
        let message_id = envelope.message_id.clone();
        match AssertUnwindSafe(handler.handle(kind, envelope))
            .catch_unwind()
            .await
        {
            Ok(outcome) => Delivery::Handled(outcome),
            Err(_) => {
                error!(event_type = %event_type, message_id = %message_id, "Handler panicked");
                Delivery::Handled(DispatchOutcome::failed(
                    Some(event_type),
                    Some(message_id),
                    HandlerError::Panicked,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::publisher::Publisher;
    use serde_json::{Map, json};
    use tokio::time::Instant;

    fn config() -> MessagingConfig {
        let mut config = MessagingConfig::new("test");
        config.namespace = "t".into();
        config.receive_timeout = Duration::from_millis(50);
        config.close_timeout = Duration::from_millis(500);
        config.connection.retry_delay = Duration::from_millis(10);
        config
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Handler that records envelopes and succeeds.
    fn recorder() -> (Arc<dyn EventHandler>, Arc<Mutex<Vec<Envelope>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |_kind: EventType, envelope: Envelope| {
            let sink = Arc::clone(&sink);
            async move {
                let outcome = DispatchOutcome::succeeded(&envelope);
                sink.lock().unwrap().push(envelope);
                outcome
            }
        };
        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        (handler, seen)
    }

    async fn running(broker: &MemoryBroker) -> (Subscriber, Arc<Mutex<Vec<Envelope>>>) {
        let subscriber = Subscriber::new(Arc::new(broker.clone()), config());
        let (handler, seen) = recorder();
        subscriber.register_match_handler(Arc::clone(&handler));
        subscriber.register_handler(EventType::SystemAlert, handler);
        assert!(subscriber.start_subscription(None).await);
        wait_until("subscription", || !subscriber.active_channels().is_empty()).await;
        (subscriber, seen)
    }

    #[tokio::test]
    async fn test_round_trip_delivers_each_event_once() {
        let broker = MemoryBroker::new();
        let (subscriber, seen) = running(&broker).await;
        let publisher = Publisher::new(Arc::new(broker.clone()), config());

        let payload = json!({"matches": [{"match_id": 9, "venue": "Eleda Stadion"}], "count": 1});
        assert!(
            publisher
                .publish_event(EventType::MatchesSnapshot, payload.clone(), Map::new())
                .await
        );

        wait_until("delivery", || seen.lock().unwrap().len() == 1).await;
        // Sent on two subscribed channels, handled once.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload, payload);
        assert_eq!(seen[0].source, "test");

        let stats = subscriber.stats();
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.successful_messages, 1);
    }

    #[tokio::test]
    async fn test_malformed_message_counts_once_and_loop_continues() {
        let broker = MemoryBroker::new();
        let (subscriber, seen) = running(&broker).await;
        let names = subscriber.channel_names().clone();

        assert_eq!(broker.inject(&names.all_events(), "{this is not json"), 1);
        let missing_source = json!({
            "message_id": "m-1", "timestamp": "now", "version": "1.0",
            "type": "system.alert", "payload": {}
        });
        broker.inject(&names.all_events(), &missing_source.to_string());

        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        assert!(
            publisher
                .publish_alert(refsync_sdk::objects::AlertLevel::Warning, "still alive")
                .await
        );

        wait_until("valid message", || seen.lock().unwrap().len() == 1).await;
        let stats = subscriber.stats();
        assert_eq!(stats.failed_messages, 2);
        assert_eq!(stats.successful_messages, 1);
        assert!(stats.last_error.unwrap().contains("source"));
    }

    #[tokio::test]
    async fn test_unregistered_and_unknown_types() {
        let broker = MemoryBroker::new();
        let (subscriber, _seen) = running(&broker).await;
        let names = subscriber.channel_names().clone();

        let unregistered = Envelope::new(EventType::HealthCheck, "x", json!({}), Map::new());
        broker.inject(&names.all_events(), &unregistered.to_json().unwrap());
        let mut unknown = Envelope::new(EventType::HealthCheck, "x", json!({}), Map::new());
        unknown.event_type = "referee.teleported".into();
        broker.inject(&names.all_events(), &unknown.to_json().unwrap());

        wait_until("both messages", || subscriber.stats().total_messages == 2).await;
        let stats = subscriber.stats();
        assert_eq!(stats.dropped_messages, 1);
        assert_eq!(stats.failed_messages, 1);
        assert!(stats.last_error.unwrap().contains("referee.teleported"));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let broker = MemoryBroker::new();
        let subscriber = Subscriber::new(Arc::new(broker.clone()), config());
        let handler = |kind: EventType, envelope: Envelope| async move {
            if kind == EventType::SystemAlert {
                panic!("boom");
            }
            DispatchOutcome::succeeded(&envelope)
        };
        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        subscriber.register_handler(EventType::SystemAlert, Arc::clone(&handler));
        subscriber.register_handler(EventType::HealthCheck, handler);
        assert!(subscriber.start_subscription(None).await);
        wait_until("subscription", || !subscriber.active_channels().is_empty()).await;

        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        publisher
            .publish_alert(refsync_sdk::objects::AlertLevel::Error, "x")
            .await;
        publisher
            .publish_event(EventType::HealthCheck, json!({}), Map::new())
            .await;

        wait_until("both messages", || subscriber.stats().total_messages == 2).await;
        let stats = subscriber.stats();
        assert_eq!(stats.failed_messages, 1);
        assert_eq!(stats.successful_messages, 1);
        assert!(subscriber.is_running());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let broker = MemoryBroker::new();
        let (subscriber, _seen) = running(&broker).await;
        assert!(!subscriber.start_subscription(None).await);
        subscriber.close().await;
    }

    #[tokio::test]
    async fn test_disabled_or_unreachable_broker_refuses_to_start() {
        let broker = MemoryBroker::new();
        let mut disabled = config();
        disabled.enabled = false;
        let subscriber = Subscriber::new(Arc::new(broker.clone()), disabled);
        assert!(!subscriber.start_subscription(None).await);
        assert!(!subscriber.status().await.enabled);

        broker.set_available(false);
        let subscriber = Subscriber::new(Arc::new(broker.clone()), config());
        assert!(!subscriber.start_subscription(None).await);
        assert!(!subscriber.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_observed_within_receive_timeout() {
        let broker = MemoryBroker::new();
        let (subscriber, _seen) = running(&broker).await;

        let started = Instant::now();
        subscriber.stop().await;
        wait_until("loop exit", || !subscriber.is_running()).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(subscriber.active_channels().is_empty());
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let broker = MemoryBroker::new();
        let (subscriber, _seen) = running(&broker).await;
        subscriber.close().await;
        subscriber.close().await;

        let status = subscriber.status().await;
        assert!(!status.connected);
        assert!(status.subscribed_channels.is_empty());
        assert!(!subscriber.start_subscription(None).await);
    }

    #[tokio::test]
    async fn test_resubscribes_after_outage() {
        let broker = MemoryBroker::new();
        let (subscriber, seen) = running(&broker).await;

        broker.set_available(false);
        wait_until("subscription drop", || subscriber.active_channels().is_empty()).await;
        assert!(subscriber.is_running());

        broker.set_available(true);
        wait_until("resubscription", || !subscriber.active_channels().is_empty()).await;

        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        assert!(
            publisher
                .publish_match_events(vec![refsync_sdk::objects::MatchRecord::new(1)], Map::new())
                .await
        );
        // added + snapshot
        wait_until("delivery after outage", || seen.lock().unwrap().len() == 2).await;

        let status = subscriber.status().await;
        assert!(status.connected);
        assert_eq!(status.last_error, None);
        assert_eq!(status.stats.success, 2);
    }

    #[tokio::test]
    async fn test_non_utf8_body_counts_as_failed() {
        let broker = MemoryBroker::new();
        let (subscriber, seen) = running(&broker).await;
        let names = subscriber.channel_names().clone();

        assert_eq!(broker.inject_bytes(&names.all_events(), &[0x7b, 0xff, 0xfe, 0x7d]), 1);
        let publisher = Publisher::new(Arc::new(broker.clone()), config());
        assert!(
            publisher
                .publish_alert(refsync_sdk::objects::AlertLevel::Info, "after garbage")
                .await
        );

        wait_until("valid message", || seen.lock().unwrap().len() == 1).await;
        let stats = subscriber.stats();
        assert_eq!(stats.failed_messages, 1);
        assert!(stats.last_error.unwrap().contains("UTF-8"));
    }

    #[tokio::test]
    async fn test_close_aborts_a_stuck_handler() {
        let broker = MemoryBroker::new();
        let mut config = config();
        config.close_timeout = Duration::from_millis(200);
        let subscriber = Subscriber::new(Arc::new(broker.clone()), config.clone());

        let entered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&entered);
        let handler = move |_kind: EventType, envelope: Envelope| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(30)).await;
                DispatchOutcome::succeeded(&envelope)
            }
        };
        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        subscriber.register_handler(EventType::HealthCheck, handler);
        assert!(subscriber.start_subscription(None).await);
        wait_until("subscription", || !subscriber.active_channels().is_empty()).await;

        let publisher = Publisher::new(Arc::new(broker.clone()), config);
        assert!(
            publisher
                .publish_event(EventType::HealthCheck, json!({}), Map::new())
                .await
        );
        wait_until("handler entered", || entered.load(Ordering::SeqCst)).await;

        let started = Instant::now();
        subscriber.close().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
        assert!(!subscriber.is_running());
        assert!(!subscriber.status().await.connected);
    }
}
