//! Operator checks against a live broker: connectivity, a round trip
//! through a private subscriber, and publish throughput.
//!
//! Every check builds its own publisher/subscriber so it never disturbs
//! the services it is checking.

use std::sync::Arc;
use std::time::Duration;

use refsync_sdk::objects::{Envelope, EventType, now_rfc3339};
use serde::Serialize;
use serde_json::{Map, json};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::broker::Connector;
use crate::config::MessagingConfig;
use crate::connection::ConnectionManager;
use crate::events::{DispatchOutcome, EventHandler};
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;

/// How long `check_performance` waits for the last probes to arrive.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub duration_ms: u64,
    pub detail: String,
}

impl CheckResult {
    fn new(name: &'static str, passed: bool, started: Instant, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed,
            duration_ms: started.elapsed().as_millis() as u64,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub messages: usize,
    pub published: usize,
    pub received: usize,
    pub elapsed_ms: u64,
    pub throughput_per_sec: f64,
    pub avg_publish_ms: f64,
    pub max_publish_ms: f64,
}

impl PerformanceReport {
    pub fn passed(&self) -> bool {
        self.published == self.messages && self.received == self.published
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarnessReport {
    pub broker: String,
    pub timestamp: String,
    pub checks: Vec<CheckResult>,
    pub performance: Option<PerformanceReport>,
    /// Entries in the `system` stream after the run; `None` if unreadable.
    pub system_stream_len: Option<usize>,
}

impl HarnessReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
            && self.performance.as_ref().is_none_or(PerformanceReport::passed)
    }
}

pub struct Harness {
    connector: Arc<dyn Connector>,
    config: MessagingConfig,
}

impl Harness {
    pub fn new(connector: Arc<dyn Connector>, mut config: MessagingConfig) -> Self {
        config.enabled = true;
        Self { connector, config }
    }

    /// Connect and ping once.
    pub async fn check_connectivity(&self) -> CheckResult {
        let started = Instant::now();
        let manager = ConnectionManager::new(
            "harness",
            Arc::clone(&self.connector),
            self.config.connection,
        );
        let connected = manager.ensure_connection().await;
        let detail = if connected {
            format!("connected to {}", self.connector.describe())
        } else {
            manager
                .last_error()
                .await
                .unwrap_or_else(|| "broker unavailable".to_string())
        };
        manager.close().await;
        CheckResult::new("connectivity", connected, started, detail)
    }

    /// Publish a `system.health_check` probe and wait up to `timeout` for it
    /// to come back, payload unchanged.
    pub async fn check_round_trip(&self, timeout: Duration) -> CheckResult {
        let started = Instant::now();
        let (subscriber, mut rx) = match self.probe_subscriber(timeout).await {
            Ok(pair) => pair,
            Err(detail) => return CheckResult::new("round_trip", false, started, detail),
        };
        let publisher = Publisher::new(Arc::clone(&self.connector), self.config.clone());

        let probe = Envelope::new(
            EventType::HealthCheck,
            &self.config.source,
            json!({"probe": "round_trip", "sent_at": now_rfc3339()}),
            Map::new(),
        );

        let result = match publisher.publish_envelope(&probe).await {
            Err(e) => {
                CheckResult::new("round_trip", false, started, format!("publish failed: {e}"))
            }
            Ok(()) => {
                let deadline = started + timeout;
                loop {
                    match tokio::time::timeout_at(deadline, rx.recv()).await {
                        Ok(Some(received)) if received.message_id == probe.message_id => {
                            let intact = received.payload == probe.payload;
                            let detail = if intact {
                                "probe received intact".to_string()
                            } else {
                                "probe payload changed in transit".to_string()
                            };
                            break CheckResult::new("round_trip", intact, started, detail);
                        }
                        Ok(Some(_)) => continue,
                        Ok(None) | Err(_) => {
                            break CheckResult::new(
                                "round_trip",
                                false,
                                started,
                                format!("probe not received within {}ms", timeout.as_millis()),
                            );
                        }
                    }
                }
            }
        };

        subscriber.close().await;
        publisher.close().await;
        result
    }

    /// Publish `messages` probes back to back and count how many arrive.
    pub async fn check_performance(&self, messages: usize) -> PerformanceReport {
        let publisher = Publisher::new(Arc::clone(&self.connector), self.config.clone());
        let receiver = self.probe_subscriber(DRAIN_TIMEOUT).await.ok();

        let started = Instant::now();
        let mut published = 0;
        let mut total_publish = Duration::ZERO;
        let mut max_publish = Duration::ZERO;
        for seq in 0..messages {
            let sent = Instant::now();
            if publisher
                .publish_event(
                    EventType::HealthCheck,
                    json!({"probe": "performance", "seq": seq}),
                    Map::new(),
                )
                .await
            {
                published += 1;
            }
            let took = sent.elapsed();
            total_publish += took;
            max_publish = max_publish.max(took);
        }

        let mut received = 0;
        if let Some((subscriber, mut rx)) = receiver {
            let deadline = Instant::now() + DRAIN_TIMEOUT;
            while received < published {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(_)) => received += 1,
                    Ok(None) | Err(_) => break,
                }
            }
            subscriber.close().await;
        } else {
            warn!("Performance check could not subscribe, only publishing was measured");
        }
        let elapsed = started.elapsed();
        publisher.close().await;

        let secs = elapsed.as_secs_f64();
        PerformanceReport {
            messages,
            published,
            received,
            elapsed_ms: elapsed.as_millis() as u64,
            throughput_per_sec: if secs > 0.0 { published as f64 / secs } else { 0.0 },
            avg_publish_ms: if messages > 0 {
                total_publish.as_secs_f64() * 1000.0 / messages as f64
            } else {
                0.0
            },
            max_publish_ms: max_publish.as_secs_f64() * 1000.0,
        }
    }

    /// Connectivity first; the other checks only run if it passes.
    pub async fn run_all(&self, round_trip_timeout: Duration, messages: usize) -> HarnessReport {
        let connectivity = self.check_connectivity().await;
        let mut report = HarnessReport {
            broker: self.connector.describe(),
            timestamp: now_rfc3339(),
            checks: Vec::new(),
            performance: None,
            system_stream_len: None,
        };

        if !connectivity.passed {
            warn!(detail = %connectivity.detail, "Connectivity check failed, skipping the rest");
            report.checks.push(connectivity);
            return report;
        }
        report.checks.push(connectivity);
        report.checks.push(self.check_round_trip(round_trip_timeout).await);
        if messages > 0 {
            report.performance = Some(self.check_performance(messages).await);
        }

        let publisher = Publisher::new(Arc::clone(&self.connector), self.config.clone());
        report.system_stream_len = publisher.stream_len(EventType::HealthCheck).await;
        publisher.close().await;

        info!(passed = report.passed(), "Harness run finished");
        report
    }

    /// A subscriber on the health-check channel only, forwarding probes.
    async fn probe_subscriber(
        &self,
        timeout: Duration,
    ) -> Result<(Subscriber, mpsc::UnboundedReceiver<Envelope>), String> {
        let subscriber = Subscriber::new(Arc::clone(&self.connector), self.config.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |_kind: EventType, envelope: Envelope| {
            let tx = tx.clone();
            async move {
                let outcome = DispatchOutcome::succeeded(&envelope);
                let _ = tx.send(envelope);
                outcome
            }
        };
        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        subscriber.register_handler(EventType::HealthCheck, handler);

        let channel = subscriber.channel_names().for_type(EventType::HealthCheck);
        if !subscriber.start_subscription(Some(vec![channel])).await {
            subscriber.close().await;
            return Err("could not start probe subscriber".to_string());
        }

        let deadline = Instant::now() + timeout;
        while subscriber.active_channels().is_empty() {
            if Instant::now() >= deadline {
                subscriber.close().await;
                return Err("probe subscriber never confirmed its subscription".to_string());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok((subscriber, rx))
    }
}
