//! ConnectionManager: one broker handle, lazily (re)established.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> HealthChecking -+-> Connected
//!      ^                                                     |
//!      +-----------------------------------------------------+-> Disconnected
//! any state -- close() --> Closed (terminal)
//! ```
//!
//! There is no reconnect timer. Every transition happens inside
//! [`ConnectionManager::ensure_connection`], [`ConnectionManager::mark_failed`]
//! or [`ConnectionManager::close`]. Broker errors never escape as `Err`;
//! callers get a `bool`/`Option` plus the retained `last_error`.
//!
//! Connect and ping are bounded by `connect_timeout`, and the observable
//! [`ConnectionState`] sits behind its own lock, so status queries answer
//! immediately even while a reconnect is in flight.

use std::future::Future;
use std::sync::{Arc, PoisonError};

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConnection, BrokerError, Connector};
use crate::config::ConnectionSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    HealthChecking,
    Closed,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionPhase::Disconnected => write!(f, "disconnected"),
            ConnectionPhase::Connecting => write!(f, "connecting"),
            ConnectionPhase::Connected => write!(f, "connected"),
            ConnectionPhase::HealthChecking => write!(f, "health_checking"),
            ConnectionPhase::Closed => write!(f, "closed"),
        }
    }
}

/// Snapshot of a manager's connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub connected: bool,
    /// Error of the most recent failed attempt; cleared on reconnect.
    pub last_error: Option<String>,
    /// Attempts made since the last successful connect.
    pub attempt_count: u32,
    pub last_health_check: Option<OffsetDateTime>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            connected: false,
            last_error: None,
            attempt_count: 0,
            last_health_check: None,
        }
    }

    fn mark_healthy(&mut self) {
        self.phase = ConnectionPhase::Connected;
        self.connected = true;
        self.attempt_count = 0;
        self.last_error = None;
        self.last_health_check = Some(OffsetDateTime::now_utc());
    }

    fn mark_down(&mut self, error: &BrokerError) {
        self.phase = ConnectionPhase::Disconnected;
        self.connected = false;
        self.last_error = Some(error.to_string());
    }
}

/// The handle itself; held across broker I/O.
struct Link {
    conn: Option<Arc<dyn BrokerConnection>>,
    /// Monotonic time of the last successful ping.
    last_check: Option<Instant>,
}

impl Link {
    fn drop_conn(&mut self) -> Option<Arc<dyn BrokerConnection>> {
        self.last_check = None;
        self.conn.take()
    }
}

/// Owns exactly one broker connection.
///
/// Publishers and subscribers each get their own manager; sharing one
/// between them would couple their failure handling.
pub struct ConnectionManager {
    name: String,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    link: Mutex<Link>,
    state: std::sync::Mutex<ConnectionState>,
}

impl ConnectionManager {
    /// Create a manager. Nothing is connected until the first
    /// [`ensure_connection`](Self::ensure_connection).
    ///
    /// `name` only labels log lines (e.g. `publisher`, `subscriber`).
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            name: name.into(),
            connector,
            settings,
            link: Mutex::new(Link {
                conn: None,
                last_check: None,
            }),
            state: std::sync::Mutex::new(ConnectionState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn update<R>(&self, f: impl FnOnce(&mut ConnectionState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *state)
    }

    fn is_closed(&self) -> bool {
        self.update(|state| state.phase == ConnectionPhase::Closed)
    }

    /// Run one broker operation, giving up after `connect_timeout`.
    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, BrokerError>>,
    ) -> Result<T, BrokerError> {
        tokio::time::timeout(self.settings.connect_timeout, op)
            .await
            .unwrap_or_else(|_| Err(BrokerError::Timeout))
    }

    /// Make sure a live connection exists.
    ///
    /// A live connection is pinged at most once per `health_check_interval`.
    /// A missing or failed one is re-established with up to `max_retries`
    /// attempts, `retry_delay` apart, each bounded by `connect_timeout`.
    /// Returns false when every attempt failed or the manager is closed; the
    /// caller polls again later.
    pub async fn ensure_connection(&self) -> bool {
        let mut link = self.link.lock().await;
        if self.is_closed() {
            return false;
        }

        if let Some(conn) = link.conn.clone() {
            let due = link
                .last_check
                .is_none_or(|at| at.elapsed() >= self.settings.health_check_interval);
            if !due {
                return true;
            }

            self.update(|state| state.phase = ConnectionPhase::HealthChecking);
            match self.bounded(conn.ping()).await {
                Ok(()) => {
                    link.last_check = Some(Instant::now());
                    self.update(ConnectionState::mark_healthy);
                    debug!(manager = %self.name, "Broker health check passed");
                    return true;
                }
                Err(e) => {
                    warn!(
                        manager = %self.name,
                        broker = %self.connector.describe(),
                        error = %e,
                        "Broker health check failed, connection lost"
                    );
                    link.drop_conn();
                    self.update(|state| state.mark_down(&e));
                    conn.close().await;
                }
            }
        }

        self.reconnect(&mut link).await
    }

    async fn reconnect(&self, link: &mut Link) -> bool {
        let attempts = self.settings.max_retries.max(1);

        for attempt in 1..=attempts {
            self.update(|state| {
                state.phase = ConnectionPhase::Connecting;
                state.attempt_count += 1;
            });

            match self.try_connect().await {
                Ok(conn) => {
                    if self.is_closed() {
                        conn.close().await;
                        return false;
                    }
                    link.conn = Some(conn);
                    link.last_check = Some(Instant::now());
                    self.update(ConnectionState::mark_healthy);
                    info!(
                        manager = %self.name,
                        broker = %self.connector.describe(),
                        attempt,
                        "Connected to broker"
                    );
                    return true;
                }
                Err(e) => {
                    warn!(
                        manager = %self.name,
                        broker = %self.connector.describe(),
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Broker connection attempt failed"
                    );
                    self.update(|state| state.last_error = Some(e.to_string()));
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
            if self.is_closed() {
                return false;
            }
        }

        self.update(|state| {
            state.phase = ConnectionPhase::Disconnected;
            state.connected = false;
        });
        warn!(
            manager = %self.name,
            attempts,
            "Broker unavailable, giving up until the next call"
        );
        false
    }

    async fn try_connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let conn = self.bounded(self.connector.connect()).await?;
        if let Err(e) = self.bounded(conn.ping()).await {
            conn.close().await;
            return Err(e);
        }
        Ok(conn)
    }

    /// The live connection, (re)connecting first if needed.
    pub async fn connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        if !self.ensure_connection().await {
            return None;
        }
        self.link.lock().await.conn.clone()
    }

    /// Record an I/O failure seen by a caller. The handle is dropped so the
    /// next [`ensure_connection`](Self::ensure_connection) reconnects.
    pub async fn mark_failed(&self, error: &BrokerError) {
        if self.is_closed() {
            return;
        }
        let dropped = self.link.lock().await.drop_conn();
        self.update(|state| {
            if state.phase != ConnectionPhase::Closed {
                state.mark_down(error);
            }
        });
        if let Some(conn) = dropped {
            warn!(manager = %self.name, error = %error, "Disconnected from broker");
            conn.close().await;
        }
    }

    /// Release the connection. Idempotent; the manager never reconnects
    /// afterwards.
    pub async fn close(&self) {
        let already_closed = self.update(|state| {
            let was_closed = state.phase == ConnectionPhase::Closed;
            state.phase = ConnectionPhase::Closed;
            state.connected = false;
            was_closed
        });
        if already_closed {
            return;
        }
        // Waits at most for one bounded attempt in flight.
        if let Some(conn) = self.link.lock().await.drop_conn() {
            conn.close().await;
        }
        info!(manager = %self.name, "Broker connection closed");
    }

    pub async fn state(&self) -> ConnectionState {
        self.update(|state| state.clone())
    }

    pub async fn is_connected(&self) -> bool {
        self.update(|state| state.connected)
    }

    pub async fn last_error(&self) -> Option<String> {
        self.update(|state| state.last_error.clone())
    }
}
