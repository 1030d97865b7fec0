//! One TWS session (C5): connect-in-port-order, periodic liveness
//! verification, reconnect backoff, and callback-style event publication.
//!
//! Adapted from the teacher's `scrapers/binance_session.rs` session-
//! management machinery (`SessionState`/`BackoffCalculator`/
//! `HeartbeatMonitor`/`SessionMetrics`): same state machine and backoff-
//! with-jitter shape, generalized from a single WebSocket endpoint list to
//! TWS's "try ports in order, first success wins" connect semantics, and
//! with the per-symbol resync coordinator dropped (this spec has no
//! per-symbol resync concept — see DESIGN.md).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::upstream::driver::{DriverEvent, TwsDriver};

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub ports: Vec<u16>,
    pub client_id: i32,
    pub connect_timeout: Duration,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    /// Re-verification cadence for `is_connected()`; spec requires <= 10s.
    pub liveness_check_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ports: vec![7497, 7496, 4002, 4001],
            client_id: 100,
            connect_timeout: Duration::from_secs(10),
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,
            liveness_check_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connecting,
    Connected,
    Reconnecting,
    Shutdown,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Init => "INIT",
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::Reconnecting => "RECONNECTING",
            SessionState::Shutdown => "SHUTDOWN",
        };
        write!(f, "{}", s)
    }
}

/// Exponential backoff with jitter, identical shape to the teacher's
/// `BackoffCalculator` (xorshift64 PRNG seeded from wall-clock nanos, since
/// this is cold-path jitter, not a cryptographic need).
#[derive(Debug)]
pub struct BackoffCalculator {
    base_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter_factor: f64,
    attempt: u32,
    rng_state: u64,
}

impl BackoffCalculator {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
            multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(12345)
                | 1,
        }
    }

    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    pub fn next_backoff(&mut self) -> Duration {
        let base = (self.base_ms as f64) * self.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.max_ms as f64);
        let jitter_range = capped * self.jitter_factor;
        let jitter = (self.next_random() * 2.0 - 1.0) * jitter_range;
        let final_ms = (capped + jitter).max(self.base_ms as f64);
        self.attempt += 1;
        Duration::from_millis(final_ms as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    pub connect_attempts: AtomicU64,
    pub connect_successes: AtomicU64,
    pub connect_failures: AtomicU64,
    pub reconnects: AtomicU64,
    pub liveness_failures: AtomicU64,
}

impl ConnectionMetrics {
    pub fn summary(&self) -> String {
        format!(
            "connects={}/{} reconnects={} liveness_failures={}",
            self.connect_successes.load(Ordering::Relaxed),
            self.connect_attempts.load(Ordering::Relaxed),
            self.reconnects.load(Ordering::Relaxed),
            self.liveness_failures.load(Ordering::Relaxed),
        )
    }
}

/// Callbacks observable from outside the connection, per spec §4.1.
pub trait ConnectionObserver: Send + Sync {
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
    fn on_error(&self, _code: i32, _msg: &str) {}
}

struct NullObserver;
impl ConnectionObserver for NullObserver {}

/// Owns exactly one socket to one TWS instance (C5).
pub struct UpstreamConnection {
    config: ConnectionConfig,
    driver: Arc<dyn TwsDriver>,
    state: RwLock<SessionState>,
    backoff: RwLock<BackoffCalculator>,
    handshake_complete: RwLock<bool>,
    last_liveness_check: RwLock<Instant>,
    metrics: ConnectionMetrics,
    observer: RwLock<Arc<dyn ConnectionObserver>>,
}

impl UpstreamConnection {
    pub fn new(config: ConnectionConfig, driver: Arc<dyn TwsDriver>) -> Self {
        let backoff = BackoffCalculator::new(&config);
        Self {
            config,
            driver,
            state: RwLock::new(SessionState::Init),
            backoff: RwLock::new(backoff),
            handshake_complete: RwLock::new(false),
            last_liveness_check: RwLock::new(Instant::now()),
            metrics: ConnectionMetrics::default(),
            observer: RwLock::new(Arc::new(NullObserver)),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        *self.observer.write() = observer;
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// `is_connected()`: true iff the handshake completed and the state is
    /// still `Connected`. Periodic re-verification is driven externally by
    /// [`UpstreamConnection::verify_liveness`] on `liveness_check_interval`.
    pub fn is_connected(&self) -> bool {
        *self.state.read() == SessionState::Connected && *self.handshake_complete.read()
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    pub fn liveness_check_interval(&self) -> Duration {
        self.config.liveness_check_interval
    }

    pub fn next_backoff(&self) -> Duration {
        self.backoff.write().next_backoff()
    }

    /// Tries each configured port in order; succeeds on the first port that
    /// both connects AND completes the next-valid-id handshake within
    /// `connect_timeout`. Failure is only reported once the full list is
    /// exhausted (spec §4.1).
    pub async fn connect(&self) -> anyhow::Result<()> {
        *self.state.write() = SessionState::Connecting;
        self.metrics.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let mut last_err = None;
        for &port in &self.config.ports {
            let attempt = tokio::time::timeout(
                self.config.connect_timeout,
                self.driver.connect(&self.config.host, port, self.config.client_id),
            )
            .await;

            match attempt {
                Ok(Ok(())) => {
                    *self.handshake_complete.write() = true;
                    *self.state.write() = SessionState::Connected;
                    *self.last_liveness_check.write() = Instant::now();
                    self.metrics.connect_successes.fetch_add(1, Ordering::Relaxed);
                    self.backoff.write().reset();
                    info!(host = %self.config.host, port, "upstream_connected");
                    self.observer.read().on_connected();
                    return Ok(());
                }
                Ok(Err(e)) => {
                    debug!(port, error = %e, "connect_attempt_failed");
                    last_err = Some(e);
                }
                Err(_) => {
                    debug!(port, "connect_attempt_timed_out");
                    last_err = Some(anyhow::anyhow!(
                        "handshake timeout after {:?} on port {}",
                        self.config.connect_timeout,
                        port
                    ));
                }
            }
        }

        self.metrics.connect_failures.fetch_add(1, Ordering::Relaxed);
        *self.state.write() = SessionState::Reconnecting;
        warn!(host = %self.config.host, ports = ?self.config.ports, "all_ports_exhausted");
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no ports configured")))
    }

    pub async fn request_tick_stream(
        &self,
        request_id: i32,
        contract_id: i64,
        tick_type: crate::models::TickType,
    ) -> anyhow::Result<()> {
        self.driver
            .req_tick_by_tick_data(request_id, contract_id, tick_type, 0, false)
            .await
    }

    /// Best-effort, idempotent.
    pub async fn cancel_tick_stream(&self, request_id: i32) {
        if let Err(e) = self.driver.cancel_tick_by_tick_data(request_id).await {
            debug!(request_id, error = %e, "cancel_tick_stream_failed");
        }
    }

    /// Low-cost request-then-check liveness probe; caller schedules this on
    /// `liveness_check_interval` (<=10s, spec §4.1).
    pub async fn verify_liveness(&self) {
        if !self.is_connected() {
            return;
        }
        match self.driver.ping().await {
            Ok(()) => {
                *self.last_liveness_check.write() = Instant::now();
            }
            Err(e) => {
                self.metrics.liveness_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "liveness_probe_failed");
                self.mark_disconnected();
            }
        }
    }

    fn mark_disconnected(&self) {
        let was_connected = {
            let mut state = self.state.write();
            let was = *state == SessionState::Connected;
            *state = SessionState::Reconnecting;
            was
        };
        *self.handshake_complete.write() = false;
        if was_connected {
            self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
            self.observer.read().on_disconnected();
        }
    }

    pub fn handle_disconnect_event(&self) {
        self.mark_disconnected();
    }

    pub fn handle_error_event(&self, code: i32, request_id: Option<i32>, message: &str) {
        self.observer.read().on_error(code, message);
        if matches!(crate::errors::classify_upstream_code(code), crate::errors::ErrorKind::ConnectionError) {
            self.mark_disconnected();
        }
        let _ = request_id;
    }

    pub fn request_events(&self) -> mpsc::Receiver<DriverEvent> {
        self.driver.events()
    }

    pub fn shutdown(&self) {
        *self.state.write() = SessionState::Shutdown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::driver::FakeDriver;

    #[test]
    fn backoff_grows_and_caps() {
        let config = ConnectionConfig::default();
        let mut backoff = BackoffCalculator::new(&config);
        let d1 = backoff.next_backoff();
        assert!(d1.as_millis() >= 700 && d1.as_millis() <= 1_300);
        for _ in 0..20 {
            let d = backoff.next_backoff();
            assert!(d.as_millis() as u64 <= (config.backoff_max_ms as f64 * 1.3) as u64);
        }
    }

    #[test]
    fn backoff_resets_on_reconnect() {
        let config = ConnectionConfig::default();
        let mut backoff = BackoffCalculator::new(&config);
        backoff.next_backoff();
        backoff.next_backoff();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }

    #[tokio::test]
    async fn connect_tries_ports_in_order_and_succeeds_on_first() {
        let driver = Arc::new(FakeDriver::new());
        let conn = UpstreamConnection::new(ConnectionConfig::default(), driver);
        conn.connect().await.unwrap();
        assert!(conn.is_connected());
        assert_eq!(conn.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn connect_failure_transitions_to_reconnecting() {
        let driver = Arc::new(FakeDriver::new());
        driver
            .connect_should_fail
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let conn = UpstreamConnection::new(ConnectionConfig::default(), driver);
        assert!(conn.connect().await.is_err());
        assert!(!conn.is_connected());
        assert_eq!(conn.state(), SessionState::Reconnecting);
    }

    #[tokio::test]
    async fn disconnect_event_clears_connected_state() {
        let driver = Arc::new(FakeDriver::new());
        let conn = UpstreamConnection::new(ConnectionConfig::default(), driver);
        conn.connect().await.unwrap();
        assert!(conn.is_connected());
        conn.handle_disconnect_event();
        assert!(!conn.is_connected());
    }
}
