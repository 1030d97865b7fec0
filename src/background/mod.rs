//! Background subscription manager (C7) and health computation (C8).
//!
//! Connection-management loop, staleness monitor, and task-crash-restart
//! discipline are grounded on `scrapers/binance_session.rs`'s
//! `DataSourceKillSwitch`/`parallel_data_collection` supervision pattern:
//! a long-running task is `tokio::spawn`'d inside a restart loop that
//! distinguishes a clean stop (manager shut down) from a crash (panic or
//! unexpected return), backing off 5s before respawning on the latter.

pub mod health;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::BG_BASE;
use crate::contract_lookup::ContractCache;
use crate::models::{TickType, TrackedContract};
use crate::router::handler::{ConsumerSink, StreamEvent, StreamHandler};
use crate::router::StreamRouter;
use crate::upstream::UpstreamConnection;
use health::{compute_health, HealthStatus, MarketStatus, StalenessThresholds, TradingHoursParser};

const CONNECTION_CHECK_INTERVAL: Duration = Duration::from_secs(2);
const STALENESS_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const RESTART_DELAY: Duration = Duration::from_secs(5);
const MAX_BACKOFF_SECS: u32 = 30;
const VERY_STALE_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Feeds a background handler's ticks back into the staleness tracker
/// instead of anywhere downstream-facing; storage already happens in the
/// router before the handler is consulted (spec §4.2), so this sink's only
/// job is `update_last_data_timestamp`.
struct StalenessSink {
    contract_id: i64,
    last_data: Arc<RwLock<HashMap<i64, Instant>>>,
}

impl ConsumerSink for StalenessSink {
    fn deliver(&self, event: StreamEvent) -> bool {
        if let StreamEvent::Tick { .. } = event {
            self.last_data.write().insert(self.contract_id, Instant::now());
        }
        true
    }
}

pub struct BackgroundManager {
    tracked: Vec<TrackedContract>,
    connection: Arc<UpstreamConnection>,
    router: Arc<StreamRouter>,
    contract_cache: Arc<ContractCache>,
    next_request_id: AtomicI32,
    was_connected: AtomicBool,
    failure_count: AtomicU32,
    running: AtomicBool,
    last_data_timestamp: Arc<RwLock<HashMap<i64, Instant>>>,
    active_subscriptions: RwLock<HashMap<i64, HashMap<TickType, i32>>>,
    /// Set while the shared upstream connection is down; cleared on
    /// reconnect. A simplification of spec §4.4's per-contract "observed
    /// connection issues" — this connection is shared by every tracked
    /// contract, so a connection-level outage affects all of them equally.
    connection_unstable: AtomicBool,
    health_cache: RwLock<HashMap<i64, HealthStatus>>,
}

impl BackgroundManager {
    pub fn new(
        tracked: Vec<TrackedContract>,
        connection: Arc<UpstreamConnection>,
        router: Arc<StreamRouter>,
        contract_cache: Arc<ContractCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracked,
            connection,
            router,
            contract_cache,
            next_request_id: AtomicI32::new(BG_BASE),
            was_connected: AtomicBool::new(false),
            failure_count: AtomicU32::new(0),
            running: AtomicBool::new(true),
            last_data_timestamp: Arc::new(RwLock::new(HashMap::new())),
            active_subscriptions: RwLock::new(HashMap::new()),
            connection_unstable: AtomicBool::new(false),
            health_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Per Open Question resolution: enabled iff there is at least one
    /// tracked contract.
    pub fn is_enabled(&self) -> bool {
        !self.tracked.is_empty()
    }

    pub fn spawn(self: &Arc<Self>) {
        spawn_supervised(self.clone(), "background_connection_loop", |mgr| async move {
            mgr.connection_loop().await
        });
        spawn_supervised(self.clone(), "background_staleness_monitor", |mgr| async move {
            mgr.staleness_monitor_loop().await
        });
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    async fn connection_loop(&self) {
        while self.running.load(Ordering::Relaxed) {
            let connected = self.connection.is_connected();
            let was = self.was_connected.swap(connected, Ordering::Relaxed);

            if was && !connected {
                self.failure_count.fetch_add(1, Ordering::Relaxed);
                self.connection_unstable.store(true, Ordering::Relaxed);
                self.active_subscriptions.write().clear();
                self.router.clear_background();
                warn!("background_upstream_disconnected_clearing_subscriptions");
            } else if !was && connected {
                self.failure_count.store(0, Ordering::Relaxed);
                self.connection_unstable.store(false, Ordering::Relaxed);
                info!("background_upstream_reconnected_restarting_subscriptions");
            }

            if connected {
                self.ensure_subscriptions().await;
                sleep(CONNECTION_CHECK_INTERVAL).await;
            } else {
                let failures = self.failure_count.load(Ordering::Relaxed);
                let delay_secs = (5 + 2 * failures).min(MAX_BACKOFF_SECS);
                sleep(Duration::from_secs(delay_secs as u64)).await;
                if let Err(e) = self.connection.connect().await {
                    tracing::debug!(error = %e, "background_reconnect_attempt_failed");
                }
            }
        }
    }

    async fn ensure_subscriptions(&self) {
        for contract in &self.tracked {
            if !contract.enabled {
                continue;
            }
            let missing: Vec<TickType> = {
                let active = self.active_subscriptions.read();
                let have = active.get(&contract.contract_id);
                contract
                    .tick_types
                    .iter()
                    .filter(|tt| !have.map(|h| h.contains_key(tt)).unwrap_or(false))
                    .copied()
                    .collect()
            };
            for tick_type in missing {
                self.start_subscription(contract, tick_type).await;
            }
        }
    }

    async fn start_subscription(&self, contract: &TrackedContract, tick_type: TickType) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        if self.contract_cache.get(&contract.symbol, contract.contract_id).await.is_err() {
            warn!(contract_id = contract.contract_id, "background_contract_lookup_failed_skipping_subscription");
            return;
        }

        if let Err(e) = self
            .connection
            .request_tick_stream(request_id, contract.contract_id, tick_type)
            .await
        {
            warn!(contract_id = contract.contract_id, ?tick_type, error = %e, "background_subscription_start_failed");
            return;
        }

        let sink = StalenessSink {
            contract_id: contract.contract_id,
            last_data: self.last_data_timestamp.clone(),
        };
        let handler = Arc::new(StreamHandler::new(
            request_id,
            contract.contract_id,
            tick_type,
            format!("bg_{}_{}", contract.contract_id, tick_type.as_str()),
            None,
            None,
            Box::new(sink),
        ));
        self.router.register(handler);
        self.active_subscriptions
            .write()
            .entry(contract.contract_id)
            .or_default()
            .insert(tick_type, request_id);
        info!(contract_id = contract.contract_id, ?tick_type, request_id, "background_subscription_started");
    }

    async fn staleness_monitor_loop(&self) {
        while self.running.load(Ordering::Relaxed) {
            sleep(STALENESS_CHECK_INTERVAL).await;
            if !self.running.load(Ordering::Relaxed) {
                return;
            }
            if !self.connection.is_connected() {
                continue;
            }
            for contract in &self.tracked {
                if contract.enabled {
                    self.check_staleness(contract).await;
                }
            }
        }
    }

    async fn check_staleness(&self, contract: &TrackedContract) {
        let last = self.last_data_timestamp.read().get(&contract.contract_id).copied();
        let staleness = last.map(|t| t.elapsed()).unwrap_or(Duration::from_secs(u64::MAX / 4));

        let detail = self.contract_cache.get(&contract.symbol, contract.contract_id).await.ok();
        let sessions = detail
            .as_ref()
            .and_then(|d| d.trading_hours.as_deref())
            .map(TradingHoursParser::parse_hours_string)
            .unwrap_or_default();
        let status = TradingHoursParser::market_status(
            &sessions,
            chrono::Utc::now(),
            Duration::from_secs(30 * 60),
            Duration::from_secs(30 * 60),
        );
        let thresholds = StalenessThresholds::default();
        let threshold = thresholds.threshold_for(status);

        if staleness > threshold
            && matches!(status, MarketStatus::Open | MarketStatus::PreMarket | MarketStatus::AfterHours)
        {
            warn!(contract_id = contract.contract_id, ?staleness, ?status, "background_contract_stale");
        }
        if staleness > VERY_STALE_THRESHOLD && status == MarketStatus::Open {
            warn!(contract_id = contract.contract_id, "background_contract_very_stale_restarting");
            self.restart_contract(contract).await;
        }

        let active_count = self
            .active_subscriptions
            .read()
            .get(&contract.contract_id)
            .map(|m| m.len())
            .unwrap_or(0);
        let health = compute_health(
            self.connection_unstable.load(Ordering::Relaxed),
            status,
            active_count,
            contract.tick_types.len(),
            staleness,
            &thresholds,
        );
        self.health_cache.write().insert(contract.contract_id, health);
    }

    async fn restart_contract(&self, contract: &TrackedContract) {
        let request_ids: Vec<i32> = {
            let mut active = self.active_subscriptions.write();
            active
                .remove(&contract.contract_id)
                .map(|m| m.into_values().collect())
                .unwrap_or_default()
        };
        for request_id in request_ids {
            self.connection.cancel_tick_stream(request_id).await;
            self.router.unregister(request_id);
        }
        self.ensure_subscriptions().await;
    }

    /// Per-contract `HealthStatus` table, as last computed by the staleness
    /// monitor (spec §4.4, exposed via `GET /background/health`).
    pub fn health_snapshot(&self) -> HashMap<i64, HealthStatus> {
        self.health_cache.read().clone()
    }

    /// Overall system health: worst of all per-contract statuses.
    pub fn overall_health(&self) -> HealthStatus {
        let cache = self.health_cache.read();
        if cache.is_empty() {
            return HealthStatus::Unknown;
        }
        HealthStatus::worst_of(cache.values().copied())
    }

    pub fn active_subscription_count(&self) -> usize {
        self.active_subscriptions.read().values().map(|m| m.len()).sum()
    }
}

/// Task-crash restart discipline (spec §4.3): a panicking or erroring
/// supervised task is restarted after 5s as long as the manager is still
/// running; a task ending because `shutdown()` was called is not
/// restarted.
fn spawn_supervised<F, Fut>(manager: Arc<BackgroundManager>, name: &'static str, task: F)
where
    F: Fn(Arc<BackgroundManager>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            if !manager.running.load(Ordering::Relaxed) {
                return;
            }
            let handle = tokio::spawn(task(manager.clone()));
            match handle.await {
                Ok(()) => {
                    if !manager.running.load(Ordering::Relaxed) {
                        return;
                    }
                    warn!(task = name, "supervised_task_ended_unexpectedly_restarting");
                }
                Err(join_err) => {
                    error!(task = name, error = %join_err, "supervised_task_panicked_restarting");
                }
            }
            sleep(RESTART_DELAY).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageOrchestrator, StorageOrchestratorConfig};
    use crate::upstream::driver::FakeDriver;
    use crate::upstream::connection::ConnectionConfig;

    fn manager(tracked: Vec<TrackedContract>) -> Arc<BackgroundManager> {
        let driver = Arc::new(FakeDriver::new());
        let connection = Arc::new(UpstreamConnection::new(ConnectionConfig::default(), driver));
        let storage = Arc::new(StorageOrchestrator::disabled(StorageOrchestratorConfig::default()));
        let router = Arc::new(StreamRouter::new(storage, true));
        let cache = Arc::new(ContractCache::new(
            crate::contract_lookup::ContractLookupClient::new("http://127.0.0.1:1".into()),
            Duration::from_secs(60),
        ));
        BackgroundManager::new(tracked, connection, router, cache)
    }

    #[test]
    fn enabled_iff_tracked_contracts_nonempty() {
        assert!(!manager(Vec::new()).is_enabled());
        let tc = TrackedContract {
            contract_id: 1,
            symbol: "AAPL".into(),
            tick_types: vec![TickType::Last],
            buffer_hours: 1,
            enabled: true,
        };
        assert!(manager(vec![tc]).is_enabled());
    }

    #[test]
    fn overall_health_unknown_before_any_staleness_check() {
        let mgr = manager(Vec::new());
        assert_eq!(mgr.overall_health(), HealthStatus::Unknown);
    }

    #[test]
    fn active_subscription_count_starts_at_zero() {
        let mgr = manager(Vec::new());
        assert_eq!(mgr.active_subscription_count(), 0);
    }
}
