//! Composition root (C5-C9 wiring). Replaces the original's global mutable
//! singletons and cyclic references (spec §9 redesign flags) with one
//! owning [`AppState`] constructed at startup and threaded explicitly into
//! every handler — axum's `State` extractor, not a shared global.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::background::BackgroundManager;
use crate::config::Config;
use crate::contract_lookup::{ContractCache, ContractLookupClient};
use crate::errors::UpstreamError;
use crate::middleware::ConnectionLimiter;
use crate::models::{TickMessage, TickType};
use crate::router::handler::{ConsumerSink, StreamHandler};
use crate::router::StreamRouter;
use crate::storage::{StorageOrchestrator, StorageOrchestratorConfig};
use crate::upstream::{self, ConnectionConfig, TwsDriver, UpstreamConnection};

/// Contract lookup results are cached for this long before re-hitting the
/// external service (spec §6: background subscriptions hydrate by id).
pub const CONTRACT_LOOKUP_CACHE_TTL: Duration = Duration::from_secs(300);

/// Spec §4.7: per client ip <= 10 concurrent SSE/WS connections.
pub const MAX_CONNECTIONS_PER_IP: u32 = 10;

#[derive(Clone)]
pub struct AppState(Arc<Inner>);

pub struct Inner {
    pub config: Config,
    pub router: Arc<StreamRouter>,
    pub storage: Arc<StorageOrchestrator>,
    pub connection: Arc<UpstreamConnection>,
    pub background: Option<Arc<BackgroundManager>>,
    pub contract_cache: Arc<ContractCache>,
    pub ip_connection_limiter: Arc<ConnectionLimiter>,
    started_at: Instant,
    /// Monotonic microsecond clock used to keep client-stream `request_id`s
    /// from colliding when several subscriptions for the same
    /// `(contract_id, tick_type)` start within the same wall-clock
    /// microsecond (spec §3: the caller owns request_id uniqueness).
    request_time_floor: AtomicI32,
}

impl std::ops::Deref for AppState {
    type Target = Inner;
    fn deref(&self) -> &Inner {
        &self.0
    }
}

impl AppState {
    /// `make_driver` is called once per upstream connection this gateway
    /// opens (interactive, and background if configured) rather than taking
    /// one shared driver: each is its own TWS API session with its own
    /// `client_id` (spec §4.2), and [`crate::upstream::driver::TwsDriver::events`]
    /// hands out its receiver exactly once, so two connections sharing one
    /// driver instance would panic the second time a reader asked for it.
    pub fn new(config: Config, make_driver: impl Fn() -> Arc<dyn TwsDriver>) -> Self {
        let storage = Arc::new(StorageOrchestrator::new(StorageOrchestratorConfig {
            storage_root: config.storage_path.clone(),
            enable_json: config.enable_json,
            enable_binary: config.enable_protobuf,
            ..Default::default()
        }));
        let router = Arc::new(StreamRouter::new(
            storage.clone(),
            config.enable_client_stream_storage,
        ));

        let connection = Arc::new(UpstreamConnection::new(
            ConnectionConfig {
                host: config.host.clone(),
                ports: config.ports.clone(),
                client_id: config.client_id,
                ..Default::default()
            },
            make_driver(),
        ));
        upstream::spawn_reader(connection.clone(), router.clone(), false);

        let lookup_client = ContractLookupClient::new(config.contract_service_base_url.clone());
        let contract_cache = Arc::new(ContractCache::new(lookup_client, CONTRACT_LOOKUP_CACHE_TTL));

        let background = if config.background_streaming_enabled() {
            let bg_connection = Arc::new(UpstreamConnection::new(
                ConnectionConfig {
                    host: config.host.clone(),
                    ports: config.ports.clone(),
                    client_id: config.background_client_id(),
                    ..Default::default()
                },
                make_driver(),
            ));
            upstream::spawn_reader(bg_connection.clone(), router.clone(), true);
            Some(BackgroundManager::new(
                config.tracked_contracts.clone(),
                bg_connection,
                router.clone(),
                contract_cache.clone(),
            ))
        } else {
            None
        };

        Self(Arc::new(Inner {
            config,
            router,
            storage,
            connection,
            background,
            contract_cache,
            ip_connection_limiter: Arc::new(ConnectionLimiter::new(MAX_CONNECTIONS_PER_IP)),
            started_at: Instant::now(),
            request_time_floor: AtomicI32::new(0),
        }))
    }

    /// Connects the interactive session and starts every long-running task
    /// this gateway owns (spec §5's task list): the interactive reconnect
    /// supervisor plus, if configured, the background manager's connection
    /// loop and staleness monitor.
    pub async fn spawn_tasks(&self) {
        if let Err(e) = self.connection.connect().await {
            tracing::warn!(error = %e, "initial_interactive_connect_failed_will_retry");
        }
        upstream::spawn_interactive_supervisor(self.connection.clone());
        if let Some(bg) = &self.background {
            bg.spawn();
            info!(tracked = self.config.tracked_contracts.len(), "background_manager_started");
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Generates a `request_id` per spec §3's formula, nudging the
    /// microsecond input forward on a same-tick collision so the router's
    /// "duplicate request_id is a programmer error" contract is never
    /// violated by two subscriptions racing in the same microsecond.
    fn next_client_request_id(&self, contract_id: i64, tick_type: TickType) -> i32 {
        loop {
            let now_us = chrono::Utc::now().timestamp_micros();
            let nonce = self.request_time_floor.fetch_add(1, Ordering::Relaxed) as i64;
            let candidate = TickMessage::generate_request_id(contract_id, tick_type, now_us + nonce);
            if candidate < crate::config::BG_BASE && !self.router.is_registered(candidate) {
                return candidate;
            }
        }
    }

    /// Starts one client-facing live subscription (C9 -> C5/C6): requests
    /// the upstream tick stream, registers a [`StreamHandler`] whose sink is
    /// the transport's, and returns the handler plus its `request_id` so the
    /// caller can release it via [`AppState::stop_live_stream`] when the
    /// transport closes.
    pub async fn start_live_stream(
        &self,
        contract_id: i64,
        tick_type: TickType,
        stream_id: String,
        limit: Option<u64>,
        deadline: Option<Instant>,
        sink: Box<dyn ConsumerSink>,
    ) -> Result<(i32, Arc<StreamHandler>), UpstreamError> {
        let request_id = self.next_client_request_id(contract_id, tick_type);
        self.connection
            .request_tick_stream(request_id, contract_id, tick_type)
            .await
            .map_err(|e| UpstreamError::Socket(e.to_string()))?;
        let handler = Arc::new(StreamHandler::new(
            request_id,
            contract_id,
            tick_type,
            stream_id,
            limit,
            deadline,
            sink,
        ));
        self.router.register(handler.clone());
        Ok((request_id, handler))
    }

    /// Idempotent teardown of a live subscription: cancels the upstream
    /// request and unregisters the handler. Safe to call more than once
    /// (e.g. once from the handler's own terminal path and once from the
    /// transport's drop guard).
    pub async fn stop_live_stream(&self, request_id: i32) {
        self.connection.cancel_tick_stream(request_id).await;
        self.router.unregister(request_id);
    }

    /// `DELETE /stream/{contract_id}` (spec §6): force-terminates every
    /// client-facing subscription on this contract and releases its upstream
    /// request slot. Returns the number of subscriptions stopped.
    pub async fn stop_streams_for_contract(&self, contract_id: i64) -> usize {
        let handlers = self.router.client_handlers_for_contract(contract_id);
        for handler in &handlers {
            handler.force_terminal(crate::models::TerminalReason::ManualStop);
            self.stop_live_stream(handler.request_id).await;
        }
        handlers.len()
    }

    /// `DELETE /stream/all` (spec §6).
    pub async fn stop_all_client_streams(&self) -> usize {
        let handlers = self.router.client_handlers();
        for handler in &handlers {
            handler.force_terminal(crate::models::TerminalReason::ManualStop);
            self.stop_live_stream(handler.request_id).await;
        }
        handlers.len()
    }

    /// `GET /stream/active` (spec §6).
    pub fn active_streams_snapshot(&self) -> Vec<Arc<StreamHandler>> {
        self.router.client_handlers()
    }
}
