//! Stream router (C6): the sole point of demultiplexing from upstream, and
//! the only place ticks enter storage (spec §4.2).

pub mod handler;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::BG_BASE;
use crate::errors::ErrorKind;
use crate::models::TickMessage;
use crate::storage::StorageOrchestrator;
use handler::StreamHandler;

pub struct StreamRouter {
    handlers: RwLock<HashMap<i32, Arc<StreamHandler>>>,
    storage: Arc<StorageOrchestrator>,
    /// Default-true policy flag: whether client-facing (non-background)
    /// streams are also persisted. Background handlers (`request_id >=
    /// BG_BASE`) are always stored regardless of this flag.
    store_client_streams: bool,
}

impl StreamRouter {
    pub fn new(storage: Arc<StorageOrchestrator>, store_client_streams: bool) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            storage,
            store_client_streams,
        }
    }

    /// Adds a handler. Duplicate `request_id` is a programmer error (spec
    /// §4.2): the caller is responsible for request-id uniqueness.
    pub fn register(&self, handler: Arc<StreamHandler>) {
        let request_id = handler.request_id;
        let mut table = self.handlers.write();
        if table.contains_key(&request_id) {
            panic!("duplicate request_id {request_id} registered with stream router");
        }
        table.insert(request_id, handler);
    }

    /// Idempotent.
    pub fn unregister(&self, request_id: i32) {
        self.handlers.write().remove(&request_id);
    }

    pub fn is_registered(&self, request_id: i32) -> bool {
        self.handlers.read().contains_key(&request_id)
    }

    pub fn active_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Client-facing (non-background) handlers, for the admin/status
    /// transport endpoints (spec §6's `/stream/active`, `DELETE /stream/*`).
    pub fn client_handlers(&self) -> Vec<Arc<StreamHandler>> {
        self.handlers
            .read()
            .values()
            .filter(|h| h.request_id < BG_BASE)
            .cloned()
            .collect()
    }

    pub fn client_handlers_for_contract(&self, contract_id: i64) -> Vec<Arc<StreamHandler>> {
        self.handlers
            .read()
            .values()
            .filter(|h| h.request_id < BG_BASE && h.contract_id == contract_id)
            .cloned()
            .collect()
    }

    fn should_store(&self, request_id: i32) -> bool {
        request_id >= BG_BASE || self.store_client_streams
    }

    /// Routes a tick to its handler (if any) and, per policy, into storage.
    /// Storage enqueue happens regardless of whether a live handler exists,
    /// since background (storage-only) ticks have no handler-side consumer
    /// beyond the no-op sink registered for them.
    pub fn route_tick(&self, request_id: i32, tick: TickMessage) -> bool {
        if self.should_store(request_id) {
            self.storage.store(tick.clone());
        }

        let handler = self.handlers.read().get(&request_id).cloned();
        match handler {
            Some(handler) => {
                if let Some(_reason) = handler.on_tick(tick, false) {
                    self.unregister(request_id);
                }
                true
            }
            None => {
                debug!(request_id, "no handler registered for request_id, tick storage-only");
                false
            }
        }
    }

    pub fn route_error(&self, request_id: i32, kind: ErrorKind, message: &str) -> bool {
        let handler = self.handlers.read().get(&request_id).cloned();
        match handler {
            Some(handler) => {
                if let Some(_reason) = handler.on_error(kind, message) {
                    self.unregister(request_id);
                }
                true
            }
            None => false,
        }
    }

    /// On shutdown, every handler receives `complete{reason=server_shutdown}`
    /// before the router stops (spec §5 cancellation/timeouts).
    pub fn shutdown_all(&self) {
        let table = self.handlers.write();
        for handler in table.values() {
            handler.force_terminal(crate::models::TerminalReason::ServerShutdown);
        }
    }

    /// A reconnect cancels all subscriptions known to the previous session;
    /// new request ids are issued on the next session (spec §5).
    pub fn clear_all(&self) {
        self.handlers.write().clear();
    }

    /// The gateway runs two independent upstream sessions (interactive and
    /// background, spec §4.3) sharing one router table. A reconnect on one
    /// session must not disturb handlers owned by the other — these split
    /// `clear_all`/`broadcast_connection_lost` by the `BG_BASE` partition
    /// (spec §4.2) instead of nuking the whole table.
    pub fn clear_background(&self) {
        self.handlers.write().retain(|&rid, _| rid < BG_BASE);
    }

    pub fn clear_client(&self) {
        self.handlers.write().retain(|&rid, _| rid >= BG_BASE);
    }

    /// Upstream session loss (spec §7): every handler receives
    /// `error{CONNECTION_ERROR, recoverable=true}` followed immediately by
    /// `complete{reason=error}` — the connection itself may reconnect, but
    /// an existing subscriber's view of THIS session has ended.
    pub fn broadcast_connection_lost(&self) {
        self.broadcast_connection_lost_matching(|_| true);
    }

    pub fn broadcast_connection_lost_client(&self) {
        self.broadcast_connection_lost_matching(|rid| rid < BG_BASE);
    }

    pub fn broadcast_connection_lost_background(&self) {
        self.broadcast_connection_lost_matching(|rid| rid >= BG_BASE);
    }

    fn broadcast_connection_lost_matching(&self, matches_scope: impl Fn(i32) -> bool) {
        let handlers: Vec<_> = self
            .handlers
            .read()
            .iter()
            .filter(|(&rid, _)| matches_scope(rid))
            .map(|(_, h)| h.clone())
            .collect();
        for handler in &handlers {
            handler.on_error(ErrorKind::ConnectionError, "upstream connection lost");
            handler.force_terminal(crate::models::TerminalReason::Error);
        }
        self.handlers.write().retain(|&rid, _| !matches_scope(rid));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TickType, TrackedContract};
    use crate::storage::{StorageOrchestrator, StorageOrchestratorConfig};
    use handler::{ConsumerSink, NullSink, StreamEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tick(request_id: i32) -> TickMessage {
        TickMessage {
            ib_timestamp_us: 1,
            system_timestamp_us: 1,
            contract_id: 265598,
            tick_type: TickType::Last,
            request_id,
            price: Some(1.0),
            size: Some(1.0),
            unreported: false,
            bid_price: None,
            bid_size: None,
            ask_price: None,
            ask_size: None,
            bid_past_low: false,
            ask_past_high: false,
            mid_point: None,
        }
    }

    fn empty_storage() -> Arc<StorageOrchestrator> {
        Arc::new(StorageOrchestrator::disabled(StorageOrchestratorConfig::default()))
    }

    #[test]
    fn duplicate_request_id_panics() {
        let router = StreamRouter::new(empty_storage(), true);
        let h1 = Arc::new(StreamHandler::new(
            1,
            265598,
            TickType::Last,
            "s1".into(),
            None,
            None,
            Box::new(NullSink),
        ));
        let h2 = Arc::new(StreamHandler::new(
            1,
            265598,
            TickType::Last,
            "s2".into(),
            None,
            None,
            Box::new(NullSink),
        ));
        router.register(h1);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            router.register(h2);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn unregister_is_idempotent() {
        let router = StreamRouter::new(empty_storage(), true);
        router.unregister(999);
        router.unregister(999);
    }

    #[test]
    fn route_tick_to_unknown_request_id_returns_false() {
        let router = StreamRouter::new(empty_storage(), true);
        assert!(!router.route_tick(42, tick(42)));
    }

    struct CountingSink(Arc<AtomicUsize>);
    impl ConsumerSink for CountingSink {
        fn deliver(&self, event: StreamEvent) -> bool {
            if matches!(event, StreamEvent::Tick { .. }) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
            true
        }
    }

    #[test]
    fn cross_talk_is_impossible_between_request_ids() {
        let router = StreamRouter::new(empty_storage(), true);
        let counter_a = Arc::new(AtomicUsize::new(0));
        let counter_b = Arc::new(AtomicUsize::new(0));
        router.register(Arc::new(StreamHandler::new(
            1,
            265598,
            TickType::Last,
            "a".into(),
            None,
            None,
            Box::new(CountingSink(counter_a.clone())),
        )));
        router.register(Arc::new(StreamHandler::new(
            2,
            711280073,
            TickType::BidAsk,
            "b".into(),
            None,
            None,
            Box::new(CountingSink(counter_b.clone())),
        )));
        router.route_tick(1, tick(1));
        router.route_tick(1, tick(1));
        router.route_tick(2, tick(2));
        assert_eq!(counter_a.load(Ordering::Relaxed), 2);
        assert_eq!(counter_b.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn background_request_ids_always_stored_regardless_of_policy() {
        let router = StreamRouter::new(empty_storage(), false);
        // request_id below BG_BASE with store_client_streams=false: no handler, not stored (storage disabled anyway, just checking should_store logic path doesn't panic)
        assert!(!router.should_store(1));
        assert!(router.should_store(BG_BASE));
    }
}
