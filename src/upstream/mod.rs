pub mod connection;
pub mod driver;

pub use connection::{ConnectionConfig, ConnectionObserver, SessionState, UpstreamConnection};
pub use driver::{ContractSummary, DriverEvent, DriverTick, FakeDriver, TwsDriver};

use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::{classify_upstream_code, is_informational_code, ErrorKind};
use crate::models::TickMessage;
use crate::router::StreamRouter;

/// The "TWS reader" task (spec §5, task 1): decodes inbound driver events
/// and calls into the router synchronously. Must never block on downstream
/// I/O — it only enqueues (`route_tick`/`route_error` are O(1) table ops
/// plus a non-blocking storage enqueue). Exactly one reader is spawned per
/// [`UpstreamConnection`], for the lifetime of the process; reconnects
/// reuse the same event channel (the driver, not the channel, is what gets
/// re-established on `connect()`).
///
/// `is_background` selects which half of the shared router table this
/// connection may clear/broadcast into on connection loss (spec §4.2's
/// `BG_BASE` partition) — the interactive and background sessions are
/// independent and must not disturb each other's handlers.
pub fn spawn_reader(connection: Arc<UpstreamConnection>, router: Arc<StreamRouter>, is_background: bool) {
    let mut events = connection.request_events();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DriverEvent::NextValidId(_) => {}
                DriverEvent::Tick(tick) => {
                    let message = TickMessage {
                        ib_timestamp_us: tick.ib_timestamp_us,
                        system_timestamp_us: now_us(),
                        contract_id: tick.contract_id,
                        tick_type: tick.tick_type,
                        request_id: tick.request_id,
                        price: tick.price,
                        size: tick.size,
                        unreported: tick.unreported,
                        bid_price: tick.bid_price,
                        bid_size: tick.bid_size,
                        ask_price: tick.ask_price,
                        ask_size: tick.ask_size,
                        bid_past_low: tick.bid_past_low,
                        ask_past_high: tick.ask_past_high,
                        mid_point: tick.mid_point,
                    };
                    router.route_tick(tick.request_id, message);
                }
                DriverEvent::Error {
                    request_id,
                    code,
                    message,
                } => {
                    connection.handle_error_event(code, request_id, &message);
                    if is_informational_code(code) {
                        debug!(code, message, "upstream_informational_code");
                        continue;
                    }
                    let kind: ErrorKind = classify_upstream_code(code);
                    match request_id {
                        Some(rid) => {
                            router.route_error(rid, kind, &message);
                        }
                        None if matches!(kind, ErrorKind::ConnectionError) => {
                            if is_background {
                                router.broadcast_connection_lost_background();
                            } else {
                                router.broadcast_connection_lost_client();
                            }
                        }
                        None => warn!(code, message, "unscoped_upstream_error"),
                    }
                }
                DriverEvent::ConnectionClosed => {
                    connection.handle_disconnect_event();
                    if is_background {
                        router.clear_background();
                    } else {
                        router.clear_client();
                    }
                }
            }
        }
    });
}

/// Reconnect supervisor for the interactive connection (spec §5, task 2).
/// The background manager runs its own, more elaborate version of this loop
/// (spec §4.3) since it also drives tracked-contract subscriptions; this is
/// the plain version used for the client-facing connection, which has no
/// subscriptions of its own to restart — only SSE/WS handlers do, and those
/// are cleaned up by [`spawn_reader`] on disconnect.
pub fn spawn_interactive_supervisor(connection: Arc<UpstreamConnection>) {
    tokio::spawn(async move {
        loop {
            if connection.is_connected() {
                tokio::time::sleep(connection.liveness_check_interval()).await;
                connection.verify_liveness().await;
                continue;
            }
            if let Err(e) = connection.connect().await {
                debug!(error = %e, "interactive_connect_attempt_failed");
                tokio::time::sleep(connection.next_backoff()).await;
            }
        }
    });
}

fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
