//! HTTP/WebSocket transport (C9): axum route wiring over [`crate::app::AppState`].
//!
//! Grounded on the teacher's `main.rs` router assembly (nested `Router::new()`
//! with a `with_state`, `TraceLayer`, and a permissive `CorsLayer`) and its
//! `websocket_handler`/`handle_socket` shape, generalized from one fixed
//! message schema to this gateway's SSE + WS endpoint set (spec §6).

pub mod sse;
pub mod subscriber;
pub mod ws;

use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app::AppState;
use crate::middleware::{rate_limit_middleware, RateLimitConfig, RateLimitLayer};

pub fn build_router(state: AppState) -> Router {
    let rate_limiter = RateLimitLayer::new(RateLimitConfig::default());
    Router::new()
        .route("/health", get(sse::health))
        .route("/background/health", get(sse::background_health))
        .route("/stream/active", get(sse::active_streams))
        .route("/stream/:contract_id", delete(sse::stop_contract_streams))
        .route("/stream/all", delete(sse::stop_all_streams))
        .route("/v2/stream/:contract_id/live/:tick_type", get(sse::live_single))
        .route("/v2/stream/:contract_id/live", get(sse::live_multi))
        .route("/v2/stream/:contract_id/buffer", get(sse::buffer_then_live))
        .route("/v2/buffer/:contract_id/range", get(sse::buffer_range))
        .route("/v2/buffer/:contract_id/info", get(sse::buffer_info))
        .route("/v2/buffer/:contract_id/stats", get(sse::buffer_stats))
        .route("/v2/ws/stream", get(ws::upgrade))
        .layer(from_fn_with_state(rate_limiter, rate_limit_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
