//! Server-Sent-Events transport (spec §6): one long-lived HTTP response per
//! subscription, `text/event-stream` framed, `X-Stream-Protocol: v2` header.
//!
//! Grounded on the teacher's `main.rs` axum handler shape (typed `Query`
//! extractors, `(StatusCode, Json<...>)` error responses) generalized from
//! REST endpoints to one handler per streaming route.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::Json;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::models::TickType;
use crate::router::handler::{ConsumerSink, StreamEvent, StreamHandler};
use crate::storage::buffer::{replay_and_splice, BufferQuery, BufferedSink, BufferedSinkHandle};
use crate::transport::subscriber::{
    generate_stream_id, Subscriber, WireMessage, DEFAULT_OUTBOUND_CAPACITY, HEARTBEAT_INTERVAL,
};

const MIN_LIMIT: u64 = 1;
const MAX_LIMIT: u64 = 10_000;
const MIN_TIMEOUT_SECS: u64 = 5;
const MAX_TIMEOUT_SECS: u64 = 3_600;
const BUFFER_QUEUE_CAPACITY: usize = 1_000;

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "INVALID_MESSAGE", "message": message.into() })),
    )
        .into_response()
}

fn service_unavailable(message: impl Into<String>) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "CONNECTION_ERROR", "message": message.into() })),
    )
        .into_response()
}

fn validate_limit(limit: Option<u64>) -> Result<Option<u64>, Response> {
    match limit {
        None => Ok(None),
        Some(n) if (MIN_LIMIT..=MAX_LIMIT).contains(&n) => Ok(Some(n)),
        Some(n) => Err(bad_request(format!("limit {n} out of range [{MIN_LIMIT}, {MAX_LIMIT}]"))),
    }
}

fn validate_timeout(timeout: Option<u64>) -> Result<Option<Instant>, Response> {
    match timeout {
        None => Ok(None),
        Some(s) if (MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&s) => {
            Ok(Some(Instant::now() + Duration::from_secs(s)))
        }
        Some(s) => Err(bad_request(format!(
            "timeout {s} out of range [{MIN_TIMEOUT_SECS}, {MAX_TIMEOUT_SECS}]"
        ))),
    }
}

fn parse_contract_id(raw: &str) -> Result<i64, Response> {
    raw.parse::<i64>().map_err(|_| bad_request("contract_id must be an integer"))
}

fn parse_tick_type(raw: &str) -> Result<TickType, Response> {
    TickType::from_str_loose(raw).ok_or_else(|| bad_request(format!("unknown tick_type '{raw}'")))
}

/// Comma-separated `tick_types` query value, defaulting to all four kinds
/// when missing or empty.
fn parse_tick_types(raw: Option<&str>) -> Result<Vec<TickType>, Response> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(TickType::all().to_vec()),
        Some(raw) => {
            let mut out = Vec::new();
            for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                out.push(parse_tick_type(part)?);
            }
            if out.is_empty() {
                return Err(bad_request("tick_types must name at least one tick type"));
            }
            Ok(out)
        }
    }
}

/// `(\d+)[smhd]` (spec §6's `buffer_duration`), e.g. `30m`, `2h`, `1d`.
fn parse_duration_suffix(raw: &str) -> Result<Duration, Response> {
    let raw = raw.trim();
    let (digits, unit) = raw.split_at(raw.len().saturating_sub(1));
    let n: u64 = digits
        .parse()
        .map_err(|_| bad_request(format!("invalid duration '{raw}', expected e.g. '1h'")))?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3_600,
        "d" => n * 86_400,
        _ => return Err(bad_request(format!("invalid duration unit in '{raw}', expected one of s/m/h/d"))),
    };
    Ok(Duration::from_secs(secs))
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, Response> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| bad_request(format!("invalid ISO-8601 timestamp '{raw}'")))
}

fn sse_event(msg: &WireMessage) -> Event {
    Event::default()
        .event(msg.kind)
        .json_data(msg)
        .unwrap_or_else(|_| Event::default().event("error").data("{\"message\":\"encode_failed\"}"))
}

fn is_terminal_frame(msg: &WireMessage) -> bool {
    match msg.kind {
        "complete" => true,
        "error" => msg.data.get("recoverable").and_then(Value::as_bool) == Some(false),
        _ => false,
    }
}

/// Releases every upstream subscription tied to this response body when it
/// is dropped — on normal completion (already idempotent with each
/// handler's own terminal path) and, crucially, on client disconnect, which
/// axum signals only by dropping the response stream rather than an
/// explicit callback.
struct CleanupGuard {
    state: AppState,
    request_ids: Vec<i32>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let state = self.state.clone();
        let request_ids = std::mem::take(&mut self.request_ids);
        tokio::spawn(async move {
            for request_id in request_ids {
                state.stop_live_stream(request_id).await;
            }
        });
    }
}

/// Builds the SSE body common to every streaming route: drains `rx`,
/// injecting a heartbeat frame whenever nothing arrives within
/// [`HEARTBEAT_INTERVAL`], and ends after yielding a terminal frame
/// (`complete`, or a non-recoverable `error`). `guard` is carried through
/// the fold purely so it drops — and releases its upstream subscriptions —
/// when the stream itself is dropped, whichever happens first.
fn build_sse_stream(
    rx: tokio::sync::mpsc::Receiver<WireMessage>,
    stream_id: String,
    guard: CleanupGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(
        (rx, Arc::new(stream_id), Arc::new(guard), false),
        |(mut rx, stream_id, guard, done)| async move {
            if done {
                return None;
            }
            tokio::select! {
                received = rx.recv() => match received {
                    Some(msg) => {
                        let terminal = is_terminal_frame(&msg);
                        Some((Ok(sse_event(&msg)), (rx, stream_id, guard, terminal)))
                    }
                    None => None,
                },
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    let hb = WireMessage::heartbeat(&stream_id);
                    Some((Ok(sse_event(&hb)), (rx, stream_id, guard, false)))
                }
            }
        },
    )
}

fn with_protocol_header(response: Response) -> Response {
    let mut response = response;
    response
        .headers_mut()
        .insert("x-stream-protocol", HeaderValue::from_static("v2"));
    response
}

#[derive(Debug, Deserialize)]
pub struct LiveParams {
    pub limit: Option<u64>,
    pub timeout: Option<u64>,
}

/// `GET /v2/stream/{contract_id}/live/{tick_type}`
pub async fn live_single(
    State(state): State<AppState>,
    Path((contract_id, tick_type)): Path<(String, String)>,
    Query(params): Query<LiveParams>,
) -> Response {
    let contract_id = match parse_contract_id(&contract_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tick_type = match parse_tick_type(&tick_type) {
        Ok(v) => v,
        Err(e) => return e,
    };
    start_live(state, contract_id, vec![tick_type], params.limit, params.timeout).await
}

#[derive(Debug, Deserialize)]
pub struct LiveMultiParams {
    pub tick_types: Option<String>,
    pub limit: Option<u64>,
    pub timeout: Option<u64>,
}

/// `GET /v2/stream/{contract_id}/live?tick_types=bid_ask,last`
pub async fn live_multi(
    State(state): State<AppState>,
    Path(contract_id): Path<String>,
    Query(params): Query<LiveMultiParams>,
) -> Response {
    let contract_id = match parse_contract_id(&contract_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tick_types = match parse_tick_types(params.tick_types.as_deref()) {
        Ok(v) => v,
        Err(e) => return e,
    };
    start_live(state, contract_id, tick_types, params.limit, params.timeout).await
}

/// Shared live-subscription setup for both the single- and multi-tick-type
/// routes. Only one upstream `request_id` is created per tick type (spec
/// §3's request_id is per `(contract_id, tick_type)`); a "multi" route just
/// fans one `stream_id` out across several handlers sharing one sink.
async fn start_live(
    state: AppState,
    contract_id: i64,
    tick_types: Vec<TickType>,
    limit: Option<u64>,
    timeout: Option<u64>,
) -> Response {
    let limit = match validate_limit(limit) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let deadline = match validate_timeout(timeout) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let stream_id = generate_stream_id(contract_id, &tick_types);
    let (subscriber, rx) = Subscriber::new(stream_id.clone(), DEFAULT_OUTBOUND_CAPACITY);
    subscriber.deliver(StreamEvent::Info("subscribed".to_string()));
    let subscriber = Arc::new(subscriber);

    struct Fanout(Arc<Subscriber>);
    impl ConsumerSink for Fanout {
        fn deliver(&self, event: StreamEvent) -> bool {
            self.0.deliver(event)
        }
    }

    let mut request_ids = Vec::with_capacity(tick_types.len());
    for tick_type in tick_types {
        let sink = Box::new(Fanout(subscriber.clone()));
        match state
            .start_live_stream(contract_id, tick_type, stream_id.clone(), limit, deadline, sink)
            .await
        {
            Ok((request_id, _handler)) => request_ids.push(request_id),
            Err(e) => {
                for rid in request_ids {
                    state.stop_live_stream(rid).await;
                }
                return service_unavailable(e.to_string());
            }
        }
    }

    let guard = CleanupGuard {
        state: state.clone(),
        request_ids,
    };
    let body = build_sse_stream(rx, stream_id, guard);

    with_protocol_header(Sse::new(body).into_response())
}

#[derive(Debug, Deserialize)]
pub struct BufferParams {
    pub tick_types: Option<String>,
    pub buffer_duration: Option<String>,
    pub limit: Option<u64>,
    pub timeout: Option<u64>,
}

/// `GET /v2/stream/{contract_id}/buffer` (spec §4.6 / §8 scenario S2):
/// historical replay over the trailing `buffer_duration` window, spliced
/// into the live tick stream with no gap.
pub async fn buffer_then_live(
    State(state): State<AppState>,
    Path(contract_id): Path<String>,
    Query(params): Query<BufferParams>,
) -> Response {
    let contract_id = match parse_contract_id(&contract_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tick_types = match parse_tick_types(params.tick_types.as_deref()) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let window = match parse_duration_suffix(params.buffer_duration.as_deref().unwrap_or("1h")) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let limit = match validate_limit(params.limit) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let deadline = match validate_timeout(params.timeout) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let stream_id = generate_stream_id(contract_id, &tick_types);
    let (subscriber, rx) = Subscriber::new(stream_id.clone(), DEFAULT_OUTBOUND_CAPACITY);
    let buffered = BufferedSink::new(Box::new(subscriber), BUFFER_QUEUE_CAPACITY);

    // One handler per tick type, all sharing the one BufferedSink; only the
    // first request_id's failure aborts the whole call since they're all
    // subscribed in the same breath.
    let mut request_ids = Vec::with_capacity(tick_types.len());
    for tick_type in &tick_types {
        let sink = Box::new(BufferedSinkHandle(buffered.clone()));
        match state
            .start_live_stream(contract_id, *tick_type, stream_id.clone(), limit, deadline, sink)
            .await
        {
            Ok((request_id, _handler)) => request_ids.push(request_id),
            Err(e) => {
                for rid in request_ids {
                    state.stop_live_stream(rid).await;
                }
                return service_unavailable(e.to_string());
            }
        }
    }

    let now_us = Utc::now().timestamp_micros();
    let start_us = now_us - window.as_micros() as i64;
    let query = BufferQuery {
        contract_id,
        tick_types,
        start_us,
        end_us: now_us,
    };
    let storage = state.storage.clone();
    let replay_sink = buffered.clone();
    tokio::spawn(async move {
        if let Err(e) = replay_and_splice(&storage, &query, &replay_sink).await {
            tracing::warn!(error = %e, "buffer_replay_failed");
        }
    });

    let guard = CleanupGuard {
        state: state.clone(),
        request_ids,
    };
    let body = build_sse_stream(rx, stream_id, guard);

    with_protocol_header(Sse::new(body).into_response())
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub tick_types: Option<String>,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration: Option<String>,
    #[allow(dead_code)]
    pub tz: Option<String>,
    pub limit: Option<u64>,
}

/// `GET /v2/buffer/{contract_id}/range` — a plain historical query, no
/// streaming. `tz` is accepted but every timestamp is interpreted as UTC
/// (spec §6 leaves timezone handling unspecified beyond accepting the
/// parameter).
pub async fn buffer_range(
    State(state): State<AppState>,
    Path(contract_id): Path<String>,
    Query(params): Query<RangeParams>,
) -> Response {
    let contract_id = match parse_contract_id(&contract_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tick_types = match parse_tick_types(params.tick_types.as_deref()) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let limit = match validate_limit(params.limit) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start = match parse_rfc3339(&params.start_time) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end = if let Some(end_time) = &params.end_time {
        match parse_rfc3339(end_time) {
            Ok(v) => v,
            Err(e) => return e,
        }
    } else if let Some(duration) = &params.duration {
        let d = match parse_duration_suffix(duration) {
            Ok(v) => v,
            Err(e) => return e,
        };
        start + chrono::Duration::from_std(d).unwrap_or_default()
    } else {
        return bad_request("either end_time or duration is required");
    };

    match state
        .storage
        .query(
            contract_id,
            &tick_types,
            start.timestamp_micros(),
            end.timestamp_micros(),
            limit.map(|n| n as usize),
        )
        .await
    {
        Ok(messages) => Json(json!({ "contract_id": contract_id, "count": messages.len(), "messages": messages })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "STORAGE_ERROR", "message": e.to_string() })),
        )
            .into_response(),
    }
}

/// `GET /v2/buffer/{contract_id}/info` — best-effort oldest/newest record
/// per tick type over the last 24h, so a client can decide a sane
/// `buffer_duration` before opening a streaming request. An approximation,
/// not a precise index: the storage layer has no dedicated "latest record"
/// query (spec §4.5 only defines ordered range scans).
pub async fn buffer_info(State(state): State<AppState>, Path(contract_id): Path<String>) -> Response {
    let contract_id = match parse_contract_id(&contract_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let now_us = Utc::now().timestamp_micros();
    let day_ago_us = now_us - Duration::from_secs(86_400).as_micros() as i64;

    let mut per_type = serde_json::Map::new();
    for tick_type in TickType::all() {
        let messages = state
            .storage
            .query(contract_id, &[tick_type], day_ago_us, now_us, None)
            .await
            .unwrap_or_default();
        per_type.insert(
            tick_type.as_str().to_string(),
            json!({
                "message_count": messages.len(),
                "oldest_timestamp_us": messages.first().map(|m| m.ib_timestamp_us),
                "newest_timestamp_us": messages.last().map(|m| m.ib_timestamp_us),
            }),
        );
    }

    Json(json!({ "contract_id": contract_id, "window": "24h", "tick_types": per_type })).into_response()
}

/// `GET /v2/buffer/{contract_id}/stats` — message counts per tick type over
/// the contract's configured buffer window if it is a tracked contract,
/// else a 1h default.
pub async fn buffer_stats(State(state): State<AppState>, Path(contract_id): Path<String>) -> Response {
    let contract_id = match parse_contract_id(&contract_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let buffer_hours = state
        .config
        .tracked_contracts
        .iter()
        .find(|c| c.contract_id == contract_id)
        .map(|c| c.buffer_hours)
        .unwrap_or(1);

    let now_us = Utc::now().timestamp_micros();
    let start_us = now_us - Duration::from_secs(buffer_hours as u64 * 3_600).as_micros() as i64;

    let mut counts = serde_json::Map::new();
    let mut total = 0usize;
    for tick_type in TickType::all() {
        let messages = state
            .storage
            .query(contract_id, &[tick_type], start_us, now_us, None)
            .await
            .unwrap_or_default();
        total += messages.len();
        counts.insert(tick_type.as_str().to_string(), json!(messages.len()));
    }

    Json(json!({
        "contract_id": contract_id,
        "buffer_hours": buffer_hours,
        "total_messages": total,
        "by_tick_type": counts,
    }))
    .into_response()
}

/// `GET /health` (spec §6).
pub async fn health(State(state): State<AppState>) -> Response {
    let background = state.background.as_ref().map(|bg| {
        json!({
            "overall": bg.overall_health(),
            "active_subscriptions": bg.active_subscription_count(),
        })
    });
    Json(json!({
        "status": "ok",
        "uptime_secs": state.uptime().as_secs(),
        "upstream_connected": state.connection.is_connected(),
        "active_streams": state.active_streams_snapshot().len(),
        "background": background,
    }))
    .into_response()
}

/// `GET /background/health` (spec §6's surface over C7/C8's existing
/// per-contract health computation — no new logic, just a read).
pub async fn background_health(State(state): State<AppState>) -> Response {
    let Some(bg) = state.background.as_ref() else {
        return Json(json!({
            "enabled": false,
            "overall": "UNKNOWN",
            "contracts": {},
        }))
        .into_response();
    };
    let per_contract: Value = bg
        .health_snapshot()
        .into_iter()
        .map(|(contract_id, status)| (contract_id.to_string(), json!(status)))
        .collect();
    Json(json!({
        "enabled": true,
        "overall": bg.overall_health(),
        "active_subscriptions": bg.active_subscription_count(),
        "contracts": per_contract,
    }))
    .into_response()
}

fn handler_summary(handler: &Arc<StreamHandler>) -> Value {
    json!({
        "request_id": handler.request_id,
        "contract_id": handler.contract_id,
        "tick_type": handler.tick_type,
        "stream_id": handler.stream_id,
        "tick_count": handler.tick_count(),
        "elapsed_secs": handler.start_time.elapsed().as_secs(),
    })
}

/// `GET /stream/active` (spec §6).
pub async fn active_streams(State(state): State<AppState>) -> Response {
    let streams: Vec<Value> = state.active_streams_snapshot().iter().map(handler_summary).collect();
    Json(json!({ "count": streams.len(), "streams": streams })).into_response()
}

/// `DELETE /stream/{contract_id}` (spec §6).
pub async fn stop_contract_streams(State(state): State<AppState>, Path(contract_id): Path<String>) -> Response {
    let contract_id = match parse_contract_id(&contract_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let stopped = state.stop_streams_for_contract(contract_id).await;
    Json(json!({ "contract_id": contract_id, "stopped": stopped })).into_response()
}

/// `DELETE /stream/all` (spec §6).
pub async fn stop_all_streams(State(state): State<AppState>) -> Response {
    let stopped = state.stop_all_client_streams().await;
    Json(json!({ "stopped": stopped })).into_response()
}
