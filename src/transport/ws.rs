//! WebSocket transport (spec §6): one socket serves many subscriptions.
//!
//! Two envelope shapes share the wire: control-plane acknowledgements
//! (`connected`/`subscribed`/`unsubscribed`/`pong`) are `{type, id,
//! timestamp, data?}` keyed on the client-supplied `id`; data-plane frames
//! (`tick`/`error`/`complete`/`info`/`heartbeat`) reuse the SSE transport's
//! [`WireMessage`] envelope. Both ride one bounded `mpsc::channel` per
//! connection — a full channel is this connection's problem alone, so it
//! closes the whole socket rather than dropping one subscription's frame.
//!
//! Grounded on the teacher's `handle_socket`/`websocket_handler` split
//! (`axum::extract::ws`, a dedicated per-connection task reading and
//! writing over one `WebSocket`) generalized from one fixed subscription
//! per socket to this gateway's dynamic subscribe/unsubscribe protocol.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::Response;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

use crate::app::AppState;
use crate::errors::ErrorKind;
use crate::middleware::ConnectionGuard;
use crate::models::TickType;
use crate::router::handler::{ConsumerSink, StreamEvent};
use crate::transport::subscriber::{generate_stream_id, WireMessage, HEARTBEAT_INTERVAL};

const WS_OUTBOUND_CAPACITY: usize = 1_000;
const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 20;
const MAX_INBOUND_MESSAGES_PER_SEC: u32 = 100;
const MAX_CONSECUTIVE_MALFORMED: u32 = 5;
/// Stream id attached to errors that precede any real subscription (bad
/// JSON, unknown message type) — there is no `stream_id` to correlate yet.
const CONTROL_STREAM_ID: &str = "_control";

pub async fn upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let guard = state.ip_connection_limiter.try_acquire(addr.ip());
    ws.on_upgrade(move |socket| handle_socket(socket, state, guard))
}

/// `subscribe.data.config` (spec §6): all fields optional, `limit`/
/// `timeout_seconds` are the only ones this gateway currently acts on —
/// `buffer_size`/`include_extended` are accepted so a conformant client's
/// frame still deserializes, but this transport has no per-subscription
/// buffer or extended-hours behavior to apply them to.
#[derive(Debug, Deserialize)]
struct SubscribeConfig {
    limit: Option<u64>,
    timeout_seconds: Option<u64>,
    #[allow(dead_code)]
    buffer_size: Option<usize>,
    #[allow(dead_code)]
    include_extended: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SubscribeData {
    contract_id: i64,
    tick_types: Vec<String>,
    config: Option<SubscribeConfig>,
}

#[derive(Debug, Deserialize)]
struct UnsubscribeData {
    stream_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        id: String,
        data: SubscribeData,
    },
    Unsubscribe {
        id: String,
        data: UnsubscribeData,
    },
    UnsubscribeAll {
        id: String,
    },
    Ping {
        id: String,
    },
}

/// Control-plane envelope: `{type, id, timestamp, data?}`.
#[derive(Debug, Serialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl ControlMessage {
    fn new(kind: &'static str, id: Option<String>, data: Option<Value>) -> Self {
        Self {
            kind,
            id,
            timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            data,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OutboundFrame {
    Control(ControlMessage),
    Data(WireMessage),
}

/// What the writer side of the connection loop does with one queued item.
enum Outbound {
    Frame(OutboundFrame),
    Close { code: u16, reason: String },
}

/// One [`ConsumerSink`] per upstream `request_id`, all funneling into the
/// one outbound channel shared by the whole connection. A full channel (a
/// slow WS consumer) and an upstream `ConnectionError` both route through
/// `force_close`, since either condition ends the whole socket, not just
/// one subscription.
struct ConnSink {
    stream_id: String,
    tx: mpsc::Sender<Outbound>,
    force_close: Arc<Notify>,
    slow_consumer: Arc<AtomicBool>,
    connection_lost: Arc<AtomicBool>,
}

impl ConsumerSink for ConnSink {
    fn deliver(&self, event: StreamEvent) -> bool {
        if let StreamEvent::Error {
            kind: ErrorKind::ConnectionError,
            ..
        } = &event
        {
            self.connection_lost.store(true, Ordering::Relaxed);
        }
        let msg = WireMessage::from_event(&self.stream_id, &event);
        match self.tx.try_send(Outbound::Frame(OutboundFrame::Data(msg))) {
            Ok(()) => {
                if self.connection_lost.load(Ordering::Relaxed) {
                    self.force_close.notify_one();
                }
                true
            }
            Err(_) => {
                self.slow_consumer.store(true, Ordering::Relaxed);
                self.force_close.notify_one();
                false
            }
        }
    }
}

/// Slow-consumer takes priority: a full channel is this connection's own
/// fault regardless of what else is going on, and 1011 (server error) is the
/// closer match than 4003 (upstream lost) when both happen to be set.
fn force_close_code(slow_consumer: bool, connection_lost: bool) -> u16 {
    if slow_consumer {
        1011
    } else if connection_lost {
        4003
    } else {
        1011
    }
}

fn send_control(tx: &mpsc::Sender<Outbound>, kind: &'static str, id: Option<String>, data: Option<Value>) {
    let _ = tx.try_send(Outbound::Frame(OutboundFrame::Control(ControlMessage::new(kind, id, data))));
}

fn send_error(tx: &mpsc::Sender<Outbound>, stream_id: &str, code: ErrorKind, message: impl Into<String>) {
    let event = StreamEvent::Error {
        kind: code,
        message: message.into(),
        recoverable: true,
    };
    let msg = WireMessage::from_event(stream_id, &event);
    let _ = tx.try_send(Outbound::Frame(OutboundFrame::Data(msg)));
}

async fn handle_socket(socket: WebSocket, state: AppState, guard: Option<ConnectionGuard>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Some(_connection_guard) = guard else {
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: 4004,
                reason: "too many connections from this address".into(),
            })))
            .await;
        return;
    };

    let (tx, mut rx) = mpsc::channel::<Outbound>(WS_OUTBOUND_CAPACITY);
    let force_close = Arc::new(Notify::new());
    let slow_consumer = Arc::new(AtomicBool::new(false));
    let connection_lost = Arc::new(AtomicBool::new(false));
    let mut subscriptions: HashMap<String, Vec<i32>> = HashMap::new();

    let mut inbound_count: u32 = 0;
    let mut inbound_window_start = Instant::now();
    let mut malformed_streak: u32 = 0;

    send_control(
        &tx,
        "connected",
        None,
        Some(json!({
            "version": "v2",
            "capabilities": ["subscribe", "unsubscribe", "unsubscribe_all", "ping"],
        })),
    );

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let now = Instant::now();
                        if now.duration_since(inbound_window_start) >= Duration::from_secs(1) {
                            inbound_window_start = now;
                            inbound_count = 0;
                        }
                        inbound_count += 1;
                        if inbound_count > MAX_INBOUND_MESSAGES_PER_SEC {
                            let _ = ws_tx
                                .send(Message::Close(Some(CloseFrame {
                                    code: 4004,
                                    reason: "inbound message rate exceeded".into(),
                                })))
                                .await;
                            break;
                        }

                        let well_formed = dispatch_client_message(
                            &state,
                            &text,
                            &tx,
                            &mut subscriptions,
                            &force_close,
                            &slow_consumer,
                            &connection_lost,
                        )
                        .await;
                        malformed_streak = if well_formed { 0 } else { malformed_streak + 1 };
                        if malformed_streak >= MAX_CONSECUTIVE_MALFORMED {
                            let _ = ws_tx
                                .send(Message::Close(Some(CloseFrame {
                                    code: 1008,
                                    reason: "too many malformed messages".into(),
                                })))
                                .await;
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws_tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(Outbound::Frame(frame)) => {
                        let text = serde_json::to_string(&frame).unwrap_or_default();
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = ws_tx.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
                        break;
                    }
                    None => break,
                }
            }
            _ = force_close.notified() => {
                let code = force_close_code(slow_consumer.load(Ordering::Relaxed), connection_lost.load(Ordering::Relaxed));
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame { code, reason: "connection terminated".into() })))
                    .await;
                break;
            }
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                let hb = WireMessage::heartbeat("_connection");
                let text = serde_json::to_string(&OutboundFrame::Data(hb)).unwrap_or_default();
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }

    for request_ids in subscriptions.into_values() {
        for request_id in request_ids {
            state.stop_live_stream(request_id).await;
        }
    }
}

/// Parses and applies one inbound frame. Returns `false` only when the text
/// could not be parsed as a [`ClientMessage`] at all — a well-formed message
/// that is then rejected on its own merits (bad contract id, subscription
/// cap) still counts as "well formed" so it never drives the connection
/// toward the malformed-message close path (spec §8 S6: a single invalid
/// subscribe keeps the connection open).
async fn dispatch_client_message(
    state: &AppState,
    text: &str,
    tx: &mpsc::Sender<Outbound>,
    subscriptions: &mut HashMap<String, Vec<i32>>,
    force_close: &Arc<Notify>,
    slow_consumer: &Arc<AtomicBool>,
    connection_lost: &Arc<AtomicBool>,
) -> bool {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            send_error(tx, CONTROL_STREAM_ID, ErrorKind::InvalidMessage, e.to_string());
            return false;
        }
    };

    match message {
        ClientMessage::Subscribe { id, data } => {
            let (limit, timeout) = data
                .config
                .map(|c| (c.limit, c.timeout_seconds))
                .unwrap_or((None, None));
            handle_subscribe(
                state,
                tx,
                subscriptions,
                force_close,
                slow_consumer,
                connection_lost,
                id,
                data.contract_id,
                data.tick_types,
                limit,
                timeout,
            )
            .await
        }
        ClientMessage::Unsubscribe { id, data } => {
            handle_unsubscribe(state, tx, subscriptions, id, data.stream_id).await
        }
        ClientMessage::UnsubscribeAll { id } => {
            handle_unsubscribe_all(state, tx, subscriptions, id).await
        }
        ClientMessage::Ping { id } => {
            send_control(tx, "pong", Some(id), None);
            true
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_subscribe(
    state: &AppState,
    tx: &mpsc::Sender<Outbound>,
    subscriptions: &mut HashMap<String, Vec<i32>>,
    force_close: &Arc<Notify>,
    slow_consumer: &Arc<AtomicBool>,
    connection_lost: &Arc<AtomicBool>,
    id: String,
    contract_id: i64,
    tick_type_strings: Vec<String>,
    limit: Option<u64>,
    timeout: Option<u64>,
) -> bool {
    if contract_id < 1 {
        send_error(tx, &id, ErrorKind::InvalidMessage, "contract_id must be >= 1");
        return true;
    }
    let mut tick_types = Vec::with_capacity(tick_type_strings.len());
    for raw in &tick_type_strings {
        match TickType::from_str_loose(raw) {
            Some(tt) => {
                if !tick_types.contains(&tt) {
                    tick_types.push(tt);
                }
            }
            None => {
                send_error(tx, &id, ErrorKind::InvalidMessage, format!("unknown tick_type '{raw}'"));
                return true;
            }
        }
    }
    if tick_types.is_empty() || tick_types.len() > 4 {
        send_error(tx, &id, ErrorKind::InvalidMessage, "tick_types must name 1 to 4 distinct kinds");
        return true;
    }
    if subscriptions.len() >= MAX_SUBSCRIPTIONS_PER_CONNECTION {
        send_error(
            tx,
            &id,
            ErrorKind::RateLimitExceeded,
            format!("connection already holds {MAX_SUBSCRIPTIONS_PER_CONNECTION} subscriptions"),
        );
        return true;
    }

    let limit = limit.filter(|&n| (1..=10_000).contains(&n));
    let deadline = timeout
        .filter(|&s| (5..=3_600).contains(&s))
        .map(|s| Instant::now() + Duration::from_secs(s));

    let stream_id = generate_stream_id(contract_id, &tick_types);
    let mut request_ids = Vec::with_capacity(tick_types.len());
    for tick_type in tick_types {
        let sink = Box::new(ConnSink {
            stream_id: stream_id.clone(),
            tx: tx.clone(),
            force_close: force_close.clone(),
            slow_consumer: slow_consumer.clone(),
            connection_lost: connection_lost.clone(),
        });
        match state
            .start_live_stream(contract_id, tick_type, stream_id.clone(), limit, deadline, sink)
            .await
        {
            Ok((request_id, _handler)) => request_ids.push(request_id),
            Err(e) => {
                for rid in request_ids {
                    state.stop_live_stream(rid).await;
                }
                send_error(tx, &id, ErrorKind::ConnectionError, e.to_string());
                return true;
            }
        }
    }

    subscriptions.insert(stream_id.clone(), request_ids);
    send_control(tx, "subscribed", Some(id), Some(json!({ "stream_id": stream_id })));
    true
}

async fn handle_unsubscribe(
    state: &AppState,
    tx: &mpsc::Sender<Outbound>,
    subscriptions: &mut HashMap<String, Vec<i32>>,
    id: String,
    stream_id: String,
) -> bool {
    match subscriptions.remove(&stream_id) {
        Some(request_ids) => {
            for request_id in request_ids {
                state.stop_live_stream(request_id).await;
            }
            send_control(tx, "unsubscribed", Some(id), Some(json!({ "stream_id": stream_id })));
        }
        None => {
            send_error(tx, &id, ErrorKind::InvalidMessage, format!("unknown stream_id '{stream_id}'"));
        }
    }
    true
}

async fn handle_unsubscribe_all(
    state: &AppState,
    tx: &mpsc::Sender<Outbound>,
    subscriptions: &mut HashMap<String, Vec<i32>>,
    id: String,
) -> bool {
    let count = subscriptions.len();
    for request_ids in std::mem::take(subscriptions).into_values() {
        for request_id in request_ids {
            state.stop_live_stream(request_id).await;
        }
    }
    send_control(tx, "unsubscribed", Some(id), Some(json!({ "count": count })));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_close_prefers_slow_consumer_over_connection_lost() {
        assert_eq!(force_close_code(true, true), 1011);
        assert_eq!(force_close_code(true, false), 1011);
        assert_eq!(force_close_code(false, true), 4003);
        assert_eq!(force_close_code(false, false), 1011);
    }

    #[test]
    fn subscribe_message_parses_nested_data_envelope() {
        let raw = r#"{"type":"subscribe","id":"req-1","data":{"contract_id":265598,"tick_types":["last","bid_ask"]}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Subscribe { id, data } => {
                assert_eq!(id, "req-1");
                assert_eq!(data.contract_id, 265598);
                assert_eq!(data.tick_types, vec!["last".to_string(), "bid_ask".to_string()]);
                assert!(data.config.is_none());
            }
            _ => panic!("expected Subscribe"),
        }
    }

    #[test]
    fn subscribe_message_parses_nested_config() {
        let raw = r#"{"type":"subscribe","id":"req-2","data":{"contract_id":265598,"tick_types":["last"],
            "config":{"limit":5,"timeout_seconds":60,"buffer_size":200,"include_extended":true}}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Subscribe { id, data } => {
                assert_eq!(id, "req-2");
                let config = data.config.expect("config must parse");
                assert_eq!(config.limit, Some(5));
                assert_eq!(config.timeout_seconds, Some(60));
                assert_eq!(config.buffer_size, Some(200));
                assert_eq!(config.include_extended, Some(true));
            }
            _ => panic!("expected Subscribe"),
        }
    }

    #[test]
    fn unsubscribe_message_parses_nested_data_envelope() {
        let raw = r#"{"type":"unsubscribe","id":"req-3","data":{"stream_id":"265598_last_1_abcd"}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Unsubscribe { id, data } => {
                assert_eq!(id, "req-3");
                assert_eq!(data.stream_id, "265598_last_1_abcd");
            }
            _ => panic!("expected Unsubscribe"),
        }
    }

    /// Spec §8 S6: a well-formed-against-the-schema subscribe with an
    /// invalid contract_id/tick_types must still parse — it is rejected by
    /// `handle_subscribe`'s own validation, not by `serde_json::from_str`,
    /// so it never counts toward the malformed-message close streak.
    #[test]
    fn s6_invalid_subscribe_payload_still_parses() {
        let raw = r#"{"type":"subscribe","id":"x","data":{"contract_id":0,"tick_types":[]}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Subscribe { id, data } => {
                assert_eq!(id, "x");
                assert_eq!(data.contract_id, 0);
                assert!(data.tick_types.is_empty());
            }
            _ => panic!("expected Subscribe"),
        }
    }

    #[test]
    fn unsubscribe_all_and_ping_parse_with_only_an_id() {
        let unsub_all: ClientMessage = serde_json::from_str(r#"{"type":"unsubscribe_all","id":"x"}"#).unwrap();
        assert!(matches!(unsub_all, ClientMessage::UnsubscribeAll { id } if id == "x"));

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping","id":"y"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping { id } if id == "y"));
    }

    #[test]
    fn malformed_json_fails_to_parse_as_client_message() {
        let result: Result<ClientMessage, _> = serde_json::from_str("{not json");
        assert!(result.is_err());
    }

    #[test]
    fn unknown_message_type_fails_to_parse() {
        let result: Result<ClientMessage, _> = serde_json::from_str(r#"{"type":"frobnicate","id":"z"}"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn conn_sink_sets_connection_lost_on_connection_error_event() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = ConnSink {
            stream_id: "s1".into(),
            tx,
            force_close: Arc::new(Notify::new()),
            slow_consumer: Arc::new(AtomicBool::new(false)),
            connection_lost: Arc::new(AtomicBool::new(false)),
        };
        assert!(sink.deliver(StreamEvent::Error {
            kind: ErrorKind::ConnectionError,
            message: "lost".into(),
            recoverable: true,
        }));
        assert!(sink.connection_lost.load(Ordering::Relaxed));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn conn_sink_marks_slow_consumer_when_channel_full() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = ConnSink {
            stream_id: "s1".into(),
            tx,
            force_close: Arc::new(Notify::new()),
            slow_consumer: Arc::new(AtomicBool::new(false)),
            connection_lost: Arc::new(AtomicBool::new(false)),
        };
        // fill the one slot, then overflow it.
        assert!(sink.deliver(StreamEvent::Info("a".into())));
        assert!(!sink.deliver(StreamEvent::Info("b".into())));
        assert!(sink.slow_consumer.load(Ordering::Relaxed));
    }
}
