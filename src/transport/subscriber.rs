//! Shared subscriber sink (C9) used by both the SSE and WebSocket
//! transports: converts [`StreamEvent`]s into the wire envelope (spec §6)
//! and drains them through one bounded outbound queue per subscriber.
//!
//! Grounded on the teacher's `EdgeReceiver`/channel-bridge shape in
//! `edge/mod.rs` (a bounded mpsc queue between a fast producer and a slow
//! consumer-facing sender task) and on `backtest_v2::book_recorder`'s
//! drop-on-full discipline — generalized here from "drop the message" to
//! "drop the connection" per spec §4.7's slow-consumer policy, since an
//! SSE/WS client (unlike a storage writer) cannot tolerate silently missed
//! frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::errors::ErrorKind;
use crate::models::{TerminalReason, TickType};
use crate::router::handler::{ConsumerSink, StreamEvent};

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1_000;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// `{contract_id}_{tick_type}_{timestamp_ms}_{random 4-digit}` for a single
/// tick type, `{contract_id}_multi_{sorted_tick_types}_{timestamp_ms}_{random}`
/// for several (spec §3a) — this id, not `request_id`, is what a client sees
/// and uses in `unsubscribe`/buffer-range calls.
pub fn generate_stream_id(contract_id: i64, tick_types: &[TickType]) -> String {
    let timestamp_ms = Utc::now().timestamp_millis();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let rand = 1000 + (nanos % 9000);
    if tick_types.len() == 1 {
        format!("{}_{}_{}_{}", contract_id, tick_types[0].as_str(), timestamp_ms, rand)
    } else {
        let mut sorted: Vec<&str> = tick_types.iter().map(TickType::as_str).collect();
        sorted.sort_unstable();
        format!("{}_multi_{}_{}_{}", contract_id, sorted.join("_"), timestamp_ms, rand)
    }
}

/// Server -> client frame, spec §6's envelope:
/// `{type, stream_id, timestamp, data, metadata}`.
#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub stream_id: String,
    pub timestamp: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl WireMessage {
    fn now() -> String {
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    pub fn from_event(stream_id: &str, event: &StreamEvent) -> Self {
        match event {
            StreamEvent::Tick {
                message,
                historical,
                buffer_index,
                buffer_total,
            } => WireMessage {
                kind: "tick",
                stream_id: stream_id.to_string(),
                timestamp: Self::now(),
                data: serde_json::to_value(message).unwrap_or(Value::Null),
                metadata: Some(json!({
                    "historical": historical,
                    "buffer_index": buffer_index,
                    "buffer_total": buffer_total,
                })),
            },
            StreamEvent::Error {
                kind,
                message,
                recoverable,
            } => WireMessage {
                kind: "error",
                stream_id: stream_id.to_string(),
                timestamp: Self::now(),
                data: json!({
                    "code": kind,
                    "message": message,
                    "recoverable": recoverable,
                }),
                metadata: None,
            },
            StreamEvent::Complete { reason, total_ticks } => WireMessage {
                kind: "complete",
                stream_id: stream_id.to_string(),
                timestamp: Self::now(),
                data: json!({ "reason": reason, "total_ticks": total_ticks }),
                metadata: None,
            },
            StreamEvent::BufferStart { buffer_message_count } => WireMessage {
                kind: "info",
                stream_id: stream_id.to_string(),
                timestamp: Self::now(),
                data: json!({ "status": "buffer_start", "buffer_message_count": buffer_message_count }),
                metadata: None,
            },
            StreamEvent::BufferComplete => WireMessage {
                kind: "info",
                stream_id: stream_id.to_string(),
                timestamp: Self::now(),
                data: json!({ "status": "buffer_complete" }),
                metadata: None,
            },
            StreamEvent::LiveStart => WireMessage {
                kind: "info",
                stream_id: stream_id.to_string(),
                timestamp: Self::now(),
                data: json!({ "status": "live_start" }),
                metadata: None,
            },
            StreamEvent::Info(status) => WireMessage {
                kind: "info",
                stream_id: stream_id.to_string(),
                timestamp: Self::now(),
                data: json!({ "status": status }),
                metadata: None,
            },
        }
    }

    pub fn heartbeat(stream_id: &str) -> Self {
        WireMessage {
            kind: "heartbeat",
            stream_id: stream_id.to_string(),
            timestamp: Self::now(),
            data: Value::Null,
            metadata: None,
        }
    }

    fn slow_consumer(stream_id: &str) -> Self {
        WireMessage {
            kind: "error",
            stream_id: stream_id.to_string(),
            timestamp: Self::now(),
            data: json!({
                "code": ErrorKind::SlowConsumer,
                "message": "subscriber outbound queue overflowed",
                "recoverable": false,
            }),
            metadata: None,
        }
    }
}

/// Per-subscriber `ConsumerSink`. `deliver` never blocks: on a full queue
/// it marks `overflowed` and returns `false` so the handler drives itself
/// to a terminal state; the transport's send loop is responsible for
/// appending the final `error{SLOW_CONSUMER}` frame and closing, since by
/// the time the queue is full the sink itself has no room left to say so.
pub struct Subscriber {
    stream_id: String,
    tx: mpsc::Sender<WireMessage>,
    overflowed: AtomicBool,
}

impl Subscriber {
    pub fn new(stream_id: String, capacity: usize) -> (Self, mpsc::Receiver<WireMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                stream_id,
                tx,
                overflowed: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Relaxed)
    }

    pub fn final_error_frame(&self) -> WireMessage {
        WireMessage::slow_consumer(&self.stream_id)
    }
}

impl ConsumerSink for Subscriber {
    fn deliver(&self, event: StreamEvent) -> bool {
        let msg = WireMessage::from_event(&self.stream_id, &event);
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(_) => {
                self.overflowed.store(true, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Close code chosen for a terminated handler (spec §6).
pub fn close_code_for(reason: TerminalReason, slow_consumer: bool) -> u16 {
    if slow_consumer {
        return 1011;
    }
    match reason {
        TerminalReason::ManualStop | TerminalReason::ClientDisconnect | TerminalReason::LimitReached => 1000,
        TerminalReason::Timeout => 1000,
        TerminalReason::Error => 1011,
        TerminalReason::ServerShutdown => 1000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TickMessage, TickType};

    fn tick_event() -> StreamEvent {
        StreamEvent::Tick {
            message: TickMessage {
                ib_timestamp_us: 1,
                system_timestamp_us: 1,
                contract_id: 1,
                tick_type: TickType::Last,
                request_id: 1,
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
            },
            historical: false,
            buffer_index: None,
            buffer_total: None,
        }
    }

    #[tokio::test]
    async fn overflow_marks_flag_and_rejects_without_blocking() {
        let (sub, mut rx) = Subscriber::new("s1".into(), 1);
        assert!(sub.deliver(tick_event()));
        assert!(!sub.deliver(tick_event()));
        assert!(sub.overflowed());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn wire_message_tick_carries_historical_metadata() {
        let msg = WireMessage::from_event("s1", &tick_event());
        assert_eq!(msg.kind, "tick");
        assert_eq!(msg.metadata.unwrap()["historical"], false);
    }

    #[test]
    fn close_code_slow_consumer_is_1011_regardless_of_reason() {
        assert_eq!(close_code_for(TerminalReason::LimitReached, true), 1011);
    }

    #[test]
    fn stream_id_single_tick_type_has_four_segments() {
        let id = generate_stream_id(265598, &[TickType::Last]);
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts[0], "265598");
        assert_eq!(parts[1], "last");
    }

    #[test]
    fn stream_id_multi_tick_type_sorts_and_tags_multi() {
        let id = generate_stream_id(265598, &[TickType::Last, TickType::BidAsk]);
        assert!(id.starts_with("265598_multi_bid_ask_last_"));
    }
}
