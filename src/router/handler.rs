//! Per-consumer handler state (C6). One [`StreamHandler`] exists per
//! downstream subscription; exactly one terminal event is ever delivered to
//! it (Testable Property 1).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::errors::ErrorKind;
use crate::models::{TerminalReason, TickMessage, TickType};

/// One terminal or mid-stream notification delivered to a consumer.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Tick {
        message: TickMessage,
        historical: bool,
        buffer_index: Option<u64>,
        buffer_total: Option<u64>,
    },
    Error {
        kind: ErrorKind,
        message: String,
        recoverable: bool,
    },
    Complete {
        reason: TerminalReason,
        total_ticks: u64,
    },
    /// Historical-plus-live splicing markers (C4, spec §4.6 state machine).
    BufferStart {
        buffer_message_count: u64,
    },
    BufferComplete,
    LiveStart,
    Info(String),
}

/// Polymorphic sink a handler delivers events into. Collapses the
/// original's duck-typed sync/async tick/error/complete callbacks (spec §9
/// redesign flag) into one interface; the sink's own ownership (a bounded
/// mpsc queue for transports, a no-op for background handlers) decides
/// delivery discipline. `deliver` MUST NOT block — it is called from the
/// router's hot path.
pub trait ConsumerSink: Send + Sync {
    /// Returns `false` if the sink could not accept the event (full queue /
    /// closed transport) — the caller then drives the handler to a
    /// `SlowConsumer`/`BufferOverflow` terminal state.
    fn deliver(&self, event: StreamEvent) -> bool;
}

/// Sink with no downstream transport: storage is the only effect for
/// background (C7) handlers. Always accepts.
pub struct NullSink;
impl ConsumerSink for NullSink {
    fn deliver(&self, _event: StreamEvent) -> bool {
        true
    }
}

pub struct StreamHandler {
    pub request_id: i32,
    pub contract_id: i64,
    pub tick_type: TickType,
    pub stream_id: String,
    pub limit: Option<u64>,
    pub deadline: Option<Instant>,
    pub start_time: Instant,
    tick_count: AtomicU64,
    terminal: AtomicBool,
    sink: Box<dyn ConsumerSink>,
}

impl StreamHandler {
    pub fn new(
        request_id: i32,
        contract_id: i64,
        tick_type: TickType,
        stream_id: String,
        limit: Option<u64>,
        deadline: Option<Instant>,
        sink: Box<dyn ConsumerSink>,
    ) -> Self {
        Self {
            request_id,
            contract_id,
            tick_type,
            stream_id,
            limit,
            deadline,
            start_time: Instant::now(),
            tick_count: AtomicU64::new(0),
            terminal: AtomicBool::new(false),
            sink,
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Relaxed)
    }

    /// Delivers one tick, bumps the count, and evaluates `limit`/`deadline`.
    /// Returns `Some(reason)` if this tick pushed the handler into a
    /// terminal state (the caller is responsible for unregistering it).
    pub fn on_tick(&self, message: TickMessage, historical: bool) -> Option<TerminalReason> {
        if self.terminal.load(Ordering::Relaxed) {
            return None;
        }
        let count = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;

        let accepted = self.sink.deliver(StreamEvent::Tick {
            message,
            historical,
            buffer_index: None,
            buffer_total: None,
        });
        if !accepted {
            return self.emit_terminal(TerminalReason::Error, "slow consumer");
        }

        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return self.emit_terminal(TerminalReason::Timeout, "deadline exceeded");
            }
        }
        if let Some(limit) = self.limit {
            if count >= limit {
                return self.emit_terminal(TerminalReason::LimitReached, "limit reached");
            }
        }
        None
    }

    pub fn on_error(&self, kind: ErrorKind, message: &str) -> Option<TerminalReason> {
        if self.terminal.load(Ordering::Relaxed) {
            return None;
        }
        if kind.recoverable() {
            self.sink.deliver(StreamEvent::Error {
                kind,
                message: message.to_string(),
                recoverable: true,
            });
            None
        } else {
            self.terminal.store(true, Ordering::Relaxed);
            self.sink.deliver(StreamEvent::Error {
                kind,
                message: message.to_string(),
                recoverable: false,
            });
            Some(TerminalReason::Error)
        }
    }

    fn emit_terminal(&self, reason: TerminalReason, _why: &str) -> Option<TerminalReason> {
        if self.terminal.swap(true, Ordering::Relaxed) {
            return None;
        }
        self.sink.deliver(StreamEvent::Complete {
            reason,
            total_ticks: self.tick_count(),
        });
        Some(reason)
    }

    pub fn force_terminal(&self, reason: TerminalReason) {
        self.emit_terminal(reason, "forced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingSink {
        ticks: AtomicUsize,
        terminals: AtomicUsize,
    }

    impl ConsumerSink for CountingSink {
        fn deliver(&self, event: StreamEvent) -> bool {
            match event {
                StreamEvent::Tick { .. } => {
                    self.ticks.fetch_add(1, Ordering::Relaxed);
                }
                StreamEvent::Complete { .. } | StreamEvent::Error { .. } => {
                    self.terminals.fetch_add(1, Ordering::Relaxed);
                }
                StreamEvent::BufferStart { .. }
                | StreamEvent::BufferComplete
                | StreamEvent::LiveStart
                | StreamEvent::Info(_) => {}
            }
            true
        }
    }

    fn tick(contract_id: i64) -> TickMessage {
        TickMessage {
            ib_timestamp_us: 1,
            system_timestamp_us: 1,
            contract_id,
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
        }
    }

    #[test]
    fn limit_terminates_after_exactly_n_ticks() {
        let sink = Arc::new(CountingSink {
            ticks: AtomicUsize::new(0),
            terminals: AtomicUsize::new(0),
        });
        let handler = StreamHandler::new(
            1,
            265598,
            TickType::Last,
            "s1".into(),
            Some(3),
            None,
            Box::new(SinkProxy(sink.clone())),
        );
        assert!(handler.on_tick(tick(265598), false).is_none());
        assert!(handler.on_tick(tick(265598), false).is_none());
        assert_eq!(
            handler.on_tick(tick(265598), false),
            Some(TerminalReason::LimitReached)
        );
        assert_eq!(sink.ticks.load(Ordering::Relaxed), 3);
        assert_eq!(sink.terminals.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn exactly_one_terminal_event_is_ever_emitted() {
        let sink = Arc::new(CountingSink {
            ticks: AtomicUsize::new(0),
            terminals: AtomicUsize::new(0),
        });
        let handler = StreamHandler::new(
            1,
            265598,
            TickType::Last,
            "s1".into(),
            Some(1),
            None,
            Box::new(SinkProxy(sink.clone())),
        );
        handler.on_tick(tick(265598), false);
        // further ticks after terminal must be no-ops
        handler.on_tick(tick(265598), false);
        handler.force_terminal(TerminalReason::ManualStop);
        assert_eq!(sink.terminals.load(Ordering::Relaxed), 1);
    }

    struct SinkProxy(Arc<CountingSink>);
    impl ConsumerSink for SinkProxy {
        fn deliver(&self, event: StreamEvent) -> bool {
            self.0.deliver(event)
        }
    }
}
