//! The TWS wire protocol itself is out of scope (spec §1); this trait is the
//! narrow boundary this crate depends on. Production wiring implements it
//! against a real TWS client; tests use [`FakeDriver`].

use crate::models::TickType;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Inbound event the driver surfaces to an [`crate::upstream::connection::UpstreamConnection`].
#[derive(Debug, Clone)]
pub enum DriverEvent {
    NextValidId(i32),
    Tick(DriverTick),
    Error {
        request_id: Option<i32>,
        code: i32,
        message: String,
    },
    ConnectionClosed,
}

/// One decoded upstream tick frame, still in upstream (v2-ish) shape; C5
/// hands this to the router which converts it to [`crate::models::TickMessage`].
#[derive(Debug, Clone)]
pub struct DriverTick {
    pub request_id: i32,
    pub contract_id: i64,
    pub tick_type: TickType,
    pub ib_timestamp_us: i64,
    pub price: Option<f64>,
    pub size: Option<f64>,
    pub unreported: bool,
    pub bid_price: Option<f64>,
    pub bid_size: Option<f64>,
    pub ask_price: Option<f64>,
    pub ask_size: Option<f64>,
    pub bid_past_low: bool,
    pub ask_past_high: bool,
    pub mid_point: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ContractSummary {
    pub con_id: i64,
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub primary_exchange: String,
    pub currency: String,
    pub local_symbol: String,
    pub trading_class: String,
    pub multiplier: Option<String>,
    pub expiry: Option<String>,
    pub strike: Option<f64>,
    pub right: Option<String>,
}

#[async_trait]
pub trait TwsDriver: Send + Sync {
    /// Attempt a socket connection + handshake. Per §4.1, the caller tries
    /// ports in order and this call handles exactly one `(host, port)` pair.
    async fn connect(&self, host: &str, port: u16, client_id: i32) -> anyhow::Result<()>;

    async fn req_tick_by_tick_data(
        &self,
        request_id: i32,
        contract_id: i64,
        tick_type: TickType,
        num_ticks: u32,
        ignore_size: bool,
    ) -> anyhow::Result<()>;

    async fn cancel_tick_by_tick_data(&self, request_id: i32) -> anyhow::Result<()>;

    async fn req_contract_details(&self, request_id: i32, contract_id: i64) -> anyhow::Result<()>;

    /// Cheap request used by the heartbeat monitor to verify the socket is
    /// still alive (e.g. `reqCurrentTime`), independent of any subscription.
    async fn ping(&self) -> anyhow::Result<()>;

    /// Subscribe to the driver's inbound event stream. Exactly one receiver
    /// is expected per connection.
    fn events(&self) -> mpsc::Receiver<DriverEvent>;
}

/// In-memory driver used by integration tests (spec §8/§9's S1-S6), since a
/// real TWS socket cannot be driven in CI.
pub struct FakeDriver {
    tx: parking_lot::Mutex<Option<mpsc::Sender<DriverEvent>>>,
    rx: parking_lot::Mutex<Option<mpsc::Receiver<DriverEvent>>>,
    pub connect_should_fail: std::sync::atomic::AtomicBool,
}

impl FakeDriver {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1024);
        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            rx: parking_lot::Mutex::new(Some(rx)),
            connect_should_fail: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn push_event(&self, event: DriverEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.try_send(event);
        }
    }
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TwsDriver for FakeDriver {
    async fn connect(&self, _host: &str, _port: u16, _client_id: i32) -> anyhow::Result<()> {
        use std::sync::atomic::Ordering;
        if self.connect_should_fail.load(Ordering::Relaxed) {
            anyhow::bail!("simulated connect failure");
        }
        self.push_event(DriverEvent::NextValidId(1));
        Ok(())
    }

    async fn req_tick_by_tick_data(
        &self,
        _request_id: i32,
        _contract_id: i64,
        _tick_type: TickType,
        _num_ticks: u32,
        _ignore_size: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cancel_tick_by_tick_data(&self, _request_id: i32) -> anyhow::Result<()> {
        Ok(())
    }

    async fn req_contract_details(&self, _request_id: i32, _contract_id: i64) -> anyhow::Result<()> {
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn events(&self) -> mpsc::Receiver<DriverEvent> {
        self.rx
            .lock()
            .take()
            .expect("FakeDriver::events() called more than once")
    }
}
