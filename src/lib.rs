//! ib-stream-gateway library surface — exposes the gateway's modules for
//! `main.rs` and the integration tests under `tests/`.

pub mod app;
pub mod background;
pub mod config;
pub mod contract_lookup;
pub mod errors;
pub mod middleware;
pub mod models;
pub mod router;
pub mod storage;
pub mod transport;
pub mod upstream;
