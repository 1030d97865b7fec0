//! Environment-driven configuration, ported from the teacher's
//! `Config::from_env` / `env::var(...).ok().and_then(...)` idiom in
//! `main.rs`, generalized to this gateway's ENV VARS (spec §6).

use crate::models::TrackedContract;
use std::env;
use std::path::PathBuf;

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub ports: Vec<u16>,
    pub client_id: i32,
    pub max_streams: u32,
    pub stream_timeout_secs: Option<u64>,
    pub storage_path: PathBuf,
    pub enable_json: bool,
    pub enable_protobuf: bool,
    pub enable_client_stream_storage: bool,
    pub tracked_contracts: Vec<TrackedContract>,
    pub reconnect_delay_secs: u64,
    pub bind_addr: String,
    pub contract_service_base_url: String,
}

/// `request_id`/client-id offset that marks a background (as opposed to
/// interactive client-facing) subscription; see spec §4.2, §4.3.
pub const BG_BASE: i32 = 60_000;
pub const BG_CLIENT_ID_OFFSET: i32 = 1_000;

impl Config {
    pub fn from_env() -> Self {
        let host = env::var("IB_STREAM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let ports: Vec<u16> = env::var("IB_STREAM_PORTS")
            .unwrap_or_else(|_| "7497,7496,4002,4001".to_string())
            .split(',')
            .filter_map(|p| p.trim().parse().ok())
            .collect();
        let client_id = env_parse("IB_STREAM_CLIENT_ID", 100);
        let max_streams = env_parse("IB_STREAM_MAX_STREAMS", 50);
        let stream_timeout_secs = env::var("IB_STREAM_STREAM_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok());
        let storage_path = env::var("IB_STREAM_STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_storage_path());
        let enable_json = env_bool("IB_STREAM_ENABLE_JSON", true);
        let enable_protobuf = env_bool("IB_STREAM_ENABLE_PROTOBUF", false);
        let enable_client_stream_storage = env_bool("IB_STREAM_ENABLE_CLIENT_STREAM_STORAGE", true);
        let tracked_contracts = env::var("IB_STREAM_TRACKED_CONTRACTS")
            .map(|raw| TrackedContract::parse_all(&raw))
            .unwrap_or_default();
        let reconnect_delay_secs = env_parse("IB_STREAM_RECONNECT_DELAY", 5);
        let bind_addr = env::var("IB_STREAM_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
        let contract_service_base_url = env::var("IB_STREAM_CONTRACT_SERVICE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8001".to_string());

        Self {
            host,
            ports,
            client_id,
            max_streams,
            stream_timeout_secs,
            storage_path,
            enable_json,
            enable_protobuf,
            enable_client_stream_storage,
            tracked_contracts,
            reconnect_delay_secs,
            bind_addr,
            contract_service_base_url,
        }
    }

    /// Resolved per the spec's Open Question: background streaming is
    /// enabled iff the tracked-contract set is non-empty, not by a separate
    /// flag.
    pub fn background_streaming_enabled(&self) -> bool {
        !self.tracked_contracts.is_empty()
    }

    pub fn background_client_id(&self) -> i32 {
        self.client_id + BG_CLIENT_ID_OFFSET
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data")
}

/// CLI overrides layered on top of env defaults, teacher-pack convention
/// (clap with the `env` feature).
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "ib-stream-gateway")]
pub struct Cli {
    #[arg(long, env = "IB_STREAM_STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,
    #[arg(long)]
    pub bind_addr: Option<String>,
    #[arg(long, env = "RUST_LOG")]
    pub log_level: Option<String>,
}

impl Cli {
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(p) = self.storage_path {
            config.storage_path = p;
        }
        if let Some(a) = self.bind_addr {
            config.bind_addr = a;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_streaming_enabled_iff_tracked_contracts_nonempty() {
        let mut c = Config {
            host: "h".into(),
            ports: vec![],
            client_id: 1,
            max_streams: 1,
            stream_timeout_secs: None,
            storage_path: PathBuf::from("/tmp"),
            enable_json: true,
            enable_protobuf: false,
            enable_client_stream_storage: true,
            tracked_contracts: vec![],
            reconnect_delay_secs: 5,
            bind_addr: "x".into(),
            contract_service_base_url: "x".into(),
        };
        assert!(!c.background_streaming_enabled());
        c.tracked_contracts.push(TrackedContract {
            contract_id: 1,
            symbol: "A".into(),
            tick_types: vec![crate::models::TickType::Last],
            buffer_hours: 1,
            enabled: true,
        });
        assert!(c.background_streaming_enabled());
    }

    #[test]
    fn background_client_id_is_offset_by_1000() {
        let c = Config {
            host: "h".into(),
            ports: vec![],
            client_id: 42,
            max_streams: 1,
            stream_timeout_secs: None,
            storage_path: PathBuf::from("/tmp"),
            enable_json: true,
            enable_protobuf: false,
            enable_client_stream_storage: true,
            tracked_contracts: vec![],
            reconnect_delay_secs: 5,
            bind_addr: "x".into(),
            contract_service_base_url: "x".into(),
        };
        assert_eq!(c.background_client_id(), 1042);
    }
}
