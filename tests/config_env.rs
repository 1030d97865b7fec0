//! Integration coverage for `Config::from_env` (spec §6's environment
//! variable surface). These tests mutate process-global env vars, so they
//! run `#[serial]` against each other and against any other test binary that
//! touches the same `IB_STREAM_*` keys.

use std::env;

use ib_stream_gateway::config::Config;
use ib_stream_gateway::models::TickType;
use serial_test::serial;

const ENV_KEYS: &[&str] = &[
    "IB_STREAM_HOST",
    "IB_STREAM_PORTS",
    "IB_STREAM_CLIENT_ID",
    "IB_STREAM_MAX_STREAMS",
    "IB_STREAM_STREAM_TIMEOUT",
    "IB_STREAM_STORAGE_PATH",
    "IB_STREAM_ENABLE_JSON",
    "IB_STREAM_ENABLE_PROTOBUF",
    "IB_STREAM_ENABLE_CLIENT_STREAM_STORAGE",
    "IB_STREAM_TRACKED_CONTRACTS",
    "IB_STREAM_RECONNECT_DELAY",
    "IB_STREAM_BIND_ADDR",
    "IB_STREAM_CONTRACT_SERVICE_URL",
];

fn clear_env() {
    for key in ENV_KEYS {
        env::remove_var(key);
    }
}

#[test]
#[serial]
fn from_env_falls_back_to_documented_defaults() {
    clear_env();
    let config = Config::from_env();
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.ports, vec![7497, 7496, 4002, 4001]);
    assert_eq!(config.client_id, 100);
    assert_eq!(config.max_streams, 50);
    assert!(config.stream_timeout_secs.is_none());
    assert!(config.enable_json);
    assert!(!config.enable_protobuf);
    assert!(config.enable_client_stream_storage);
    assert!(config.tracked_contracts.is_empty());
    assert!(!config.background_streaming_enabled());
    clear_env();
}

#[test]
#[serial]
fn from_env_reads_every_documented_override() {
    clear_env();
    env::set_var("IB_STREAM_HOST", "10.0.0.5");
    env::set_var("IB_STREAM_PORTS", "4001,4002");
    env::set_var("IB_STREAM_CLIENT_ID", "7");
    env::set_var("IB_STREAM_MAX_STREAMS", "12");
    env::set_var("IB_STREAM_STREAM_TIMEOUT", "3600");
    env::set_var("IB_STREAM_STORAGE_PATH", "/tmp/ib-stream-gateway-test-data");
    env::set_var("IB_STREAM_ENABLE_JSON", "false");
    env::set_var("IB_STREAM_ENABLE_PROTOBUF", "true");
    env::set_var("IB_STREAM_ENABLE_CLIENT_STREAM_STORAGE", "off");
    env::set_var("IB_STREAM_TRACKED_CONTRACTS", "265598:AAPL:last;bid_ask:4");
    env::set_var("IB_STREAM_RECONNECT_DELAY", "9");
    env::set_var("IB_STREAM_BIND_ADDR", "0.0.0.0:9000");
    env::set_var("IB_STREAM_CONTRACT_SERVICE_URL", "http://contracts.internal:8001");

    let config = Config::from_env();

    assert_eq!(config.host, "10.0.0.5");
    assert_eq!(config.ports, vec![4001, 4002]);
    assert_eq!(config.client_id, 7);
    assert_eq!(config.max_streams, 12);
    assert_eq!(config.stream_timeout_secs, Some(3600));
    assert_eq!(config.storage_path.to_str().unwrap(), "/tmp/ib-stream-gateway-test-data");
    assert!(!config.enable_json);
    assert!(config.enable_protobuf);
    assert!(!config.enable_client_stream_storage);
    assert_eq!(config.tracked_contracts.len(), 1);
    assert_eq!(config.tracked_contracts[0].contract_id, 265598);
    assert_eq!(config.tracked_contracts[0].tick_types, vec![TickType::Last, TickType::BidAsk]);
    assert!(config.background_streaming_enabled());
    assert_eq!(config.reconnect_delay_secs, 9);
    assert_eq!(config.bind_addr, "0.0.0.0:9000");
    assert_eq!(config.contract_service_base_url, "http://contracts.internal:8001");
    assert_eq!(config.background_client_id(), 1007);

    clear_env();
}

#[test]
#[serial]
fn from_env_ignores_unparseable_ports_and_keeps_the_valid_ones() {
    clear_env();
    env::set_var("IB_STREAM_PORTS", "7497, not-a-port ,4001");
    let config = Config::from_env();
    assert_eq!(config.ports, vec![7497, 4001]);
    clear_env();
}
