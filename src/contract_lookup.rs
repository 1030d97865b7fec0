//! External contract-metadata HTTP client (spec §6's contract lookup
//! service), used only to hydrate background subscriptions by id before
//! `request_tick_stream` (C7). Grounded on the teacher's `http_client`
//! setup in `main.rs` (a shared `reqwest::Client` with a fixed timeout,
//! injected into task state) and `polymarket_book_store.rs`'s cached HTTP
//! lookup pattern for the TTL cache in [`ContractCache`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::warn;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct ContractDetail {
    pub con_id: i64,
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub primary_exchange: String,
    pub currency: String,
    pub local_symbol: String,
    pub trading_class: String,
    #[serde(default)]
    pub multiplier: Option<String>,
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default)]
    pub strike: Option<f64>,
    #[serde(default)]
    pub right: Option<String>,
    /// Upstream trading-hours string consumed by [`crate::background::health::TradingHoursParser`].
    #[serde(default)]
    pub trading_hours: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContractsByType {
    contracts: Vec<ContractDetail>,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    contracts_by_type: HashMap<String, ContractsByType>,
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("contract lookup request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("no contract found for symbol {0}")]
    NotFound(String),
}

pub struct ContractLookupClient {
    http: reqwest::Client,
    base_url: String,
}

impl ContractLookupClient {
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .expect("reqwest client build");
        Self { http, base_url }
    }

    /// `GET {base_url}/lookup/{symbol}`, returning every contract variant
    /// the service reports across all `sec_type`s (the caller picks the
    /// one matching its tracked contract id).
    pub async fn lookup(&self, symbol: &str) -> Result<Vec<ContractDetail>, LookupError> {
        let url = format!("{}/lookup/{}", self.base_url.trim_end_matches('/'), symbol);
        let response = self.http.get(&url).send().await?.error_for_status()?;
        let body: LookupResponse = response.json().await?;
        let contracts: Vec<ContractDetail> = body.contracts_by_type.into_values().flat_map(|c| c.contracts).collect();
        if contracts.is_empty() {
            return Err(LookupError::NotFound(symbol.to_string()));
        }
        Ok(contracts)
    }

    pub async fn lookup_by_contract_id(&self, symbol: &str, contract_id: i64) -> Result<ContractDetail, LookupError> {
        let contracts = self.lookup(symbol).await?;
        contracts
            .into_iter()
            .find(|c| c.con_id == contract_id)
            .ok_or_else(|| LookupError::NotFound(symbol.to_string()))
    }
}

struct CachedEntry {
    detail: ContractDetail,
    cached_at: Instant,
}

/// In-process TTL cache over [`ContractLookupClient`] so a reconnect storm
/// doesn't re-hit the lookup service once per tracked contract per session.
pub struct ContractCache {
    client: ContractLookupClient,
    ttl: Duration,
    entries: RwLock<HashMap<i64, CachedEntry>>,
}

impl ContractCache {
    pub fn new(client: ContractLookupClient, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, symbol: &str, contract_id: i64) -> Result<ContractDetail, LookupError> {
        if let Some(entry) = self.entries.read().get(&contract_id) {
            if entry.cached_at.elapsed() < self.ttl {
                return Ok(entry.detail.clone());
            }
        }
        match self.client.lookup_by_contract_id(symbol, contract_id).await {
            Ok(detail) => {
                self.entries.write().insert(
                    contract_id,
                    CachedEntry {
                        detail: detail.clone(),
                        cached_at: Instant::now(),
                    },
                );
                Ok(detail)
            }
            Err(e) => {
                warn!(symbol, contract_id, error = %e, "contract_lookup_failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_starts_empty() {
        let client = ContractLookupClient::new("http://localhost:9999".into());
        let cache = ContractCache::new(client, Duration::from_secs(60));
        assert!(cache.entries.read().is_empty());
    }
}
