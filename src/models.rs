//! Canonical tick record (C1), stream handler state (C6), and tracked-contract
//! configuration (C7).

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the four upstream tick-data subscription kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickType {
    Last,
    AllLast,
    BidAsk,
    MidPoint,
}

impl TickType {
    pub fn all() -> [TickType; 4] {
        [
            TickType::Last,
            TickType::AllLast,
            TickType::BidAsk,
            TickType::MidPoint,
        ]
    }

    /// Gateway-facing snake_case spelling, as used in paths, wire JSON `tt`,
    /// and file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            TickType::Last => "last",
            TickType::AllLast => "all_last",
            TickType::BidAsk => "bid_ask",
            TickType::MidPoint => "mid_point",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<TickType> {
        match s {
            "last" => Some(TickType::Last),
            "all_last" => Some(TickType::AllLast),
            "bid_ask" => Some(TickType::BidAsk),
            "mid_point" => Some(TickType::MidPoint),
            _ => None,
        }
    }

    /// Upstream-facing PascalCase spelling. The gateway is the sole
    /// translator between this and the snake_case form.
    pub fn upstream_str(&self) -> &'static str {
        match self {
            TickType::Last => "Last",
            TickType::AllLast => "AllLast",
            TickType::BidAsk => "BidAsk",
            TickType::MidPoint => "MidPoint",
        }
    }

    pub fn from_upstream_str(s: &str) -> Option<TickType> {
        match s {
            "Last" => Some(TickType::Last),
            "AllLast" => Some(TickType::AllLast),
            "BidAsk" => Some(TickType::BidAsk),
            "MidPoint" => Some(TickType::MidPoint),
            _ => None,
        }
    }
}

impl fmt::Display for TickType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical compact tick record (v3 wire/storage form).
///
/// Field names deliberately match the on-disk JSONL keys (`ts, st, cid, tt,
/// rid, ...`) via serde renames, so (de)serialization IS the storage format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickMessage {
    #[serde(rename = "ts")]
    pub ib_timestamp_us: i64,
    #[serde(rename = "st")]
    pub system_timestamp_us: i64,
    #[serde(rename = "cid")]
    pub contract_id: i64,
    #[serde(rename = "tt")]
    pub tick_type: TickType,
    #[serde(rename = "rid")]
    pub request_id: i32,

    #[serde(rename = "p", skip_serializing_if = "Option::is_none", default)]
    pub price: Option<f64>,
    #[serde(rename = "s", skip_serializing_if = "Option::is_none", default)]
    pub size: Option<f64>,
    #[serde(rename = "upt", skip_serializing_if = "is_false", default)]
    pub unreported: bool,

    #[serde(rename = "bp", skip_serializing_if = "Option::is_none", default)]
    pub bid_price: Option<f64>,
    #[serde(rename = "bs", skip_serializing_if = "Option::is_none", default)]
    pub bid_size: Option<f64>,
    #[serde(rename = "ap", skip_serializing_if = "Option::is_none", default)]
    pub ask_price: Option<f64>,
    #[serde(rename = "as", skip_serializing_if = "Option::is_none", default)]
    pub ask_size: Option<f64>,
    #[serde(rename = "bpl", skip_serializing_if = "is_false", default)]
    pub bid_past_low: bool,
    #[serde(rename = "aph", skip_serializing_if = "is_false", default)]
    pub ask_past_high: bool,

    #[serde(rename = "mp", skip_serializing_if = "Option::is_none", default)]
    pub mid_point: Option<f64>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl TickMessage {
    /// `request_id` generation: `abs(int32(md5(cid_tt_request_time_us)[0:4]))`.
    ///
    /// Matches the reference system's hash exactly so request ids computed
    /// here correlate with upstream logs produced by that system.
    pub fn generate_request_id(contract_id: i64, tick_type: TickType, request_time_us: i64) -> i32 {
        let input = format!("{}_{}_{}", contract_id, tick_type.as_str(), request_time_us);
        let digest = md5::compute(input.as_bytes());
        let bytes = [digest[0], digest[1], digest[2], digest[3]];
        let v = i32::from_be_bytes(bytes);
        v.wrapping_abs()
    }

    /// Hourly file-path partition components derived from `ib_timestamp_us`:
    /// `(year, month, day, hour, timestamp_seconds)`.
    pub fn partition(&self) -> (i32, u32, u32, u32, i64) {
        let timestamp_seconds = self.ib_timestamp_us.div_euclid(1_000_000);
        let dt = chrono::DateTime::<chrono::Utc>::from_timestamp(timestamp_seconds, 0)
            .unwrap_or_else(|| chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap());
        use chrono::Datelike;
        use chrono::Timelike;
        (dt.year(), dt.month(), dt.day(), dt.hour(), timestamp_seconds)
    }

    /// `ib_timestamp_us <= system_timestamp_us + clock_skew_tolerance_us`.
    pub fn within_clock_skew(&self, tolerance_us: i64) -> bool {
        self.ib_timestamp_us <= self.system_timestamp_us + tolerance_us
    }

    /// For `bid_ask`, `bid_price <= ask_price` unless either side is zero.
    pub fn bid_ask_invariant_holds(&self) -> bool {
        if self.tick_type != TickType::BidAsk {
            return true;
        }
        match (self.bid_price, self.ask_price) {
            (Some(bp), Some(ap)) if bp != 0.0 && ap != 0.0 => bp <= ap,
            _ => true,
        }
    }

    /// Convert a legacy v2 wire message into the canonical v3 record.
    /// See Testable Property 4: this and [`TickMessage::to_v2`] round-trip.
    pub fn from_v2(v2: &V2TickMessage, request_id: i32) -> Self {
        let tick_type = v2.tick_type;
        let mut msg = TickMessage {
            ib_timestamp_us: v2.timestamp_us,
            system_timestamp_us: v2.system_timestamp_us,
            contract_id: v2.contract_id,
            tick_type,
            request_id,
            price: None,
            size: None,
            unreported: false,
            bid_price: None,
            bid_size: None,
            ask_price: None,
            ask_size: None,
            bid_past_low: false,
            ask_past_high: false,
            mid_point: None,
        };
        match tick_type {
            TickType::Last | TickType::AllLast => {
                msg.price = v2.price;
                msg.size = v2.size;
                msg.unreported = v2.unreported;
            }
            TickType::BidAsk => {
                msg.bid_price = v2.bid_price;
                msg.bid_size = v2.bid_size;
                msg.ask_price = v2.ask_price;
                msg.ask_size = v2.ask_size;
                msg.bid_past_low = v2.bid_past_low;
                msg.ask_past_high = v2.ask_past_high;
            }
            TickType::MidPoint => {
                msg.mid_point = v2.mid_point;
            }
        }
        msg
    }

    /// Convert back to the legacy v2 wire shape. The `metadata` block on the
    /// v2 side is synthesized at call sites, not round-tripped here.
    pub fn to_v2(&self) -> V2TickMessage {
        V2TickMessage {
            timestamp_us: self.ib_timestamp_us,
            system_timestamp_us: self.system_timestamp_us,
            contract_id: self.contract_id,
            tick_type: self.tick_type,
            price: self.price,
            size: self.size,
            unreported: self.unreported,
            bid_price: self.bid_price,
            bid_size: self.bid_size,
            ask_price: self.ask_price,
            ask_size: self.ask_size,
            bid_past_low: self.bid_past_low,
            ask_past_high: self.ask_past_high,
            mid_point: self.mid_point,
        }
    }
}

/// Legacy v2 wire shape. Used only at the conversion boundary (C1's
/// round-trip property); not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2TickMessage {
    pub timestamp_us: i64,
    pub system_timestamp_us: i64,
    pub contract_id: i64,
    pub tick_type: TickType,
    pub price: Option<f64>,
    pub size: Option<f64>,
    #[serde(default)]
    pub unreported: bool,
    pub bid_price: Option<f64>,
    pub bid_size: Option<f64>,
    pub ask_price: Option<f64>,
    pub ask_size: Option<f64>,
    #[serde(default)]
    pub bid_past_low: bool,
    #[serde(default)]
    pub ask_past_high: bool,
    pub mid_point: Option<f64>,
}

/// Terminal reason for a [`crate::router::handler::StreamHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    LimitReached,
    Timeout,
    ClientDisconnect,
    ManualStop,
    Error,
    ServerShutdown,
}

/// Declaratively-configured contract the background manager must keep
/// streaming regardless of client demand (C7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedContract {
    pub contract_id: i64,
    pub symbol: String,
    pub tick_types: Vec<TickType>,
    pub buffer_hours: u32,
    pub enabled: bool,
}

impl TrackedContract {
    /// Parses one entry of `cid:symbol:tt1;tt2:buffer_hours`.
    pub fn parse(entry: &str) -> Option<TrackedContract> {
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() != 4 {
            return None;
        }
        let contract_id: i64 = parts[0].trim().parse().ok()?;
        let symbol = parts[1].trim().to_string();
        let tick_types: Vec<TickType> = parts[2]
            .split(';')
            .filter(|s| !s.is_empty())
            .filter_map(TickType::from_str_loose)
            .collect();
        if tick_types.is_empty() {
            return None;
        }
        let buffer_hours: u32 = parts[3].trim().parse().ok().filter(|&v| v >= 1)?;
        Some(TrackedContract {
            contract_id,
            symbol,
            tick_types,
            buffer_hours,
            enabled: true,
        })
    }

    /// Parses the full `IB_STREAM_TRACKED_CONTRACTS` env value, skipping and
    /// logging invalid entries rather than failing the whole set.
    pub fn parse_all(raw: &str) -> Vec<TrackedContract> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for entry in raw.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
            match TrackedContract::parse(entry) {
                Some(tc) => {
                    if seen.insert(tc.contract_id) {
                        out.push(tc);
                    } else {
                        tracing::warn!(contract_id = tc.contract_id, "duplicate tracked contract id, skipping");
                    }
                }
                None => tracing::warn!(entry, "invalid tracked contract entry, skipping"),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_deterministic() {
        let a = TickMessage::generate_request_id(265598, TickType::Last, 1_700_000_000_000_000);
        let b = TickMessage::generate_request_id(265598, TickType::Last, 1_700_000_000_000_000);
        assert_eq!(a, b);
        assert!(a >= 0);
    }

    #[test]
    fn request_id_varies_by_input() {
        let a = TickMessage::generate_request_id(265598, TickType::Last, 1_700_000_000_000_000);
        let b = TickMessage::generate_request_id(265598, TickType::BidAsk, 1_700_000_000_000_000);
        assert_ne!(a, b);
    }

    #[test]
    fn round_trip_v2_v3_last() {
        let v2 = V2TickMessage {
            timestamp_us: 1_700_000_000_000_000,
            system_timestamp_us: 1_700_000_000_000_100,
            contract_id: 265598,
            tick_type: TickType::Last,
            price: Some(123.45),
            size: Some(10.0),
            unreported: false,
            bid_price: None,
            bid_size: None,
            ask_price: None,
            ask_size: None,
            bid_past_low: false,
            ask_past_high: false,
            mid_point: None,
        };
        let v3 = TickMessage::from_v2(&v2, 42);
        let back = v3.to_v2();
        assert_eq!(v2, back);
    }

    #[test]
    fn round_trip_v2_v3_bid_ask() {
        let v2 = V2TickMessage {
            timestamp_us: 1_700_000_000_000_000,
            system_timestamp_us: 1_700_000_000_000_100,
            contract_id: 711280073,
            tick_type: TickType::BidAsk,
            price: None,
            size: None,
            unreported: false,
            bid_price: Some(100.0),
            bid_size: Some(5.0),
            ask_price: Some(100.5),
            ask_size: Some(3.0),
            bid_past_low: true,
            ask_past_high: false,
            mid_point: None,
        };
        let v3 = TickMessage::from_v2(&v2, 7);
        assert_eq!(v3.to_v2(), v2);
    }

    #[test]
    fn jsonl_omits_falsy_optional_fields() {
        let msg = TickMessage {
            ib_timestamp_us: 1,
            system_timestamp_us: 2,
            contract_id: 3,
            tick_type: TickType::Last,
            request_id: 4,
            price: Some(1.0),
            size: Some(2.0),
            unreported: false,
            bid_price: None,
            bid_size: None,
            ask_price: None,
            ask_size: None,
            bid_past_low: false,
            ask_past_high: false,
            mid_point: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("upt"));
        assert!(!json.contains("bp"));
        assert!(json.contains("\"p\":1.0"));
    }

    #[test]
    fn partition_derives_utc_hour_from_microseconds() {
        // 2024-03-05T13:45:00Z
        let ts_us = 1_709_646_300_000_000_i64;
        let msg = TickMessage {
            ib_timestamp_us: ts_us,
            system_timestamp_us: ts_us,
            contract_id: 1,
            tick_type: TickType::Last,
            request_id: 1,
            price: None,
            size: None,
            unreported: false,
            bid_price: None,
            bid_size: None,
            ask_price: None,
            ask_size: None,
            bid_past_low: false,
            ask_past_high: false,
            mid_point: None,
        };
        let (y, m, d, h, secs) = msg.partition();
        assert_eq!((y, m, d, h), (2024, 3, 5, 13));
        assert_eq!(secs, ts_us / 1_000_000);
    }

    #[test]
    fn tracked_contract_parses_multiple_tick_types() {
        let tc = TrackedContract::parse("265598:AAPL:last;bid_ask:4").unwrap();
        assert_eq!(tc.contract_id, 265598);
        assert_eq!(tc.tick_types, vec![TickType::Last, TickType::BidAsk]);
        assert_eq!(tc.buffer_hours, 4);
    }

    #[test]
    fn tracked_contract_rejects_empty_tick_types() {
        assert!(TrackedContract::parse("265598:AAPL::4").is_none());
    }

    #[test]
    fn parse_all_skips_invalid_entries_and_dupes() {
        let parsed = TrackedContract::parse_all(
            "265598:AAPL:last:4,not-valid,265598:AAPL:bid_ask:4,711280073:ES:bid_ask:2",
        );
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].contract_id, 265598);
        assert_eq!(parsed[1].contract_id, 711280073);
    }
}
