//! Trading-hours parsing and market/health status computation (C8).
//!
//! Grounded on `ib_util/trading_hours.py::TradingHoursParser`. The
//! PRE_MARKET/AFTER_HOURS split is derived from the contract's own parsed
//! session boundaries rather than a wall-clock UTC-hour constant — the
//! original compares against a fixed UTC hour, which drifts for
//! non-US-Eastern-listed contracts and across DST; this is the fix named
//! in the REDESIGN FLAGS.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketStatus {
    Open,
    PreMarket,
    AfterHours,
    Closed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    OffHours,
    Unknown,
}

impl HealthStatus {
    /// Ordering for "worst of all" aggregation (spec §4.4), with `OffHours`
    /// treated as better than `Degraded`.
    fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::OffHours => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
            HealthStatus::Unknown => 4,
        }
    }

    pub fn worst_of(statuses: impl IntoIterator<Item = HealthStatus>) -> HealthStatus {
        statuses
            .into_iter()
            .max_by_key(|s| s.severity())
            .unwrap_or(HealthStatus::Unknown)
    }
}

/// One contiguous session, or a closed marker, for a single calendar date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradingSession {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub closed: bool,
}

pub struct TradingHoursParser;

impl TradingHoursParser {
    /// Parses `YYYYMMDD:HHMM-HHMM[,HHMM-HHMM]...;YYYYMMDD:CLOSED;...`, where
    /// an end time may take the cross-date form `HHMM-YYYYMMDD:HHMM`.
    /// Malformed segments are skipped with a warning rather than failing the
    /// whole string.
    pub fn parse_hours_string(raw: &str) -> Vec<TradingSession> {
        let mut sessions = Vec::new();
        for date_segment in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let Some((date_part, time_part)) = date_segment.split_once(':') else {
                warn!(segment = date_segment, "malformed trading-hours segment, skipping");
                continue;
            };
            let Some(date) = NaiveDate::parse_from_str(date_part.trim(), "%Y%m%d").ok() else {
                warn!(date_part, "unparseable trading-hours date, skipping");
                continue;
            };

            if time_part.trim().eq_ignore_ascii_case("closed") {
                sessions.push(TradingSession {
                    start: date.and_hms_opt(0, 0, 0).unwrap(),
                    end: date.and_hms_opt(23, 59, 59).unwrap(),
                    closed: true,
                });
                continue;
            }

            for session_part in time_part.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match Self::parse_session(date, session_part) {
                    Some(session) => sessions.push(session),
                    None => warn!(session_part, "unparseable trading session, skipping"),
                }
            }
        }
        sessions
    }

    fn parse_session(date: NaiveDate, session_part: &str) -> Option<TradingSession> {
        let (start_str, end_str) = session_part.split_once('-')?;
        let start_time = NaiveTime::parse_from_str(start_str.trim(), "%H%M").ok()?;
        let start = date.and_time(start_time);

        let end = if end_str.contains(':') {
            // cross-date form: HHMM-YYYYMMDD:HHMM
            let (end_date_str, end_time_str) = end_str.split_once(':')?;
            let end_date = NaiveDate::parse_from_str(end_date_str.trim(), "%Y%m%d").ok()?;
            let end_time = NaiveTime::parse_from_str(end_time_str.trim(), "%H%M").ok()?;
            end_date.and_time(end_time)
        } else {
            let end_time = NaiveTime::parse_from_str(end_str.trim(), "%H%M").ok()?;
            date.and_time(end_time)
        };

        Some(TradingSession {
            start,
            end,
            closed: false,
        })
    }

    /// Market status at `at` (UTC) against `sessions`, which the caller has
    /// already parsed and converted into UTC-naive boundaries.
    ///
    /// PRE_MARKET/AFTER_HOURS are derived from the nearest session on the
    /// same UTC calendar date: within `pre_market_window` before a session's
    /// start is PRE_MARKET; within `after_hours_window` after a session's
    /// end is AFTER_HOURS. No session found for the date -> `CLOSED` if any
    /// session entry exists for it marked closed, else `UNKNOWN`.
    pub fn market_status(
        sessions: &[TradingSession],
        at: DateTime<Utc>,
        pre_market_window: Duration,
        after_hours_window: Duration,
    ) -> MarketStatus {
        let naive_at = at.naive_utc();
        let today = naive_at.date();

        let todays: Vec<&TradingSession> = sessions.iter().filter(|s| s.start.date() == today).collect();
        if todays.is_empty() {
            return MarketStatus::Unknown;
        }
        if todays.iter().all(|s| s.closed) {
            return MarketStatus::Closed;
        }

        for session in todays.iter().filter(|s| !s.closed) {
            if naive_at >= session.start && naive_at <= session.end {
                return MarketStatus::Open;
            }
            let pre_start = session.start - chrono::Duration::from_std(pre_market_window).unwrap_or_default();
            if naive_at >= pre_start && naive_at < session.start {
                return MarketStatus::PreMarket;
            }
            let after_end = session.end + chrono::Duration::from_std(after_hours_window).unwrap_or_default();
            if naive_at > session.end && naive_at <= after_end {
                return MarketStatus::AfterHours;
            }
        }
        MarketStatus::Closed
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StalenessThresholds {
    pub market_hours: Duration,
    pub extended_hours_multiplier: u32,
    pub closed_multiplier: u32,
}

impl Default for StalenessThresholds {
    fn default() -> Self {
        Self {
            market_hours: Duration::from_secs(15 * 60),
            extended_hours_multiplier: 3,
            closed_multiplier: 10,
        }
    }
}

impl StalenessThresholds {
    pub fn threshold_for(&self, status: MarketStatus) -> Duration {
        match status {
            MarketStatus::Open => self.market_hours,
            MarketStatus::PreMarket | MarketStatus::AfterHours => {
                self.market_hours * self.extended_hours_multiplier
            }
            MarketStatus::Closed | MarketStatus::Unknown => self.market_hours * self.closed_multiplier,
        }
    }
}

/// Per-contract health decision (spec §4.4 "Health computation").
#[allow(clippy::too_many_arguments)]
pub fn compute_health(
    has_connection_issues: bool,
    market_status: MarketStatus,
    active_subscriptions: usize,
    expected_subscriptions: usize,
    staleness: Duration,
    thresholds: &StalenessThresholds,
) -> HealthStatus {
    if has_connection_issues {
        return HealthStatus::Unhealthy;
    }
    if market_status == MarketStatus::Closed {
        return HealthStatus::OffHours;
    }
    if active_subscriptions < expected_subscriptions {
        return HealthStatus::Degraded;
    }
    match market_status {
        MarketStatus::Open => {
            if staleness > Duration::from_secs(30 * 60) {
                HealthStatus::Unhealthy
            } else if staleness > thresholds.threshold_for(market_status) {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            }
        }
        MarketStatus::PreMarket | MarketStatus::AfterHours => {
            if staleness > Duration::from_secs(60 * 60) {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            }
        }
        MarketStatus::Closed | MarketStatus::Unknown => HealthStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_simple_session() {
        let sessions = TradingHoursParser::parse_hours_string("20240305:0930-1600");
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].closed);
    }

    #[test]
    fn parses_closed_day_case_insensitive() {
        let sessions = TradingHoursParser::parse_hours_string("20240309:CLOSED;20240310:Closed");
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s.closed));
    }

    #[test]
    fn parses_multiple_sessions_same_day() {
        let sessions = TradingHoursParser::parse_hours_string("20240305:0400-0930,0930-1600,1600-2000");
        assert_eq!(sessions.len(), 3);
    }

    #[test]
    fn parses_cross_date_end() {
        let sessions = TradingHoursParser::parse_hours_string("20240305:1800-20240306:1700");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].end.date(), NaiveDate::from_ymd_opt(2024, 3, 6).unwrap());
    }

    #[test]
    fn skips_malformed_segment_without_failing_whole_string() {
        let sessions = TradingHoursParser::parse_hours_string("not-a-date:0930-1600;20240305:0930-1600");
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn market_status_open_during_session() {
        let sessions = TradingHoursParser::parse_hours_string("20240305:0930-1600");
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let status = TradingHoursParser::market_status(
            &sessions,
            at,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        assert_eq!(status, MarketStatus::Open);
    }

    #[test]
    fn market_status_pre_market_before_session_start() {
        let sessions = TradingHoursParser::parse_hours_string("20240305:0930-1600");
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap();
        let status = TradingHoursParser::market_status(
            &sessions,
            at,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        assert_eq!(status, MarketStatus::PreMarket);
    }

    #[test]
    fn market_status_after_hours_after_session_end() {
        let sessions = TradingHoursParser::parse_hours_string("20240305:0930-1600");
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 16, 30, 0).unwrap();
        let status = TradingHoursParser::market_status(
            &sessions,
            at,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        assert_eq!(status, MarketStatus::AfterHours);
    }

    #[test]
    fn market_status_closed_day_is_closed_not_unknown() {
        let sessions = TradingHoursParser::parse_hours_string("20240309:CLOSED");
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        let status = TradingHoursParser::market_status(
            &sessions,
            at,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        assert_eq!(status, MarketStatus::Closed);
    }

    #[test]
    fn health_connection_issues_always_unhealthy() {
        let status = compute_health(
            true,
            MarketStatus::Open,
            2,
            2,
            Duration::from_secs(0),
            &StalenessThresholds::default(),
        );
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[test]
    fn health_degraded_when_subscriptions_missing() {
        let status = compute_health(
            false,
            MarketStatus::Open,
            1,
            2,
            Duration::from_secs(0),
            &StalenessThresholds::default(),
        );
        assert_eq!(status, HealthStatus::Degraded);
    }

    #[test]
    fn worst_of_treats_off_hours_better_than_degraded() {
        let worst = HealthStatus::worst_of([HealthStatus::OffHours, HealthStatus::Degraded]);
        assert_eq!(worst, HealthStatus::Degraded);
    }
}
