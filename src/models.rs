//! Core data models.
//!
//! All monetary values use `Decimal` for exact arithmetic. Trades are
//! immutable once parsed; the engine never mutates a trade after ingestion.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Normalized aggressor side for trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "buy"),
            TradeSide::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            other => Err(format!("invalid trade side: {other}")),
        }
    }
}

/// Exchange trade identifier.
///
/// Exchanges disagree on the id type (integer vs string), so the id is kept
/// as a tagged union with a total order. Ids are never coerced to a numeric
/// hash; deduplication relies on exact equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TradeId {
    Int(i64),
    Str(String),
}

impl TradeId {
    /// Parse an id from its textual form, preferring the integer variant.
    pub fn parse(s: &str) -> Self {
        match s.parse::<i64>() {
            Ok(n) => TradeId::Int(n),
            Err(_) => TradeId::Str(s.to_string()),
        }
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeId::Int(n) => write!(f, "{n}"),
            TradeId::Str(s) => write!(f, "{s}"),
        }
    }
}

impl Ord for TradeId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (TradeId::Int(a), TradeId::Int(b)) => a.cmp(b),
            (TradeId::Str(a), TradeId::Str(b)) => a.cmp(b),
            (TradeId::Int(_), TradeId::Str(_)) => Ordering::Less,
            (TradeId::Str(_), TradeId::Int(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for TradeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A single executed trade from the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Trade time, milliseconds since the UNIX epoch (UTC).
    pub ts_ms: i64,
    pub price: Decimal,
    pub qty: Decimal,
    pub side: TradeSide,
    pub is_buyer_maker: bool,
    pub id: TradeId,
}

impl Trade {
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.ts_ms).unwrap_or_else(Utc::now)
    }

    /// UTC calendar day the trade belongs to.
    pub fn day(&self) -> NaiveDate {
        self.timestamp().date_naive()
    }

    /// Sort key used everywhere: timestamp, ties broken by id.
    pub fn sort_key(&self) -> (i64, TradeId) {
        (self.ts_ms, self.id.clone())
    }
}

/// Order-book depth update from a live source. Carried through the event
/// pipeline for health accounting; the accumulator only consumes trades.
#[derive(Debug, Clone)]
pub struct DepthUpdate {
    pub ts_ms: i64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub last_update_id: i64,
}

/// Backfill lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillState {
    NotStarted,
    Pending,
    Running,
    Complete,
    Skipped,
    Disabled,
    Error,
    Cancelled,
}

impl BackfillState {
    /// States in which intraday metrics are considered precise.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            BackfillState::Complete | BackfillState::Skipped | BackfillState::Disabled
        )
    }
}

impl fmt::Display for BackfillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackfillState::NotStarted => "not_started",
            BackfillState::Pending => "pending",
            BackfillState::Running => "running",
            BackfillState::Complete => "complete",
            BackfillState::Skipped => "skipped",
            BackfillState::Disabled => "disabled",
            BackfillState::Error => "error",
            BackfillState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Progress snapshot of the background backfill task.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillProgress {
    pub state: BackfillState,
    pub chunks_total: usize,
    pub chunks_done: usize,
    pub chunks_failed: usize,
    pub trades_loaded: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for BackfillProgress {
    fn default() -> Self {
        Self {
            state: BackfillState::NotStarted,
            chunks_total: 0,
            chunks_done: 0,
            chunks_failed: 0,
            trades_loaded: 0,
            started_at: None,
            last_error: None,
        }
    }
}

impl BackfillProgress {
    /// Completed fraction in `[0, 1]`, by chunks.
    pub fn fraction(&self) -> f64 {
        if self.chunks_total == 0 {
            return match self.state {
                BackfillState::Complete => 1.0,
                _ => 0.0,
            };
        }
        self.chunks_done as f64 / self.chunks_total as f64
    }

    /// Estimated seconds remaining, from average per-chunk duration so far.
    pub fn eta_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        let started = self.started_at?;
        if self.chunks_done == 0 || self.chunks_total <= self.chunks_done {
            return None;
        }
        let elapsed = (now - started).num_milliseconds().max(0) as f64 / 1000.0;
        let per_chunk = elapsed / self.chunks_done as f64;
        Some(per_chunk * (self.chunks_total - self.chunks_done) as f64)
    }
}

/// Timestamp/price/qty checkpoint of a single trade, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct TradeCheckpoint {
    pub ts: DateTime<Utc>,
    pub price: Decimal,
    pub qty: Decimal,
}

impl TradeCheckpoint {
    pub fn of(trade: &Trade) -> Self {
        Self {
            ts: trade.timestamp(),
            price: trade.price,
            qty: trade.qty,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "ts": self.ts.to_rfc3339(),
            "price": self.price.to_string(),
            "qty": self.qty.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_id_orders_ints_naturally() {
        assert!(TradeId::Int(1) < TradeId::Int(2));
        assert!(TradeId::Int(i64::MAX) < TradeId::Str("0".into()));
        assert!(TradeId::Str("a".into()) < TradeId::Str("b".into()));
    }

    #[test]
    fn trade_id_parse_prefers_int() {
        assert_eq!(TradeId::parse("42"), TradeId::Int(42));
        assert_eq!(TradeId::parse("ab-12"), TradeId::Str("ab-12".into()));
    }

    #[test]
    fn backfill_settled_states() {
        assert!(BackfillState::Complete.is_settled());
        assert!(BackfillState::Skipped.is_settled());
        assert!(BackfillState::Disabled.is_settled());
        assert!(!BackfillState::Running.is_settled());
        assert!(!BackfillState::Error.is_settled());
    }
}
