//! Session-day accumulator.
//!
//! Single owner of all intraday state: VWAP sums, the volume profile,
//! opening range, day extremes, aggressor volume and origin counters.
//! Every trade, backfilled or live, enters through
//! [`SessionAccumulator::ingest`], so the metrics are identical whether the
//! day started from cache, a fresh backfill, or mid-session.
//!
//! The accumulator is single-threaded by contract; the engine serializes all
//! ingress behind one lock and readers snapshot through the same lock, so no
//! observer ever sees a torn state.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::models::{Trade, TradeCheckpoint, TradeSide};
use crate::profile::{DayLevels, VolumeProfile};
use crate::quantize::quantize;

/// VWAP flavour exposed by the read API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VwapMode {
    /// `Σ price·qty / Σ qty` over base-asset quantity.
    #[default]
    Base,
    /// `Σ price²·qty / Σ price·qty`; diagnostic only.
    Quote,
}

impl VwapMode {
    pub fn parse(s: Option<&str>) -> Self {
        match s.map(str::to_ascii_lowercase).as_deref() {
            Some("quote") => VwapMode::Quote,
            _ => VwapMode::Base,
        }
    }
}

/// What [`SessionAccumulator::ingest`] did with a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// Timestamp outside the current session day.
    OutOfSession,
    /// Live data disabled by configuration.
    RejectedLive,
    /// Non-positive price or quantity.
    Invalid,
}

/// A completed session day, handed to the orchestrator at roll time.
pub struct ClosedDay {
    pub date: NaiveDate,
    pub profile: VolumeProfile,
    pub levels: Option<DayLevels>,
}

/// Incremental intraday metrics for one UTC session day.
pub struct SessionAccumulator {
    tick_size: Decimal,
    disable_live: bool,

    day: NaiveDate,
    day_start: DateTime<Utc>,
    or_start: DateTime<Utc>,
    or_end: DateTime<Utc>,

    sum_price_qty: Decimal,
    sum_qty: Decimal,
    // Quote-mode numerator Σ p²·q; its denominator is `sum_price_qty`.
    sum_price2_qty: Decimal,

    trade_count: u64,
    trades_from_backfill: u64,
    trades_from_live: u64,
    live_trades_rejected: u64,

    day_high: Option<Decimal>,
    day_low: Option<Decimal>,
    or_high: Option<Decimal>,
    or_low: Option<Decimal>,

    buy_volume: Decimal,
    sell_volume: Decimal,
    /// Aggressor delta accumulated before the opening-range start.
    pre_open_delta: Decimal,

    profile: VolumeProfile,
    poc: Option<(Decimal, Decimal)>,

    last_price: Option<Decimal>,
    last_ts: Option<DateTime<Utc>>,
    first_trade: Option<TradeCheckpoint>,
    last_trade: Option<TradeCheckpoint>,

    prev_day: Option<DayLevels>,
}

/// Opening-range window bounds for a given day: `[08:00, 08:10)` UTC.
fn or_window(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&day.and_time(NaiveTime::from_hms_opt(8, 0, 0).unwrap()));
    (start, start + chrono::Duration::minutes(10))
}

impl SessionAccumulator {
    pub fn new(day: NaiveDate, tick_size: Decimal, disable_live: bool) -> Self {
        let day_start = Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN));
        let (or_start, or_end) = or_window(day);
        Self {
            tick_size,
            disable_live,
            day,
            day_start,
            or_start,
            or_end,
            sum_price_qty: Decimal::ZERO,
            sum_qty: Decimal::ZERO,
            sum_price2_qty: Decimal::ZERO,
            trade_count: 0,
            trades_from_backfill: 0,
            trades_from_live: 0,
            live_trades_rejected: 0,
            day_high: None,
            day_low: None,
            or_high: None,
            or_low: None,
            buy_volume: Decimal::ZERO,
            sell_volume: Decimal::ZERO,
            pre_open_delta: Decimal::ZERO,
            profile: VolumeProfile::new(),
            poc: None,
            last_price: None,
            last_ts: None,
            first_trade: None,
            last_trade: None,
            prev_day: None,
        }
    }

    pub fn day(&self) -> NaiveDate {
        self.day
    }

    pub fn tick_size(&self) -> Decimal {
        self.tick_size
    }

    pub fn trade_count(&self) -> u64 {
        self.trade_count
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.trades_from_backfill,
            self.trades_from_live,
            self.live_trades_rejected,
        )
    }

    pub fn set_previous_day(&mut self, levels: DayLevels) {
        self.prev_day = Some(levels);
    }

    pub fn previous_day(&self) -> Option<&DayLevels> {
        self.prev_day.as_ref()
    }

    /// Ingest one trade. Origin is tagged by the caller: backfilled trades
    /// carry `from_backfill = true`, live trades `false`.
    pub fn ingest(&mut self, trade: &Trade, from_backfill: bool) -> Result<IngestOutcome> {
        let ts = trade.timestamp();
        if ts < self.day_start || ts >= self.day_start + chrono::Duration::days(1) {
            debug!(ts = %ts, day = %self.day, "trade outside session day dropped");
            return Ok(IngestOutcome::OutOfSession);
        }

        if !from_backfill && self.disable_live {
            self.live_trades_rejected += 1;
            return Ok(IngestOutcome::RejectedLive);
        }

        if trade.qty <= Decimal::ZERO || trade.price <= Decimal::ZERO {
            debug!(price = %trade.price, qty = %trade.qty, "non-positive trade dropped");
            return Ok(IngestOutcome::Invalid);
        }

        if from_backfill {
            self.trades_from_backfill += 1;
        } else {
            self.trades_from_live += 1;
        }
        self.trade_count += 1;

        let notional = trade.price * trade.qty;
        self.sum_price_qty += notional;
        self.sum_qty += trade.qty;
        self.sum_price2_qty += trade.price * notional;

        let bin = quantize(trade.price, self.tick_size)?;
        let bin_volume = self.profile.add(bin, trade.qty);
        self.update_poc(bin, bin_volume);

        self.day_high = Some(self.day_high.map_or(trade.price, |h| h.max(trade.price)));
        self.day_low = Some(self.day_low.map_or(trade.price, |l| l.min(trade.price)));

        if ts >= self.or_start && ts < self.or_end {
            self.or_high = Some(self.or_high.map_or(trade.price, |h| h.max(trade.price)));
            self.or_low = Some(self.or_low.map_or(trade.price, |l| l.min(trade.price)));
        }

        match trade.side {
            TradeSide::Buy => self.buy_volume += trade.qty,
            TradeSide::Sell => self.sell_volume += trade.qty,
        }
        if ts < self.or_start {
            match trade.side {
                TradeSide::Buy => self.pre_open_delta += trade.qty,
                TradeSide::Sell => self.pre_open_delta -= trade.qty,
            }
        }

        let checkpoint = TradeCheckpoint::of(trade);
        if self.first_trade.is_none() {
            self.first_trade = Some(checkpoint.clone());
        }
        self.last_trade = Some(checkpoint);
        self.last_price = Some(trade.price);
        self.last_ts = Some(ts);

        self.check_invariants()?;
        Ok(IngestOutcome::Accepted)
    }

    fn update_poc(&mut self, bin: Decimal, volume: Decimal) {
        match self.poc {
            None => self.poc = Some((bin, volume)),
            Some((poc_bin, poc_volume)) => {
                if volume > poc_volume || (volume == poc_volume && bin < poc_bin) {
                    self.poc = Some((bin, volume));
                }
            }
        }
    }

    fn check_invariants(&self) -> Result<()> {
        if self.sum_qty < Decimal::ZERO || self.sum_price_qty < Decimal::ZERO {
            return Err(EngineError::Fatal(format!(
                "vwap sums went negative: sum_qty={} sum_price_qty={}",
                self.sum_qty, self.sum_price_qty
            )));
        }
        Ok(())
    }

    /// VWAP for the requested mode, `None` before the first trade.
    pub fn vwap(&self, mode: VwapMode) -> Option<Decimal> {
        match mode {
            VwapMode::Base => {
                if self.sum_qty <= Decimal::ZERO {
                    None
                } else {
                    Some(self.sum_price_qty / self.sum_qty)
                }
            }
            VwapMode::Quote => {
                if self.sum_price_qty <= Decimal::ZERO {
                    None
                } else {
                    Some(self.sum_price2_qty / self.sum_price_qty)
                }
            }
        }
    }

    pub fn poc_price(&self) -> Option<Decimal> {
        self.poc.map(|(p, _)| p)
    }

    pub fn cumulative_delta(&self) -> Decimal {
        self.buy_volume - self.sell_volume
    }

    pub fn range_today(&self) -> Option<Decimal> {
        Some(self.day_high? - self.day_low?)
    }

    /// Close the current day and start `new_day`.
    ///
    /// The closed day's levels become the new previous-day levels; the full
    /// closed profile is returned so the orchestrator can persist it.
    pub fn roll_day(&mut self, new_day: NaiveDate) -> Option<ClosedDay> {
        let closed = if self.profile.total_volume() > Decimal::ZERO {
            let levels =
                self.profile
                    .day_levels(self.day_high, self.day_low, self.vwap(VwapMode::Base));
            if let Some(ref levels) = levels {
                self.prev_day = Some(levels.clone());
            }
            Some(ClosedDay {
                date: self.day,
                profile: std::mem::take(&mut self.profile),
                levels,
            })
        } else {
            None
        };

        let prev = self.prev_day.take();
        *self = Self::new(new_day, self.tick_size, self.disable_live);
        self.prev_day = prev;

        info!(day = %new_day, "session day rolled");
        closed
    }

    /// Session phase label: london / overlap / off (UTC clock).
    fn session_state(now: DateTime<Utc>) -> &'static str {
        let minutes = now.hour() * 60 + now.minute();
        match minutes {
            m if (8 * 60..12 * 60).contains(&m) => "london",
            m if (12 * 60..16 * 60 + 30).contains(&m) => "overlap",
            _ => "off",
        }
    }

    fn opt_dec(value: Option<Decimal>) -> Value {
        match value {
            Some(d) => json!(d.to_string()),
            None => Value::Null,
        }
    }

    /// Levels block of the context payload.
    pub fn levels_payload(&self, mode: VwapMode) -> Value {
        let prev = self.prev_day.as_ref();
        json!({
            "OR": {
                "hi": Self::opt_dec(self.or_high),
                "lo": Self::opt_dec(self.or_low),
                "startTs": self.or_start.to_rfc3339(),
                "endTs": self.or_end.to_rfc3339(),
            },
            "VWAP": Self::opt_dec(self.vwap(mode)),
            "POCd": Self::opt_dec(self.poc_price()),
            "PDH": Self::opt_dec(prev.map(|p| p.pdh)),
            "PDL": Self::opt_dec(prev.map(|p| p.pdl)),
            "POCprev": Self::opt_dec(prev.map(|p| p.poc)),
            "VAHprev": Self::opt_dec(prev.map(|p| p.vah)),
            "VALprev": Self::opt_dec(prev.map(|p| p.val)),
            "VWAPprev": Self::opt_dec(prev.and_then(|p| p.vwap)),
        })
    }

    /// Full context payload: session, levels, stats, last price.
    pub fn context_payload(&self, mode: VwapMode, now: DateTime<Utc>) -> Value {
        json!({
            "session": {
                "state": Self::session_state(now),
                "day": self.day.format("%Y-%m-%d").to_string(),
                "nowUtc": now.to_rfc3339(),
            },
            "levels": self.levels_payload(mode),
            "stats": {
                "rangeToday": Self::opt_dec(self.range_today()),
                "cumulativeDelta": self.cumulative_delta().to_string(),
                "cd_pre": self.pre_open_delta.to_string(),
            },
            "price": {
                "price": Self::opt_dec(self.last_price),
                "ts": self.last_ts.map(|t| t.to_rfc3339()),
            },
        })
    }

    pub fn debug_vwap_payload(&self) -> Value {
        json!({
            "anchor": self.day_start.to_rfc3339(),
            "sum_price_qty": self.sum_price_qty.to_string(),
            "sum_qty": self.sum_qty.to_string(),
            "vwap": Self::opt_dec(self.vwap(VwapMode::Base)),
            "trade_count": self.trade_count,
            "first_trade": self.first_trade.as_ref().map(TradeCheckpoint::to_json),
            "last_trade": self.last_trade.as_ref().map(TradeCheckpoint::to_json),
        })
    }

    pub fn debug_poc_payload(&self) -> Value {
        let top: Vec<Value> = self
            .profile
            .top_bins(10)
            .into_iter()
            .enumerate()
            .map(|(idx, (price, volume))| {
                json!({
                    "rank": idx + 1,
                    "price": price.to_string(),
                    "volume": volume.to_string(),
                })
            })
            .collect();
        json!({
            "bin_size": self.tick_size.to_string(),
            "top_bins": top,
            "poc_price": Self::opt_dec(self.poc.map(|(p, _)| p)),
            "poc_volume": Self::opt_dec(self.poc.map(|(_, v)| v)),
            "total_volume": self.profile.total_volume().to_string(),
            "bins": self.profile.len(),
        })
    }

    pub fn debug_trades_payload(&self) -> Value {
        json!({
            "trade_count": self.trade_count,
            "trades_from_backfill": self.trades_from_backfill,
            "trades_from_live": self.trades_from_live,
            "live_trades_rejected": self.live_trades_rejected,
            "disable_live_data": self.disable_live,
        })
    }

    /// Periodic in-session snapshot log, emitted by the orchestrator.
    pub fn log_snapshot(&self) {
        info!(
            day = %self.day,
            vwap = ?self.vwap(VwapMode::Base).map(|v| v.to_string()),
            poc = ?self.poc_price().map(|v| v.to_string()),
            sum_pv = %self.sum_price_qty,
            sum_v = %self.sum_qty,
            trades = self.trade_count,
            "context snapshot"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeId;
    use rust_decimal_macros::dec;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    fn ms_at(day: NaiveDate, h: u32, m: u32, s: u32, milli: u32) -> i64 {
        Utc.from_utc_datetime(&day.and_time(NaiveTime::from_hms_milli_opt(h, m, s, milli).unwrap()))
            .timestamp_millis()
    }

    fn trade_at(id: i64, ts_ms: i64, price: Decimal, qty: Decimal, side: TradeSide) -> Trade {
        Trade {
            ts_ms,
            price,
            qty,
            side,
            is_buyer_maker: side == TradeSide::Sell,
            id: TradeId::Int(id),
        }
    }

    #[test]
    fn vwap_poc_and_or_from_reference_trades() {
        let mut acc = SessionAccumulator::new(day(), dec!(0.1), false);
        let prices = [dec!(100.0), dec!(100.1), dec!(100.2), dec!(100.1), dec!(100.0)];
        for (i, price) in prices.iter().enumerate() {
            let ts = ms_at(day(), 8, i as u32, 0, 0);
            acc.ingest(
                &trade_at(i as i64 + 1, ts, *price, dec!(1), TradeSide::Buy),
                true,
            )
            .unwrap();
        }

        assert_eq!(acc.vwap(VwapMode::Base).unwrap(), dec!(100.08));
        assert_eq!(acc.poc_price().unwrap(), dec!(100.0));
        assert_eq!(acc.or_high, Some(dec!(100.2)));
        assert_eq!(acc.or_low, Some(dec!(100.0)));
        assert_eq!(acc.range_today().unwrap(), dec!(0.2));
        assert_eq!(acc.trade_count(), 5);
    }

    #[test]
    fn profile_volume_equals_sum_qty() {
        let mut acc = SessionAccumulator::new(day(), dec!(0.1), false);
        for i in 0..50i64 {
            let price = dec!(100) + Decimal::new(i % 7, 1);
            let qty = Decimal::new(i % 5 + 1, 2);
            acc.ingest(
                &trade_at(i, ms_at(day(), 9, 0, i as u32 % 60, 0), price, qty, TradeSide::Buy),
                true,
            )
            .unwrap();
        }
        let profile_total: Decimal = acc.debug_poc_payload()["total_volume"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(profile_total, acc.sum_qty);
    }

    #[test]
    fn opening_range_frozen_outside_window() {
        let mut acc = SessionAccumulator::new(day(), dec!(0.1), false);
        acc.ingest(
            &trade_at(1, ms_at(day(), 8, 5, 0, 0), dec!(100.0), dec!(1), TradeSide::Buy),
            true,
        )
        .unwrap();
        // Boundary: 08:10:00.000 is outside the half-open window.
        acc.ingest(
            &trade_at(2, ms_at(day(), 8, 10, 0, 0), dec!(200.0), dec!(1), TradeSide::Buy),
            true,
        )
        .unwrap();
        acc.ingest(
            &trade_at(3, ms_at(day(), 15, 0, 0, 0), dec!(50.0), dec!(1), TradeSide::Sell),
            true,
        )
        .unwrap();

        assert_eq!(acc.or_high, Some(dec!(100.0)));
        assert_eq!(acc.or_low, Some(dec!(100.0)));
        assert_eq!(acc.day_high, Some(dec!(200.0)));
        assert_eq!(acc.day_low, Some(dec!(50.0)));
    }

    #[test]
    fn live_disable_rejects_only_live() {
        let mut acc = SessionAccumulator::new(day(), dec!(0.1), true);
        for i in 0..100i64 {
            acc.ingest(
                &trade_at(i, ms_at(day(), 9, 0, 0, 0), dec!(100.0), dec!(1), TradeSide::Buy),
                true,
            )
            .unwrap();
        }
        for i in 100..150i64 {
            let outcome = acc
                .ingest(
                    &trade_at(i, ms_at(day(), 9, 30, 0, 0), dec!(250.0), dec!(1), TradeSide::Buy),
                    false,
                )
                .unwrap();
            assert_eq!(outcome, IngestOutcome::RejectedLive);
        }

        let (backfill, live, rejected) = acc.counters();
        assert_eq!(backfill, 100);
        assert_eq!(live, 0);
        assert_eq!(rejected, 50);
        // Rejected trades leave the metrics untouched.
        assert_eq!(acc.vwap(VwapMode::Base).unwrap(), dec!(100.0));
        assert_eq!(acc.day_high, Some(dec!(100.0)));
    }

    #[test]
    fn out_of_day_trades_are_dropped() {
        let mut acc = SessionAccumulator::new(day(), dec!(0.1), false);
        let yesterday = day().pred_opt().unwrap();
        let outcome = acc
            .ingest(
                &trade_at(1, ms_at(yesterday, 23, 59, 59, 900), dec!(100.0), dec!(1), TradeSide::Buy),
                true,
            )
            .unwrap();
        assert_eq!(outcome, IngestOutcome::OutOfSession);
        assert_eq!(acc.trade_count(), 0);
    }

    #[test]
    fn day_roll_carries_previous_levels() {
        let mut acc = SessionAccumulator::new(day(), dec!(0.1), false);
        acc.ingest(
            &trade_at(1, ms_at(day(), 23, 59, 59, 900), dec!(100.0), dec!(2), TradeSide::Buy),
            false,
        )
        .unwrap();

        let next = day().succ_opt().unwrap();
        let closed = acc.roll_day(next).expect("closed day");
        assert_eq!(closed.date, day());

        acc.ingest(
            &trade_at(2, ms_at(next, 0, 0, 0, 100), dec!(105.0), dec!(1), TradeSide::Buy),
            false,
        )
        .unwrap();

        let prev = acc.previous_day().expect("previous-day levels");
        assert_eq!(prev.pdh, dec!(100.0));
        assert_eq!(prev.pdl, dec!(100.0));
        assert_eq!(prev.poc, dec!(100.0));
        assert_eq!(prev.vah, dec!(100.0));
        assert_eq!(prev.val, dec!(100.0));
        assert_eq!(prev.vwap, Some(dec!(100.0)));

        assert_eq!(acc.trade_count(), 1);
        assert_eq!(acc.vwap(VwapMode::Base), Some(dec!(105.0)));
        assert_eq!(acc.day(), next);
    }

    #[test]
    fn quote_vwap_diagnostic_mode() {
        let mut acc = SessionAccumulator::new(day(), dec!(0.1), false);
        acc.ingest(
            &trade_at(1, ms_at(day(), 9, 0, 0, 0), dec!(100), dec!(1), TradeSide::Buy),
            true,
        )
        .unwrap();
        acc.ingest(
            &trade_at(2, ms_at(day(), 9, 1, 0, 0), dec!(200), dec!(1), TradeSide::Buy),
            true,
        )
        .unwrap();

        // base: 300/2 = 150; quote: (100² + 200²)/300 ≈ 166.67
        assert_eq!(acc.vwap(VwapMode::Base), Some(dec!(150)));
        let quote = acc.vwap(VwapMode::Quote).unwrap();
        assert!(quote > dec!(166.6) && quote < dec!(166.7));
    }

    #[test]
    fn cumulative_delta_and_pre_open_delta() {
        let mut acc = SessionAccumulator::new(day(), dec!(0.1), false);
        acc.ingest(
            &trade_at(1, ms_at(day(), 5, 0, 0, 0), dec!(100), dec!(3), TradeSide::Buy),
            true,
        )
        .unwrap();
        acc.ingest(
            &trade_at(2, ms_at(day(), 6, 0, 0, 0), dec!(100), dec!(1), TradeSide::Sell),
            true,
        )
        .unwrap();
        acc.ingest(
            &trade_at(3, ms_at(day(), 9, 0, 0, 0), dec!(100), dec!(5), TradeSide::Sell),
            true,
        )
        .unwrap();

        assert_eq!(acc.cumulative_delta(), dec!(-3));
        assert_eq!(acc.pre_open_delta, dec!(2));
    }
}
