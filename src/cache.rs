//! Persistent trade cache and rolled-profile history.
//!
//! The backfill cache keeps one CSV per UTC date
//! (`backfill_YYYY-MM-DD.csv`), deduplicated on trade id and ordered by
//! `(ts_ms, trade_id)`. Files are rewritten atomically (temp file + rename)
//! so a crash mid-write never leaves a half-written cache. Prices and
//! quantities are stored in their decimal string form, so a load returns
//! exactly what was saved.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::models::{Trade, TradeId, TradeSide};
use crate::profile::{DayLevels, VolumeProfile};
use crate::quantize::quantize;

#[derive(Debug, Serialize, Deserialize)]
struct TradeRow {
    ts_ms: i64,
    trade_id: String,
    price: String,
    qty: String,
    side: String,
    is_buyer_maker: bool,
}

impl TradeRow {
    fn from_trade(trade: &Trade) -> Self {
        Self {
            ts_ms: trade.ts_ms,
            trade_id: trade.id.to_string(),
            price: trade.price.to_string(),
            qty: trade.qty.to_string(),
            side: trade.side.to_string(),
            is_buyer_maker: trade.is_buyer_maker,
        }
    }

    fn into_trade(self) -> Result<Trade> {
        let price = Decimal::from_str(&self.price)
            .map_err(|e| EngineError::Parse(format!("cache price: {e}")))?;
        let qty = Decimal::from_str(&self.qty)
            .map_err(|e| EngineError::Parse(format!("cache qty: {e}")))?;
        let side: TradeSide = self.side.parse().map_err(EngineError::Parse)?;
        Ok(Trade {
            ts_ms: self.ts_ms,
            price,
            qty,
            side,
            is_buyer_maker: self.is_buyer_maker,
            id: TradeId::parse(&self.trade_id),
        })
    }
}

/// Write rows to `path` atomically via a sibling temp file.
fn write_atomic<S: Serialize>(path: &Path, rows: impl Iterator<Item = S>) -> Result<()> {
    let tmp = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp)
            .map_err(|e| EngineError::Transient(format!("open {}: {e}", tmp.display())))?;
        for row in rows {
            writer
                .serialize(row)
                .map_err(|e| EngineError::Transient(format!("write {}: {e}", tmp.display())))?;
        }
        writer
            .flush()
            .map_err(|e| EngineError::Transient(format!("flush {}: {e}", tmp.display())))?;
    }
    fs::rename(&tmp, path)
        .map_err(|e| EngineError::Transient(format!("rename {}: {e}", path.display())))?;
    Ok(())
}

/// Append-only, date-partitioned store of raw backfilled trades.
pub struct TradeCache {
    dir: PathBuf,
}

impl TradeCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| EngineError::Transient(format!("create {}: {e}", dir.display())))?;
        info!(dir = %dir.display(), "backfill cache initialized");
        Ok(Self { dir })
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("backfill_{}.csv", date.format("%Y-%m-%d")))
    }

    /// Load all cached trades for `date`, ordered by `(ts_ms, trade_id)`.
    ///
    /// Missing file means an empty cache; a present but unreadable file is a
    /// [`EngineError::CacheCorrupt`], never silently ignored.
    pub fn load(&self, date: NaiveDate) -> Result<Vec<Trade>> {
        let path = self.path_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::Reader::from_path(&path)
            .map_err(|e| EngineError::CacheCorrupt(format!("{}: {e}", path.display())))?;
        let mut trades = Vec::new();
        for record in reader.deserialize::<TradeRow>() {
            let row =
                record.map_err(|e| EngineError::CacheCorrupt(format!("{}: {e}", path.display())))?;
            trades.push(
                row.into_trade()
                    .map_err(|e| EngineError::CacheCorrupt(format!("{}: {e}", path.display())))?,
            );
        }
        trades.sort_by_key(Trade::sort_key);
        debug!(date = %date, trades = trades.len(), "cache loaded");
        Ok(trades)
    }

    /// Merge `new_trades` into the file for `date`, deduplicating on trade id
    /// and keeping `(ts_ms, trade_id)` order. Idempotent.
    pub fn append_and_dedup(&self, date: NaiveDate, new_trades: &[Trade]) -> Result<usize> {
        let existing = match self.load(date) {
            Ok(trades) => trades,
            Err(EngineError::CacheCorrupt(msg)) => {
                warn!(error = %msg, "cache unreadable, rewriting from scratch");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let mut seen: HashSet<TradeId> = HashSet::with_capacity(existing.len() + new_trades.len());
        let mut merged: Vec<Trade> = Vec::with_capacity(existing.len() + new_trades.len());
        for trade in existing.into_iter().chain(new_trades.iter().cloned()) {
            if seen.insert(trade.id.clone()) {
                merged.push(trade);
            }
        }
        merged.sort_by_key(Trade::sort_key);

        write_atomic(&self.path_for(date), merged.iter().map(TradeRow::from_trade))?;
        debug!(date = %date, total = merged.len(), "cache rewritten");
        Ok(merged.len())
    }

    /// Highest trade timestamp in the file for `date`, for resume.
    pub fn last_trade_ts(&self, date: NaiveDate) -> Result<Option<i64>> {
        let trades = self.load(date)?;
        Ok(trades.iter().map(|t| t.ts_ms).max())
    }

    /// Best-effort removal of cache files older than `keep_days`.
    pub fn cleanup_older_than(&self, keep_days: u32) {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(i64::from(keep_days));
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "cache cleanup skipped");
                return;
            }
        };

        let mut deleted = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(date_str) = name
                .strip_prefix("backfill_")
                .and_then(|rest| rest.strip_suffix(".csv"))
            else {
                continue;
            };
            let Ok(file_date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
                continue;
            };
            if file_date < cutoff {
                match fs::remove_file(entry.path()) {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!(file = %name, error = %e, "cache cleanup failed"),
                }
            }
        }
        if deleted > 0 {
            info!(deleted, keep_days, "old cache files removed");
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ProfileRow {
    price: String,
    volume: String,
}

/// Store for rolled daily volume profiles and their level sidecars.
pub struct HistoryStore {
    dir: PathBuf,
    symbol_lower: String,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>, symbol: &str) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| EngineError::Transient(format!("create {}: {e}", dir.display())))?;
        Ok(Self {
            dir,
            symbol_lower: symbol.to_lowercase(),
        })
    }

    fn profile_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_profile.csv",
            self.symbol_lower,
            date.format("%Y-%m-%d")
        ))
    }

    fn meta_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_meta.json",
            self.symbol_lower,
            date.format("%Y-%m-%d")
        ))
    }

    /// Persist a closed day's profile plus a sidecar with its headline levels.
    pub fn save_day(&self, date: NaiveDate, profile: &VolumeProfile, levels: &DayLevels) -> Result<()> {
        write_atomic(
            &self.profile_path(date),
            profile.iter().map(|(price, volume)| ProfileRow {
                price: price.to_string(),
                volume: volume.to_string(),
            }),
        )?;

        let meta = serde_json::json!({
            "date": date.format("%Y-%m-%d").to_string(),
            "pdh": levels.pdh.to_string(),
            "pdl": levels.pdl.to_string(),
            "vwap": levels.vwap.map(|v| v.to_string()),
        });
        let meta_path = self.meta_path(date);
        fs::write(&meta_path, serde_json::to_vec_pretty(&meta).unwrap_or_default())
            .map_err(|e| EngineError::Transient(format!("write {}: {e}", meta_path.display())))?;

        info!(date = %date, bins = profile.len(), "daily profile persisted");
        Ok(())
    }

    /// Rebuild a day's levels from its persisted profile, if present.
    ///
    /// Bin prices are re-quantized with the current tick so levels stay
    /// identical even if the stored file predates a tick change.
    pub fn load_levels(&self, date: NaiveDate, tick: Decimal) -> Result<Option<DayLevels>> {
        let path = self.profile_path(date);
        if !path.exists() {
            return Ok(None);
        }

        let mut reader = csv::Reader::from_path(&path)
            .map_err(|e| EngineError::CacheCorrupt(format!("{}: {e}", path.display())))?;
        let mut profile = VolumeProfile::new();
        let mut high: Option<Decimal> = None;
        let mut low: Option<Decimal> = None;
        for record in reader.deserialize::<ProfileRow>() {
            let row =
                record.map_err(|e| EngineError::CacheCorrupt(format!("{}: {e}", path.display())))?;
            let price = Decimal::from_str(&row.price)
                .map_err(|e| EngineError::CacheCorrupt(format!("{}: {e}", path.display())))?;
            let volume = Decimal::from_str(&row.volume)
                .map_err(|e| EngineError::CacheCorrupt(format!("{}: {e}", path.display())))?;
            profile.add(quantize(price, tick)?, volume);
            high = Some(high.map_or(price, |h| h.max(price)));
            low = Some(low.map_or(price, |l| l.min(price)));
        }

        // The sidecar carries the raw (un-binned) extremes and the closing
        // VWAP; the profile alone can only recover binned approximations.
        let meta = self.load_meta(date);
        let field = |key: &str| -> Option<Decimal> {
            Decimal::from_str(meta.as_ref()?.get(key)?.as_str()?).ok()
        };
        Ok(profile.day_levels(
            field("pdh").or(high),
            field("pdl").or(low),
            field("vwap"),
        ))
    }

    fn load_meta(&self, date: NaiveDate) -> Option<serde_json::Value> {
        let raw = fs::read_to_string(self.meta_path(date)).ok()?;
        serde_json::from_str(&raw).ok()
    }
}
