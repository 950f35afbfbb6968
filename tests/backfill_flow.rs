//! Backfill behavior against a scripted trade API: pagination cursor
//! advancement, cache-aware resume, and partial failure handling.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;
use tokio::sync::RwLock;

use context_engine::backfill::{CircuitBreaker, HistoricalFetcher, TradeApi};
use context_engine::cache::TradeCache;
use context_engine::error::{EngineError, Result};
use context_engine::metrics::EngineMetrics;
use context_engine::models::{BackfillProgress, Trade, TradeId, TradeSide};

fn trade(id: i64, ts_ms: i64) -> Trade {
    Trade {
        ts_ms,
        price: dec!(100.0),
        qty: dec!(1),
        side: TradeSide::Buy,
        is_buyer_maker: false,
        id: TradeId::Int(id),
    }
}

/// Serves a fixed tape, windowed and limited like the real endpoint, and
/// records every requested range.
struct TapeApi {
    tape: Vec<Trade>,
    requests: Mutex<Vec<(i64, i64)>>,
    /// Ranges whose requests fail with a transient error.
    poison: Vec<(i64, i64)>,
}

impl TapeApi {
    fn new(tape: Vec<Trade>) -> Self {
        Self {
            tape,
            requests: Mutex::new(Vec::new()),
            poison: Vec::new(),
        }
    }

    fn requests(&self) -> Vec<(i64, i64)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TradeApi for TapeApi {
    async fn fetch_agg_trades(&self, start_ms: i64, end_ms: i64, limit: usize) -> Result<Vec<Trade>> {
        self.requests.lock().unwrap().push((start_ms, end_ms));
        for &(ps, pe) in &self.poison {
            if start_ms >= ps && start_ms < pe {
                return Err(EngineError::Transient("poisoned range".into()));
            }
        }
        Ok(self
            .tape
            .iter()
            .filter(|t| t.ts_ms >= start_ms && t.ts_ms < end_ms)
            .take(limit)
            .cloned()
            .collect())
    }

    fn is_authenticated(&self) -> bool {
        false
    }
}

fn fetcher_over(api: Arc<TapeApi>, cache: Option<Arc<TradeCache>>) -> HistoricalFetcher {
    HistoricalFetcher::new(
        api,
        Arc::new(CircuitBreaker::new(3, std::time::Duration::from_millis(50), 4)),
        cache,
        Arc::new(EngineMetrics::new()),
        Arc::new(RwLock::new(BackfillProgress::default())),
        10,
    )
}

fn ms(date: NaiveDate, h: u32, m: u32, s: u32, milli: u32) -> i64 {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::from_hms_milli_opt(h, m, s, milli).unwrap()))
        .timestamp_millis()
}

#[tokio::test]
async fn pagination_cursor_advances_past_last_timestamp() {
    // 2500 trades, one per millisecond: three pages of 1000/1000/500.
    let base = 1_700_000_000_000i64;
    let tape: Vec<Trade> = (0..2500).map(|i| trade(i, base + i)).collect();
    let api = Arc::new(TapeApi::new(tape));
    let fetcher = fetcher_over(Arc::clone(&api), None);

    let trades = fetcher.fetch_window(base, base + 2500).await.unwrap();
    assert_eq!(trades.len(), 2500);

    let requests = api.requests();
    assert_eq!(requests.len(), 3);
    // After a page ending at ts L, the next request starts at L + 1.
    assert_eq!(requests[0].0, base);
    assert_eq!(requests[1].0, base + 999 + 1);
    assert_eq!(requests[2].0, base + 1999 + 1);

    // The same trade is never returned twice.
    let unique: HashSet<_> = trades.iter().map(|t| t.id.clone()).collect();
    assert_eq!(unique.len(), 2500);
}

#[tokio::test]
async fn resume_requests_only_the_gap_after_cached_tail() {
    let date = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
    let dir = tempdir().unwrap();
    let cache = Arc::new(TradeCache::new(dir.path()).unwrap());

    // Cache already covers the morning up to 09:59:59.900.
    let cached_tail_ms = ms(date, 9, 59, 59, 900);
    let cached: Vec<Trade> = (0..100)
        .map(|i| trade(i, cached_tail_ms - 1000 * (100 - i)))
        .chain(std::iter::once(trade(100, cached_tail_ms)))
        .collect();
    cache.append_and_dedup(date, &cached).unwrap();

    // The exchange holds fresher trades up to 10:29.
    let tape: Vec<Trade> = (0..30)
        .map(|i| trade(200 + i, ms(date, 10, 0, 0, 0) + i * 60_000))
        .collect();
    let api = Arc::new(TapeApi::new(tape));
    let fetcher = fetcher_over(Arc::clone(&api), Some(Arc::clone(&cache)));

    let start_ms = ms(date, 0, 0, 0, 0);
    let end_ms = ms(date, 10, 30, 0, 0);
    let merged = fetcher.backfill_with_cache(date, start_ms, end_ms).await.unwrap();

    // Every request starts after the cached tail; the cached span is never
    // re-fetched.
    let requests = api.requests();
    assert!(!requests.is_empty());
    assert!(requests.iter().all(|&(s, _)| s >= cached_tail_ms + 1));
    assert_eq!(
        requests.iter().map(|&(s, _)| s).min().unwrap(),
        cached_tail_ms + 1
    );

    // Merged set: cached + fresh, unique ids, ordered.
    assert_eq!(merged.len(), 101 + 30);
    let unique: HashSet<_> = merged.iter().map(|t| t.id.clone()).collect();
    assert_eq!(unique.len(), merged.len());
    assert!(merged.windows(2).all(|w| w[0].ts_ms <= w[1].ts_ms));

    // And the rewritten cache file has no duplicate ids either.
    let reloaded = cache.load(date).unwrap();
    let unique: HashSet<_> = reloaded.iter().map(|t| t.id.clone()).collect();
    assert_eq!(unique.len(), reloaded.len());
    assert_eq!(cache.last_trade_ts(date).unwrap(), Some(merged.last().unwrap().ts_ms));
}

#[tokio::test]
async fn fresh_cache_skips_the_network_entirely() {
    let date = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
    let dir = tempdir().unwrap();
    let cache = Arc::new(TradeCache::new(dir.path()).unwrap());

    let end_ms = ms(date, 12, 0, 0, 0);
    let cached: Vec<Trade> = (0..10).map(|i| trade(i, end_ms - 500 + i)).collect();
    cache.append_and_dedup(date, &cached).unwrap();

    let api = Arc::new(TapeApi::new(Vec::new()));
    let fetcher = fetcher_over(Arc::clone(&api), Some(cache));

    let result = fetcher
        .backfill_with_cache(date, ms(date, 0, 0, 0, 0), end_ms)
        .await
        .unwrap();
    assert_eq!(result.len(), 10);
    assert!(api.requests().is_empty());
}

#[tokio::test]
async fn failed_chunk_is_skipped_not_fatal() {
    let base = 1_700_000_000_000i64;
    let chunk = 10 * 60 * 1000i64;
    // Four 10-minute chunks; one trade per chunk; chunk 2 poisoned.
    let tape: Vec<Trade> = (0..4).map(|i| trade(i, base + i * chunk + 1000)).collect();
    let mut api = TapeApi::new(tape);
    api.poison.push((base + chunk, base + 2 * chunk));
    let api = Arc::new(api);

    let progress = Arc::new(RwLock::new(BackfillProgress::default()));
    let fetcher = HistoricalFetcher::new(
        Arc::clone(&api) as Arc<dyn TradeApi>,
        Arc::new(CircuitBreaker::new(3, std::time::Duration::from_millis(50), 2)),
        None,
        Arc::new(EngineMetrics::new()),
        Arc::clone(&progress),
        10,
    );

    let trades = fetcher.fetch_range(base, base + 4 * chunk).await.unwrap();
    // Three of four chunks landed.
    assert_eq!(trades.len(), 3);
    let snapshot = progress.read().await.clone();
    assert_eq!(snapshot.chunks_total, 4);
    assert_eq!(snapshot.chunks_done, 4);
    assert_eq!(snapshot.chunks_failed, 1);
}
