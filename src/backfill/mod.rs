//! Historical trade backfill.
//!
//! Splits the requested window into fixed-size chunks, fetches them over a
//! bounded worker pool whose width follows the circuit breaker, deduplicates
//! globally on trade id, and reconciles with the on-disk cache so a restart
//! only fetches the gap since the last cached trade.

pub mod circuit;
pub mod client;

use chrono::NaiveDate;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

pub use circuit::{BreakerState, CircuitBreaker};
pub use client::{BinanceRestClient, RawTradeApi, ResilientApi, TradeApi};

use crate::cache::TradeCache;
use crate::error::{EngineError, Result};
use crate::metrics::EngineMetrics;
use crate::models::{BackfillProgress, Trade, TradeId};

/// Exchange page size for the aggregated-trades endpoint.
const PAGE_LIMIT: usize = 1000;
/// Hard cap on pagination rounds inside one chunk.
const MAX_ITERATIONS_PER_CHUNK: usize = 500;
/// Windows shorter than this skip chunking entirely.
const SINGLE_FETCH_THRESHOLD_MS: i64 = 30 * 60 * 1000;
/// Cache freshness slack: a cache reaching within this of `end` is complete.
const CACHE_FRESH_EPSILON_MS: i64 = 1000;

/// Half-open fetch window.
#[derive(Debug, Clone, Copy)]
struct Chunk {
    start_ms: i64,
    end_ms: i64,
}

/// Chunked, rate-limit-aware historical trade fetcher.
pub struct HistoricalFetcher {
    api: Arc<dyn TradeApi>,
    breaker: Arc<CircuitBreaker>,
    cache: Option<Arc<TradeCache>>,
    metrics: Arc<EngineMetrics>,
    progress: Arc<RwLock<BackfillProgress>>,
    chunk_minutes: i64,
}

impl HistoricalFetcher {
    pub fn new(
        api: Arc<dyn TradeApi>,
        breaker: Arc<CircuitBreaker>,
        cache: Option<Arc<TradeCache>>,
        metrics: Arc<EngineMetrics>,
        progress: Arc<RwLock<BackfillProgress>>,
        chunk_minutes: i64,
    ) -> Self {
        Self {
            api,
            breaker,
            cache,
            metrics,
            progress,
            chunk_minutes: chunk_minutes.max(1),
        }
    }

    /// Paginate one window serially (short windows, test mode, chunk bodies).
    pub async fn fetch_window(&self, start_ms: i64, end_ms: i64) -> Result<Vec<Trade>> {
        fetch_chunk(Arc::clone(&self.api), Chunk { start_ms, end_ms }).await
    }

    fn chunks_for(&self, start_ms: i64, end_ms: i64) -> Vec<Chunk> {
        let span = self.chunk_minutes * 60 * 1000;
        let mut chunks = Vec::new();
        let mut cursor = start_ms;
        while cursor < end_ms {
            chunks.push(Chunk {
                start_ms: cursor,
                end_ms: (cursor + span).min(end_ms),
            });
            cursor += span;
        }
        chunks
    }

    /// Fetch `[start_ms, end_ms)` with the chunked worker pool.
    ///
    /// Failed chunks are logged and skipped; a partial backfill beats none.
    /// The result is globally deduplicated and ordered by `(ts_ms, trade_id)`.
    pub async fn fetch_range(&self, start_ms: i64, end_ms: i64) -> Result<Vec<Trade>> {
        if end_ms <= start_ms {
            return Ok(Vec::new());
        }

        if end_ms - start_ms < SINGLE_FETCH_THRESHOLD_MS {
            let mut trades = self.fetch_window(start_ms, end_ms).await?;
            dedup_sorted(&mut trades);
            let mut progress = self.progress.write().await;
            progress.chunks_total += 1;
            progress.chunks_done += 1;
            progress.trades_loaded += trades.len() as u64;
            return Ok(trades);
        }

        let chunks = self.chunks_for(start_ms, end_ms);
        {
            let mut progress = self.progress.write().await;
            progress.chunks_total += chunks.len();
        }
        info!(
            chunks = chunks.len(),
            concurrency = self.breaker.concurrency(),
            start_ms,
            end_ms,
            "chunked backfill starting"
        );

        let (tx, mut rx) = mpsc::channel::<(usize, Result<Vec<Trade>>)>(chunks.len().max(1));
        let mut pending = chunks.into_iter().enumerate();
        let mut in_flight = 0usize;
        let mut collected: Vec<Trade> = Vec::new();
        let mut failed = 0usize;

        // Manual scheduler: spawn up to the breaker's current width, refill
        // as workers finish so a mid-run halving takes effect immediately.
        loop {
            while in_flight < self.breaker.concurrency() {
                let Some((idx, chunk)) = pending.next() else {
                    break;
                };
                in_flight += 1;
                let api = Arc::clone(&self.api);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = fetch_chunk(api, chunk).await;
                    let _ = tx.send((idx, result)).await;
                });
            }

            if in_flight == 0 {
                break;
            }

            let Some((idx, result)) = rx.recv().await else {
                break;
            };
            in_flight -= 1;

            let mut progress = self.progress.write().await;
            progress.chunks_done += 1;
            match result {
                Ok(trades) => {
                    progress.trades_loaded += trades.len() as u64;
                    drop(progress);
                    collected.extend(trades);
                }
                Err(e) => {
                    failed += 1;
                    progress.chunks_failed += 1;
                    drop(progress);
                    self.metrics.chunks_failed.inc();
                    warn!(chunk = idx, error = %e, "chunk failed, skipping");
                }
            }
        }

        dedup_sorted(&mut collected);
        info!(
            trades = collected.len(),
            failed_chunks = failed,
            "chunked backfill finished"
        );
        Ok(collected)
    }

    /// Cache-aware backfill for one UTC day window.
    ///
    /// Fresh cache ⇒ no network. Stale cache ⇒ fetch only
    /// `[last_cached_ts + 1, end)` and merge. No cache ⇒ full fetch.
    pub async fn backfill_with_cache(
        &self,
        date: NaiveDate,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Trade>> {
        let Some(cache) = self.cache.as_ref() else {
            return self.fetch_range(start_ms, end_ms).await;
        };

        let cached = match cache.load(date) {
            Ok(cached) => cached,
            Err(EngineError::CacheCorrupt(msg)) => {
                error!(error = %msg, "cache corrupt, proceeding with full backfill");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        if cached.is_empty() {
            let trades = self.fetch_range(start_ms, end_ms).await?;
            if !trades.is_empty() {
                cache.append_and_dedup(date, &trades)?;
            }
            return Ok(trades);
        }

        let last_cached_ts = cached.iter().map(|t| t.ts_ms).max().unwrap_or(start_ms);
        if last_cached_ts >= end_ms - CACHE_FRESH_EPSILON_MS {
            info!(
                cached = cached.len(),
                last_cached_ts, "cache is fresh, skipping fetch"
            );
            return Ok(cached);
        }

        info!(
            cached = cached.len(),
            resume_from = last_cached_ts + 1,
            end_ms,
            "resuming backfill from cache"
        );
        let fresh = self.fetch_range(last_cached_ts + 1, end_ms).await?;
        cache.append_and_dedup(date, &fresh)?;

        let mut merged = cached;
        merged.extend(fresh);
        dedup_sorted(&mut merged);
        Ok(merged)
    }
}

async fn fetch_chunk(api: Arc<dyn TradeApi>, chunk: Chunk) -> Result<Vec<Trade>> {
    let mut trades = Vec::new();
    let mut cursor = chunk.start_ms;
    let mut iterations = 0usize;

    while cursor < chunk.end_ms {
        iterations += 1;
        if iterations > MAX_ITERATIONS_PER_CHUNK {
            error!(
                start_ms = chunk.start_ms,
                end_ms = chunk.end_ms,
                cursor,
                "pagination cap reached, stopping chunk early"
            );
            break;
        }

        let batch = api.fetch_agg_trades(cursor, chunk.end_ms, PAGE_LIMIT).await?;
        if batch.is_empty() {
            break;
        }
        let batch_len = batch.len();
        let last_ts = batch.iter().map(|t| t.ts_ms).max().unwrap_or(cursor);
        trades.extend(
            batch
                .into_iter()
                .filter(|t| t.ts_ms >= chunk.start_ms && t.ts_ms < chunk.end_ms),
        );
        if batch_len < PAGE_LIMIT || last_ts >= chunk.end_ms {
            break;
        }
        cursor = last_ts + 1;
    }

    Ok(trades)
}

/// Sort by `(ts_ms, trade_id)` and drop duplicate ids in place.
pub fn dedup_sorted(trades: &mut Vec<Trade>) {
    trades.sort_by_key(Trade::sort_key);
    let mut seen: HashSet<TradeId> = HashSet::with_capacity(trades.len());
    trades.retain(|t| seen.insert(t.id.clone()));
}
