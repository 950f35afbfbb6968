//! Orchestrator.
//!
//! Owns every long-lived task: the background backfill, the live stream
//! service, the day-roll clock, and the periodic snapshot log. Startup is
//! non-blocking (the engine returns in milliseconds while the backfill runs
//! behind it) and shutdown cancels and awaits each task within a bounded
//! timeout.
//!
//! Cross-source ordering: live trades that arrive while the backfill is
//! running are buffered; once the backfill completes they are replayed with
//! every id at or below the backfill maximum discarded, which keeps ingestion
//! at-most-once without blocking the live connection.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accumulator::{IngestOutcome, SessionAccumulator, VwapMode};
use crate::backfill::{
    BinanceRestClient, CircuitBreaker, HistoricalFetcher, RawTradeApi, ResilientApi, TradeApi,
};
use crate::cache::{HistoryStore, TradeCache};
use crate::config::{DataSourceKind, Settings};
use crate::error::EngineError;
use crate::exchange_info::{resolve_tick_size, SymbolInfo};
use crate::live::binance_ws::BinanceWsSource;
use crate::live::pipe::PipeSource;
use crate::live::rest_poll::RestPollSource;
use crate::live::{LiveSource, LiveStreamService, StreamHealth};
use crate::metrics::EngineMetrics;
use crate::models::{BackfillProgress, BackfillState, Trade, TradeId};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DAY_ROLL_INTERVAL: Duration = Duration::from_secs(60);
const SNAPSHOT_LOG_INTERVAL: Duration = Duration::from_secs(600);
const INGEST_BATCH: usize = 4096;
/// Upper bound on live trades buffered while the backfill runs.
const LIVE_BUFFER_CAP: usize = 500_000;

/// Holds live trades back until the backfill boundary is known.
struct LiveGate {
    buffering: bool,
    buffered: VecDeque<Trade>,
    max_backfill_id: Option<TradeId>,
    dropped_overflow: u64,
}

/// Single-process context engine for one symbol.
pub struct ContextEngine {
    settings: Settings,
    tick_size: Decimal,
    exchange_info: Option<SymbolInfo>,
    started_at: DateTime<Utc>,

    acc: RwLock<SessionAccumulator>,
    progress: Arc<RwLock<BackfillProgress>>,
    gate: Mutex<LiveGate>,

    trading_enabled: AtomicBool,
    fatal: AtomicBool,

    metrics: Arc<EngineMetrics>,
    breaker: Arc<CircuitBreaker>,
    fetcher: Arc<HistoricalFetcher>,
    history: HistoryStore,
    stream_health: Arc<RwLock<StreamHealth>>,

    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

fn day_start_utc(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN))
}

impl ContextEngine {
    /// Start the engine against the real exchange.
    pub async fn start(settings: Settings) -> anyhow::Result<Arc<Self>> {
        let raw: Arc<dyn RawTradeApi> = Arc::new(BinanceRestClient::new(&settings)?);
        Self::start_with(settings, raw, None).await
    }

    /// Start the engine with an injected transport and, optionally, an
    /// injected live source. Production uses [`ContextEngine::start`];
    /// tests drive this directly.
    pub async fn start_with(
        settings: Settings,
        raw_api: Arc<dyn RawTradeApi>,
        live_source: Option<Box<dyn LiveSource>>,
    ) -> anyhow::Result<Arc<Self>> {
        let started_at = Utc::now();
        let metrics = Arc::new(EngineMetrics::new());

        let (tick_size, exchange_info) = if settings.fetch_exchange_info {
            resolve_tick_size(&settings).await
        } else {
            (settings.profile_tick_size, None)
        };
        info!(symbol = %settings.symbol, tick = %tick_size, "tick size resolved");

        let mut acc =
            SessionAccumulator::new(started_at.date_naive(), tick_size, settings.disable_live_data);

        let history = HistoryStore::new(&settings.history_dir, &settings.symbol)?;
        if settings.bootstrap_prev_day {
            let yesterday = started_at.date_naive().pred_opt().expect("valid date");
            match history.load_levels(yesterday, tick_size) {
                Ok(Some(levels)) => {
                    info!(
                        pdh = %levels.pdh,
                        pdl = %levels.pdl,
                        poc = %levels.poc,
                        "previous-day levels loaded from history"
                    );
                    acc.set_previous_day(levels);
                }
                Ok(None) => debug!(day = %yesterday, "no previous-day history file"),
                Err(e) => warn!(error = %e, "previous-day history unreadable"),
            }
        }

        let authenticated = raw_api.is_authenticated();
        let breaker = Arc::new(CircuitBreaker::new(
            settings.rate_limit_threshold,
            Duration::from_secs(settings.cooldown_seconds),
            settings.chunk_concurrency(authenticated),
        ));
        let api: Arc<dyn TradeApi> = Arc::new(ResilientApi::new(
            raw_api,
            Arc::clone(&breaker),
            Arc::clone(&metrics),
            &settings,
        ));

        let cache = if settings.cache_enabled {
            let cache = Arc::new(TradeCache::new(&settings.cache_dir)?);
            cache.cleanup_older_than(settings.cache_keep_days);
            Some(cache)
        } else {
            None
        };

        let progress = Arc::new(RwLock::new(BackfillProgress::default()));
        let fetcher = Arc::new(HistoricalFetcher::new(
            Arc::clone(&api),
            Arc::clone(&breaker),
            cache,
            Arc::clone(&metrics),
            Arc::clone(&progress),
            settings.chunk_minutes,
        ));

        let (shutdown_tx, _) = watch::channel(false);

        let run_backfill = settings.backfill_enabled
            && !settings.data_source.skips_backfill()
            && !settings.backfill_test_mode;
        {
            let mut progress = progress.write().await;
            progress.state = if !settings.backfill_enabled {
                BackfillState::Disabled
            } else if settings.data_source.skips_backfill() {
                BackfillState::Skipped
            } else {
                BackfillState::Pending
            };
        }

        let engine = Arc::new(Self {
            tick_size,
            exchange_info,
            started_at,
            acc: RwLock::new(acc),
            progress,
            gate: Mutex::new(LiveGate {
                buffering: run_backfill,
                buffered: VecDeque::new(),
                max_backfill_id: None,
                dropped_overflow: 0,
            }),
            trading_enabled: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            metrics,
            breaker,
            fetcher,
            history,
            stream_health: Arc::new(RwLock::new(StreamHealth::default())),
            shutdown_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
            settings,
        });

        if run_backfill {
            let task = tokio::spawn(Arc::clone(&engine).run_backfill(engine.shutdown_rx()));
            engine.tasks.lock().unwrap().push(task);
        } else if engine.settings.backfill_test_mode {
            let task = tokio::spawn(Arc::clone(&engine).run_auth_probe());
            engine.tasks.lock().unwrap().push(task);
        } else {
            // Nothing to reconcile against; trading gates open immediately.
            engine.trading_enabled.store(true, Ordering::SeqCst);
        }

        Arc::clone(&engine).spawn_live(live_source, Arc::clone(&api));
        {
            let task = tokio::spawn(Arc::clone(&engine).run_day_roll(engine.shutdown_rx()));
            engine.tasks.lock().unwrap().push(task);
        }
        {
            let task = tokio::spawn(Arc::clone(&engine).run_snapshot_log(engine.shutdown_rx()));
            engine.tasks.lock().unwrap().push(task);
        }

        info!(
            symbol = %engine.settings.symbol,
            data_source = ?engine.settings.data_source,
            backfill = run_backfill,
            startup_ms = (Utc::now() - started_at).num_milliseconds(),
            "context engine started"
        );
        Ok(engine)
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn build_live_source(&self, api: Arc<dyn TradeApi>) -> Box<dyn LiveSource> {
        match self.settings.data_source {
            DataSourceKind::LiveRest => Box::new(RestPollSource::new(api)),
            DataSourceKind::LiveStream => {
                Box::new(BinanceWsSource::new(self.settings.trades_ws_url()))
            }
            DataSourceKind::LiveConnector | DataSourceKind::SkipBackfillConnector => {
                match &self.settings.connector_command {
                    Some(command) => Box::new(PipeSource::new(command.clone())),
                    None => {
                        warn!("connector source selected without CONNECTOR_COMMAND, using websocket");
                        Box::new(BinanceWsSource::new(self.settings.trades_ws_url()))
                    }
                }
            }
        }
    }

    fn spawn_live(self: Arc<Self>, injected: Option<Box<dyn LiveSource>>, api: Arc<dyn TradeApi>) {
        let source = injected.unwrap_or_else(|| self.build_live_source(api));
        let (tx, mut rx) = mpsc::channel::<Trade>(self.settings.max_queue);
        let service = LiveStreamService::new(
            source,
            self.settings.symbol.clone(),
            tx,
            Arc::clone(&self.stream_health),
        );

        let service_task = tokio::spawn(service.run(self.shutdown_rx()));
        self.tasks.lock().unwrap().push(service_task);

        let engine = Arc::clone(&self);
        let mut shutdown = self.shutdown_rx();
        let drain_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    trade = rx.recv() => match trade {
                        Some(trade) => engine.ingest_live(trade).await,
                        None => break,
                    },
                }
            }
        });
        self.tasks.lock().unwrap().push(drain_task);
    }

    /// Ingest one live trade, honoring the backfill gate.
    async fn ingest_live(&self, trade: Trade) {
        {
            let mut gate = self.gate.lock().await;
            if gate.buffering {
                if gate.buffered.len() >= LIVE_BUFFER_CAP {
                    gate.buffered.pop_front();
                    gate.dropped_overflow += 1;
                    if gate.dropped_overflow % 10_000 == 1 {
                        warn!(
                            dropped = gate.dropped_overflow,
                            "live buffer overflow while backfill runs"
                        );
                    }
                }
                gate.buffered.push_back(trade);
                return;
            }
            if let Some(max_id) = &gate.max_backfill_id {
                if trade.id <= *max_id {
                    debug!(id = %trade.id, "live trade already covered by backfill");
                    return;
                }
            }
        }

        let outcome = {
            let mut acc = self.acc.write().await;
            acc.ingest(&trade, false)
        };
        self.record_outcome(outcome, false);
    }

    fn record_outcome(&self, outcome: Result<IngestOutcome, EngineError>, from_backfill: bool) {
        match outcome {
            Ok(IngestOutcome::Accepted) => {
                let origin = if from_backfill { "backfill" } else { "live" };
                self.metrics.trades_ingested.with_label_values(&[origin]).inc();
            }
            Ok(IngestOutcome::RejectedLive) => {
                self.metrics.live_trades_rejected.inc();
            }
            Ok(IngestOutcome::OutOfSession) | Ok(IngestOutcome::Invalid) => {}
            Err(e) => self.on_fatal(e),
        }
    }

    fn on_fatal(&self, error: EngineError) {
        error!(error = %error, "accumulator invariant violated, terminating engine");
        self.fatal.store(true, Ordering::SeqCst);
        self.trading_enabled.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }

    /// Background backfill: fetch the day so far, feed the accumulator in
    /// timestamp order, then release the buffered live trades.
    async fn run_backfill(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        {
            let mut progress = self.progress.write().await;
            progress.state = BackfillState::Running;
            progress.started_at = Some(Utc::now());
        }
        self.breaker.reset_concurrency();

        let day = self.acc.read().await.day();
        let start_ms = day_start_utc(day).timestamp_millis();
        let now = Utc::now();
        let end_ms = now.timestamp_millis();

        if end_ms <= start_ms {
            info!("startup at 00:00 UTC, no intraday history to fetch");
            self.finish_backfill(None, BackfillState::Complete).await;
            return;
        }

        info!(
            day = %day,
            start_ms,
            end_ms,
            "backfill window computed, downloading"
        );

        let result = tokio::select! {
            result = self.fetcher.backfill_with_cache(day, start_ms, end_ms) => result,
            _ = shutdown.changed() => {
                self.progress.write().await.state = BackfillState::Cancelled;
                info!("backfill cancelled by shutdown");
                return;
            }
        };

        match result {
            Ok(trades) => {
                let max_id = self.ingest_backfill(&trades).await;
                if self.fatal.load(Ordering::SeqCst) {
                    return;
                }
                self.populate_previous_day().await;
                self.finish_backfill(max_id, BackfillState::Complete).await;
            }
            Err(e) => {
                error!(error = %e, "backfill failed, metrics stay imprecise");
                {
                    let mut progress = self.progress.write().await;
                    progress.state = BackfillState::Error;
                    progress.last_error = Some(e.to_string());
                }
                // Live data keeps flowing; release the gate unfiltered.
                self.release_gate(None).await;
            }
        }
    }

    async fn ingest_backfill(&self, trades: &[Trade]) -> Option<TradeId> {
        let mut max_id: Option<TradeId> = None;
        for batch in trades.chunks(INGEST_BATCH) {
            let outcomes: Vec<_> = {
                let mut acc = self.acc.write().await;
                batch.iter().map(|trade| acc.ingest(trade, true)).collect()
            };
            for (trade, outcome) in batch.iter().zip(outcomes) {
                self.record_outcome(outcome, true);
                if self.fatal.load(Ordering::SeqCst) {
                    return max_id;
                }
                // Every id the backfill saw counts toward the dedup boundary.
                match &max_id {
                    Some(current) if *current >= trade.id => {}
                    _ => max_id = Some(trade.id.clone()),
                }
            }
            // Let readers and the live drain breathe between batches.
            tokio::task::yield_now().await;
        }
        max_id
    }

    /// Replay gated live trades, dropping anything the backfill already saw.
    async fn release_gate(&self, max_backfill_id: Option<TradeId>) {
        let (buffered, dropped_overflow) = {
            let mut gate = self.gate.lock().await;
            gate.buffering = false;
            gate.max_backfill_id = max_backfill_id.clone();
            (std::mem::take(&mut gate.buffered), gate.dropped_overflow)
        };

        let mut replayed = 0u64;
        let mut duplicates = 0u64;
        for trade in buffered {
            if let Some(max_id) = &max_backfill_id {
                if trade.id <= *max_id {
                    duplicates += 1;
                    continue;
                }
            }
            let outcome = {
                let mut acc = self.acc.write().await;
                acc.ingest(&trade, false)
            };
            self.record_outcome(outcome, false);
            replayed += 1;
        }
        info!(replayed, duplicates, dropped_overflow, "live buffer released");
    }

    async fn finish_backfill(&self, max_id: Option<TradeId>, state: BackfillState) {
        self.release_gate(max_id).await;
        self.progress.write().await.state = state;
        self.trading_enabled.store(true, Ordering::SeqCst);

        let acc = self.acc.read().await;
        let (from_backfill, from_live, rejected) = acc.counters();
        info!(
            trades = acc.trade_count(),
            from_backfill,
            from_live,
            rejected,
            vwap = ?acc.vwap(VwapMode::Base).map(|v| v.to_string()),
            poc = ?acc.poc_price().map(|v| v.to_string()),
            range = ?acc.range_today().map(|v| v.to_string()),
            "backfill complete, trading enabled"
        );
    }

    /// Fill previous-day levels when startup could not load them: compute
    /// from yesterday's trades over REST, persist the profile for next time.
    async fn populate_previous_day(&self) {
        if self.acc.read().await.previous_day().is_some() {
            return;
        }
        if !self.settings.bootstrap_prev_day || !self.settings.fetch_missing_history {
            return;
        }

        let day = self.acc.read().await.day();
        let Some(prev_day) = day.pred_opt() else {
            return;
        };
        let start_ms = day_start_utc(prev_day).timestamp_millis();
        let end_ms = day_start_utc(day).timestamp_millis();

        info!(day = %prev_day, "fetching previous day for level reconstruction");
        match self.fetcher.fetch_range(start_ms, end_ms).await {
            Ok(trades) if !trades.is_empty() => {
                let mut profile = crate::profile::VolumeProfile::new();
                let mut high: Option<Decimal> = None;
                let mut low: Option<Decimal> = None;
                let mut sum_pq = Decimal::ZERO;
                let mut sum_q = Decimal::ZERO;
                for trade in &trades {
                    let Ok(bin) = crate::quantize::quantize(trade.price, self.tick_size) else {
                        continue;
                    };
                    profile.add(bin, trade.qty);
                    sum_pq += trade.price * trade.qty;
                    sum_q += trade.qty;
                    high = Some(high.map_or(trade.price, |h| h.max(trade.price)));
                    low = Some(low.map_or(trade.price, |l| l.min(trade.price)));
                }
                let vwap = (sum_q > Decimal::ZERO).then(|| sum_pq / sum_q);
                if let Some(levels) = profile.day_levels(high, low, vwap) {
                    if let Err(e) = self.history.save_day(prev_day, &profile, &levels) {
                        warn!(error = %e, "failed to persist reconstructed previous day");
                    }
                    info!(
                        trades = trades.len(),
                        pdh = %levels.pdh,
                        pdl = %levels.pdl,
                        poc = %levels.poc,
                        "previous-day levels reconstructed"
                    );
                    self.acc.write().await.set_previous_day(levels);
                }
            }
            Ok(_) => warn!(day = %prev_day, "previous day returned no trades"),
            Err(e) => warn!(error = %e, "previous-day fetch failed"),
        }
    }

    /// Single 1-hour authenticated probe (test mode): validates signing and
    /// connectivity without a full-day backfill.
    async fn run_auth_probe(self: Arc<Self>) {
        {
            let mut progress = self.progress.write().await;
            progress.state = BackfillState::Running;
            progress.started_at = Some(Utc::now());
        }

        // Fixed reference window: the previous whole hour.
        let now = Utc::now().timestamp_millis();
        let end_ms = now - now.rem_euclid(3_600_000);
        let start_ms = end_ms - 3_600_000;

        match self.fetcher.fetch_window(start_ms, end_ms).await {
            Ok(trades) => {
                info!(
                    trades = trades.len(),
                    start_ms, end_ms, "auth probe fetched reference window"
                );
                self.progress.write().await.state = BackfillState::Complete;
            }
            Err(e) => {
                error!(error = %e, "auth probe failed");
                let mut progress = self.progress.write().await;
                progress.state = BackfillState::Error;
                progress.last_error = Some(e.to_string());
            }
        }
        self.release_gate(None).await;
        self.trading_enabled.store(true, Ordering::SeqCst);
    }

    /// Clock task: roll the session at midnight UTC and persist the closed
    /// day's profile.
    async fn run_day_roll(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(DAY_ROLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {}
            }

            let today = Utc::now().date_naive();
            let current = self.acc.read().await.day();
            if today <= current {
                continue;
            }

            info!(from = %current, to = %today, "midnight crossed, rolling session day");
            let closed = self.acc.write().await.roll_day(today);
            if let Some(closed) = closed {
                if let Some(levels) = &closed.levels {
                    if let Err(e) = self.history.save_day(closed.date, &closed.profile, levels) {
                        warn!(error = %e, "failed to persist rolled day");
                    }
                }
            }
        }
    }

    async fn run_snapshot_log(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(SNAPSHOT_LOG_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => self.acc.read().await.log_snapshot(),
            }
        }
    }

    /// Cancel background tasks and await them within a bounded timeout.
    pub async fn shutdown(&self) {
        info!("engine shutdown requested");
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for mut task in tasks {
            tokio::select! {
                _ = &mut task => {}
                _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
                    warn!("task did not stop within timeout, aborting");
                    task.abort();
                }
            }
        }
        info!("engine stopped");
    }

    // === Read API projections ===

    pub fn trading_enabled(&self) -> bool {
        self.trading_enabled.load(Ordering::SeqCst)
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    /// `PRECISE` once the backfill reached a terminal success-equivalent
    /// state, otherwise `IMPRECISE` with progress.
    pub async fn metrics_precision(&self) -> String {
        let progress = self.progress.read().await;
        if progress.state.is_settled() {
            "PRECISE".to_string()
        } else {
            format!("IMPRECISE (backfill {:.0}%)", progress.fraction() * 100.0)
        }
    }

    pub async fn health_payload(&self) -> Value {
        let progress = self.progress.read().await;
        let settled = progress.state.is_settled();
        json!({
            "status": if settled && !self.is_fatal() { "ok" } else { "degraded" },
            "backfill_status": progress.state.to_string(),
            "backfill_complete": progress.state == BackfillState::Complete,
        })
    }

    pub async fn ready_payload(&self) -> Value {
        let now = Utc::now();
        let progress = self.progress.read().await.clone();
        let stream = self.stream_health.read().await;
        let acc = self.acc.read().await;
        json!({
            "session": {
                "day": acc.day().format("%Y-%m-%d").to_string(),
                "nowUtc": now.to_rfc3339(),
                "started_at": self.started_at.to_rfc3339(),
            },
            "trading_enabled": self.trading_enabled(),
            "backfill": {
                "state": progress.state.to_string(),
                "chunks_done": progress.chunks_done,
                "chunks_total": progress.chunks_total,
                "chunks_failed": progress.chunks_failed,
                "trades_loaded": progress.trades_loaded,
                "eta_seconds": progress.eta_seconds(now),
            },
            "metrics_precision": if progress.state.is_settled() {
                "PRECISE".to_string()
            } else {
                format!("IMPRECISE (backfill {:.0}%)", progress.fraction() * 100.0)
            },
            "live": stream.to_json(0),
        })
    }

    pub async fn context_payload(&self, mode: VwapMode) -> Value {
        let mut payload = self.acc.read().await.context_payload(mode, Utc::now());
        payload["precision"] = Value::String(self.metrics_precision().await);
        payload
    }

    pub async fn backfill_status_payload(&self) -> Value {
        let now = Utc::now();
        let progress = self.progress.read().await;
        json!({
            "status": progress.state.to_string(),
            "chunks_done": progress.chunks_done,
            "chunks_total": progress.chunks_total,
            "chunks_failed": progress.chunks_failed,
            "trades_loaded": progress.trades_loaded,
            "started_at": progress.started_at.map(|t| t.to_rfc3339()),
            "eta_seconds": progress.eta_seconds(now),
            "last_error": progress.last_error,
            "circuit_breaker": self.breaker.snapshot(),
        })
    }

    pub async fn debug_vwap_payload(&self) -> Value {
        self.acc.read().await.debug_vwap_payload()
    }

    pub async fn debug_poc_payload(&self) -> Value {
        self.acc.read().await.debug_poc_payload()
    }

    pub async fn debug_trades_payload(&self) -> Value {
        let mut payload = self.acc.read().await.debug_trades_payload();
        let gate = self.gate.lock().await;
        payload["buffered_live_trades"] = json!(gate.buffered.len());
        payload["config"] = json!({
            "data_source": format!("{:?}", self.settings.data_source),
            "backfill_enabled": self.settings.backfill_enabled,
            "disable_live_data": self.settings.disable_live_data,
            "cache_enabled": self.settings.cache_enabled,
            "test_mode": self.settings.backfill_test_mode,
        });
        payload
    }

    pub async fn debug_exchange_info_payload(&self) -> Value {
        match &self.exchange_info {
            Some(info) => json!({
                "symbol": info.symbol,
                "tickSize": info.tick_size.map(|d| d.to_string()),
                "stepSize": info.step_size.map(|d| d.to_string()),
                "minQty": info.min_qty.map(|d| d.to_string()),
                "minNotional": info.min_notional.map(|d| d.to_string()),
                "resolvedTick": self.tick_size.to_string(),
                "raw": info.raw,
            }),
            None => json!({
                "symbol": self.settings.symbol,
                "error": "exchange info unavailable",
                "resolvedTick": self.tick_size.to_string(),
            }),
        }
    }

    pub fn metrics_text(&self) -> String {
        self.metrics.encode()
    }
}
