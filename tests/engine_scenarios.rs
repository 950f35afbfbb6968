//! End-to-end engine scenarios against scripted transports: fresh backfill,
//! live/backfill reconciliation, and the live-data disable switch.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

use context_engine::backfill::RawTradeApi;
use context_engine::config::{DataSourceKind, Settings};
use context_engine::engine::ContextEngine;
use context_engine::error::Result;
use context_engine::live::{LiveEvent, LiveSource};
use context_engine::models::{Trade, TradeId, TradeSide};

fn test_settings(dirs: &TempDir, disable_live: bool) -> Settings {
    Settings {
        symbol: "BTCUSDT".into(),
        data_source: DataSourceKind::LiveStream,
        disable_live_data: disable_live,
        fetch_exchange_info: false,
        cache_dir: dirs.path().join("backfill").display().to_string(),
        history_dir: dirs.path().join("history").display().to_string(),
        retry_base_secs: 0.01,
        public_delay_ms: 0,
        cooldown_seconds: 1,
        ..Settings::default()
    }
}

fn trade(id: i64, ts_ms: i64, price: Decimal) -> Trade {
    Trade {
        ts_ms,
        price,
        qty: dec!(1),
        side: TradeSide::Buy,
        is_buyer_maker: false,
        id: TradeId::Int(id),
    }
}

/// Raw transport serving a fixed tape, windowed like the real endpoint.
struct TapeTransport {
    tape: Vec<Trade>,
}

#[async_trait]
impl RawTradeApi for TapeTransport {
    async fn send(&self, start_ms: i64, end_ms: i64, limit: usize) -> Result<Vec<Trade>> {
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

    fn downgrade_to_public(&self, _reason: &str) {}
}

/// Live source that emits a scripted list of trades, then idles.
struct ScriptedLive {
    pending: Mutex<Vec<Trade>>,
    connected: AtomicBool,
}

impl ScriptedLive {
    fn new(mut trades: Vec<Trade>) -> Self {
        trades.reverse();
        Self {
            pending: Mutex::new(trades),
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl LiveSource for ScriptedLive {
    async fn connect(&mut self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn subscribe(&mut self, _symbol: &str, _channels: &[&str]) -> Result<()> {
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<LiveEvent>> {
        let next = self.pending.lock().unwrap().pop();
        match next {
            Some(trade) => Ok(Some(LiveEvent::Trade(trade))),
            None => {
                sleep(Duration::from_millis(20)).await;
                Ok(None)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn health(&self) -> Value {
        json!({"transport": "scripted"})
    }
}

fn dec_field(value: &Value) -> Decimal {
    value.as_str().expect("decimal field").parse().expect("valid decimal")
}

/// Millisecond timestamps shortly after today's UTC midnight, always in the
/// past relative to "now".
fn today_open_ms(offset_ms: i64) -> i64 {
    let day = Utc::now().date_naive();
    day.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis() + offset_ms
}

/// Poll until `$cond` holds or fail the test after 10 seconds.
macro_rules! wait_until {
    ($cond:expr, $what:literal) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if $cond {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, $what);
            sleep(Duration::from_millis(25)).await;
        }
    }};
}

#[tokio::test]
async fn fresh_backfill_produces_reference_metrics() {
    let dirs = TempDir::new().unwrap();
    let settings = test_settings(&dirs, false);

    let prices = [dec!(100.0), dec!(100.1), dec!(100.2), dec!(100.1), dec!(100.0)];
    let tape: Vec<Trade> = prices
        .iter()
        .enumerate()
        .map(|(i, p)| trade(i as i64 + 1, today_open_ms(i as i64 + 1), *p))
        .collect();

    let engine = ContextEngine::start_with(
        settings,
        Arc::new(TapeTransport { tape }),
        Some(Box::new(ScriptedLive::new(Vec::new()))),
    )
    .await
    .unwrap();

    wait_until!(
        engine.backfill_status_payload().await["status"] == "complete",
        "backfill did not complete"
    );
    assert!(engine.trading_enabled());

    let context = engine.context_payload(context_engine::VwapMode::Base).await;
    assert_eq!(dec_field(&context["levels"]["VWAP"]), dec!(100.08));
    // Bins 100.0 and 100.1 tie on volume; the lower price wins.
    assert_eq!(dec_field(&context["levels"]["POCd"]), dec!(100.0));
    assert_eq!(dec_field(&context["stats"]["rangeToday"]), dec!(0.2));
    assert_eq!(context["precision"], "PRECISE");

    let debug = engine.debug_trades_payload().await;
    assert_eq!(debug["trades_from_backfill"], 5);
    assert_eq!(debug["trades_from_live"], 0);

    let health = engine.health_payload().await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["backfill_complete"], true);

    engine.shutdown().await;
}

#[tokio::test]
async fn live_trades_overlapping_backfill_are_deduplicated() {
    let dirs = TempDir::new().unwrap();
    let settings = test_settings(&dirs, false);

    // Backfill covers ids 1..=100.
    let tape: Vec<Trade> = (1..=100)
        .map(|i| trade(i, today_open_ms(i), dec!(100.0)))
        .collect();
    // The live stream replays ids 95..=110: 6 duplicates, 10 fresh.
    let now = Utc::now().timestamp_millis();
    let live: Vec<Trade> = (95..=110).map(|i| trade(i, now, dec!(100.5))).collect();

    let engine = ContextEngine::start_with(
        settings,
        Arc::new(TapeTransport { tape }),
        Some(Box::new(ScriptedLive::new(live))),
    )
    .await
    .unwrap();

    wait_until!(
        engine.debug_trades_payload().await["trades_from_live"] == 10,
        "live trades were not reconciled"
    );

    let debug = engine.debug_trades_payload().await;
    assert_eq!(debug["trades_from_backfill"], 100);
    assert_eq!(debug["trades_from_live"], 10);
    assert_eq!(debug["trade_count"], 110);

    engine.shutdown().await;
}

#[tokio::test]
async fn disable_live_rejects_stream_but_keeps_backfill() {
    let dirs = TempDir::new().unwrap();
    let settings = test_settings(&dirs, true);

    let tape: Vec<Trade> = (1..=100)
        .map(|i| trade(i, today_open_ms(i), dec!(100.0)))
        .collect();
    let now = Utc::now().timestamp_millis();
    let live: Vec<Trade> = (200..250).map(|i| trade(i, now, dec!(250.0))).collect();

    let engine = ContextEngine::start_with(
        settings,
        Arc::new(TapeTransport { tape }),
        Some(Box::new(ScriptedLive::new(live))),
    )
    .await
    .unwrap();

    wait_until!(
        engine.debug_trades_payload().await["live_trades_rejected"] == 50,
        "live trades were not rejected"
    );

    let debug = engine.debug_trades_payload().await;
    assert_eq!(debug["trades_from_backfill"], 100);
    assert_eq!(debug["trades_from_live"], 0);
    assert_eq!(debug["live_trades_rejected"], 50);

    // Metrics depend only on the backfill.
    let context = engine.context_payload(context_engine::VwapMode::Base).await;
    assert_eq!(dec_field(&context["levels"]["VWAP"]), dec!(100));
    assert_eq!(dec_field(&context["stats"]["rangeToday"]), dec!(0));

    engine.shutdown().await;
}

#[tokio::test]
async fn skip_backfill_source_enables_trading_immediately() {
    let dirs = TempDir::new().unwrap();
    let mut settings = test_settings(&dirs, false);
    settings.data_source = DataSourceKind::SkipBackfillConnector;

    let engine = ContextEngine::start_with(
        settings,
        Arc::new(TapeTransport { tape: Vec::new() }),
        Some(Box::new(ScriptedLive::new(Vec::new()))),
    )
    .await
    .unwrap();

    assert!(engine.trading_enabled());
    let status = engine.backfill_status_payload().await;
    assert_eq!(status["status"], "skipped");
    assert_eq!(engine.metrics_precision().await, "PRECISE");

    engine.shutdown().await;
}
