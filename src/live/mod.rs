//! Live trade ingestion.
//!
//! The engine only knows the [`LiveSource`] trait; the websocket stream, the
//! REST poller, and the subprocess connector are interchangeable transports
//! behind it. [`LiveStreamService`] wraps any source with the shared
//! lifecycle: reconnection with jittered backoff, stale-stream detection,
//! periodic health logging, and origin tagging (`from_backfill = false`).

pub mod binance_ws;
pub mod pipe;
pub mod rest_poll;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::Result;
use crate::models::{DepthUpdate, Trade};

/// Event yielded by a live source.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    Trade(Trade),
    Depth(DepthUpdate),
    /// Connector status line; informational only.
    Status(String),
}

/// A long-lived connection delivering trades in timestamp order.
#[async_trait]
pub trait LiveSource: Send {
    async fn connect(&mut self) -> Result<()>;
    async fn disconnect(&mut self);
    async fn subscribe(&mut self, symbol: &str, channels: &[&str]) -> Result<()>;
    /// Next event, or `None` when nothing arrived within the poll interval.
    async fn next_event(&mut self) -> Result<Option<LiveEvent>>;
    fn is_connected(&self) -> bool;
    fn health(&self) -> Value;
}

/// Reconnection / staleness policy.
#[derive(Debug, Clone)]
pub struct StreamPolicy {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_attempts_per_cycle: u32,
    /// Cooldown after a whole cycle of failed reconnects.
    pub escalation_cooldown: Duration,
    /// Declare the stream dead after this much silence...
    pub stale_after: Duration,
    /// ...but only once this much time has passed since connect.
    pub stale_grace: Duration,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
            max_attempts_per_cycle: 5,
            escalation_cooldown: Duration::from_secs(60),
            stale_after: Duration::from_secs(60),
            stale_grace: Duration::from_secs(30),
        }
    }
}

fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(0.8..=1.2))
}

/// Shared health counters, readable from the HTTP surface.
#[derive(Debug, Default)]
pub struct StreamHealth {
    pub connected: bool,
    pub reconnects: u64,
    pub error_count: u64,
    pub trades_seen: u64,
    pub last_event_unix_ms: Option<i64>,
}

impl StreamHealth {
    pub fn to_json(&self, queue_size: usize) -> Value {
        let since_last = self.last_event_unix_ms.map(|ms| {
            (chrono::Utc::now().timestamp_millis() - ms).max(0) as f64 / 1000.0
        });
        json!({
            "alive": self.connected,
            "queue_size": queue_size,
            "reconnects": self.reconnects,
            "error_count": self.error_count,
            "trades_seen": self.trades_seen,
            "seconds_since_last_event": since_last,
        })
    }
}

/// Drives a [`LiveSource`] and forwards its trades into the engine.
pub struct LiveStreamService {
    source: Box<dyn LiveSource>,
    symbol: String,
    policy: StreamPolicy,
    tx: mpsc::Sender<Trade>,
    health: Arc<RwLock<StreamHealth>>,
}

impl LiveStreamService {
    pub fn new(
        source: Box<dyn LiveSource>,
        symbol: String,
        tx: mpsc::Sender<Trade>,
        health: Arc<RwLock<StreamHealth>>,
    ) -> Self {
        Self {
            source,
            symbol,
            policy: StreamPolicy::default(),
            tx,
            health,
        }
    }

    pub fn with_policy(mut self, policy: StreamPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run until shutdown. Reconnects forever; each failed cycle of
    /// `max_attempts_per_cycle` attempts escalates into a longer cooldown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.connect_cycle(&mut shutdown).await {
                if *shutdown.borrow() {
                    break;
                }
                warn!(
                    symbol = %self.symbol,
                    cooldown_secs = self.policy.escalation_cooldown.as_secs(),
                    "reconnect cycle exhausted, cooling down"
                );
                tokio::select! {
                    _ = sleep(self.policy.escalation_cooldown) => {},
                    _ = shutdown.changed() => break,
                }
                continue;
            }

            self.read_until_failure(&mut shutdown).await;
            self.source.disconnect().await;
            self.health.write().await.connected = false;
        }

        self.source.disconnect().await;
        info!(symbol = %self.symbol, "live stream service stopped");
    }

    /// One cycle of connect attempts with exponential backoff.
    async fn connect_cycle(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut backoff = self.policy.backoff_base;
        for attempt in 1..=self.policy.max_attempts_per_cycle {
            if *shutdown.borrow() {
                return false;
            }
            match self.source.connect().await {
                Ok(()) => match self.source.subscribe(&self.symbol, &["aggTrade"]).await {
                    Ok(()) => {
                        let mut health = self.health.write().await;
                        health.connected = true;
                        if attempt > 1 {
                            health.reconnects += 1;
                        }
                        drop(health);
                        info!(symbol = %self.symbol, attempt, "live source connected");
                        return true;
                    }
                    Err(e) => {
                        warn!(symbol = %self.symbol, attempt, error = %e, "subscribe failed");
                        self.source.disconnect().await;
                    }
                },
                Err(e) => {
                    warn!(symbol = %self.symbol, attempt, error = %e, "connect failed");
                }
            }
            self.health.write().await.error_count += 1;

            let delay = jittered(backoff);
            tokio::select! {
                _ = sleep(delay) => {},
                _ = shutdown.changed() => return false,
            }
            backoff = (backoff * 2).min(self.policy.backoff_cap);
        }
        false
    }

    /// Pump events until the stream errors, goes stale, or shutdown arrives.
    async fn read_until_failure(&mut self, shutdown: &mut watch::Receiver<bool>) {
        // Disjoint field borrows: the select future holds `source` mutably
        // while the branch bodies use the rest.
        let Self {
            source,
            symbol,
            policy,
            tx,
            health,
        } = self;

        let connected_at = Instant::now();
        let mut last_event = Instant::now();
        let mut health_tick = tokio::time::interval(Duration::from_secs(5));
        health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut ticks_since_log = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = health_tick.tick() => {
                    ticks_since_log += 1;
                    if last_event.elapsed() > policy.stale_after
                        && connected_at.elapsed() > policy.stale_grace
                    {
                        warn!(
                            symbol = %symbol,
                            silent_secs = last_event.elapsed().as_secs(),
                            "stream stale, forcing reconnect"
                        );
                        health.write().await.reconnects += 1;
                        return;
                    }
                    if ticks_since_log >= 12 {
                        ticks_since_log = 0;
                        let snapshot = health.read().await;
                        info!(
                            symbol = %symbol,
                            alive = snapshot.connected,
                            errors = snapshot.error_count,
                            trades = snapshot.trades_seen,
                            silent_secs = last_event.elapsed().as_secs(),
                            "live stream health"
                        );
                    }
                }
                event = source.next_event() => {
                    match event {
                        Ok(Some(LiveEvent::Trade(trade))) => {
                            last_event = Instant::now();
                            {
                                let mut snapshot = health.write().await;
                                snapshot.trades_seen += 1;
                                snapshot.last_event_unix_ms = Some(trade.ts_ms);
                            }
                            if tx.send(trade).await.is_err() {
                                warn!(symbol = %symbol, "engine channel closed, stopping stream");
                                return;
                            }
                        }
                        Ok(Some(_)) => {
                            last_event = Instant::now();
                        }
                        Ok(None) => {
                            // Poll timeout; staleness is handled on the tick.
                        }
                        Err(e) => {
                            warn!(symbol = %symbol, error = %e, "stream error, reconnecting");
                            let mut snapshot = health.write().await;
                            snapshot.error_count += 1;
                            snapshot.reconnects += 1;
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TradeId, TradeSide};
    use rust_decimal_macros::dec;

    /// Source that yields a fixed list of trades, then errors once, then
    /// yields nothing.
    struct ScriptedSource {
        trades: Vec<Trade>,
        fail_after: bool,
        connected: bool,
        connects: u32,
    }

    #[async_trait]
    impl LiveSource for ScriptedSource {
        async fn connect(&mut self) -> Result<()> {
            self.connects += 1;
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.connected = false;
        }

        async fn subscribe(&mut self, _symbol: &str, _channels: &[&str]) -> Result<()> {
            Ok(())
        }

        async fn next_event(&mut self) -> Result<Option<LiveEvent>> {
            if let Some(trade) = self.trades.pop() {
                return Ok(Some(LiveEvent::Trade(trade)));
            }
            if self.fail_after {
                self.fail_after = false;
                return Err(crate::error::EngineError::Transient("scripted".into()));
            }
            sleep(Duration::from_millis(10)).await;
            Ok(None)
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn health(&self) -> Value {
            json!({"connected": self.connected})
        }
    }

    fn trade(id: i64) -> Trade {
        Trade {
            ts_ms: 1_700_000_000_000 + id,
            price: dec!(100),
            qty: dec!(1),
            side: TradeSide::Buy,
            is_buyer_maker: false,
            id: TradeId::Int(id),
        }
    }

    #[tokio::test]
    async fn forwards_trades_and_reconnects_after_error() {
        let source = ScriptedSource {
            trades: vec![trade(2), trade(1)],
            fail_after: true,
            connected: false,
            connects: 0,
        };
        let (tx, mut rx) = mpsc::channel(16);
        let health = Arc::new(RwLock::new(StreamHealth::default()));
        let service = LiveStreamService::new(Box::new(source), "BTCUSDT".into(), tx, health.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(service.run(shutdown_rx));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.id, TradeId::Int(1));
        assert_eq!(second.id, TradeId::Int(2));

        // Give the service time to hit the scripted error and reconnect.
        sleep(Duration::from_millis(100)).await;
        assert!(health.read().await.reconnects >= 1);

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
