//! REST polling source.
//!
//! Polls the aggregated-trades endpoint once a second from the last seen
//! timestamp. Slower than the stream but useful where websockets are
//! unavailable; shares the paginated client (and its circuit breaker) with
//! the backfill.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::backfill::TradeApi;
use crate::error::{EngineError, Result};
use crate::live::{LiveEvent, LiveSource};
use crate::models::Trade;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const PAGE_LIMIT: usize = 1000;

/// Trade source backed by periodic REST pagination.
pub struct RestPollSource {
    api: Arc<dyn TradeApi>,
    connected: bool,
    last_ts_ms: i64,
    buffer: VecDeque<Trade>,
    polls: u64,
}

impl RestPollSource {
    pub fn new(api: Arc<dyn TradeApi>) -> Self {
        Self {
            api,
            connected: false,
            last_ts_ms: 0,
            buffer: VecDeque::new(),
            polls: 0,
        }
    }
}

#[async_trait]
impl LiveSource for RestPollSource {
    async fn connect(&mut self) -> Result<()> {
        if self.last_ts_ms == 0 {
            self.last_ts_ms = chrono::Utc::now().timestamp_millis();
        }
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
        if !self.connected {
            return Err(EngineError::Transient("rest poll source not connected".into()));
        }
        if let Some(trade) = self.buffer.pop_front() {
            return Ok(Some(LiveEvent::Trade(trade)));
        }

        sleep(POLL_INTERVAL).await;
        self.polls += 1;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let batch = self
            .api
            .fetch_agg_trades(self.last_ts_ms + 1, now_ms, PAGE_LIMIT)
            .await?;

        for trade in batch {
            self.last_ts_ms = self.last_ts_ms.max(trade.ts_ms);
            self.buffer.push_back(trade);
        }
        Ok(self.buffer.pop_front().map(LiveEvent::Trade))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn health(&self) -> Value {
        json!({
            "transport": "rest_poll",
            "connected": self.connected,
            "polls": self.polls,
            "buffered": self.buffer.len(),
            "last_ts_ms": self.last_ts_ms,
        })
    }
}
