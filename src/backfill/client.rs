//! REST transport for historical trades.
//!
//! [`BinanceRestClient`] owns the HTTP session and request signing;
//! [`ResilientApi`] wraps any raw transport with the retry, pacing, and
//! circuit-breaker policy. Only the wrapper is visible to the fetcher, so
//! tests drive the full policy against a scripted transport.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde_json::Value;
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::backfill::circuit::CircuitBreaker;
use crate::config::Settings;
use crate::error::{EngineError, Result};
use crate::metrics::EngineMetrics;
use crate::models::Trade;
use crate::parser;

type HmacSha256 = Hmac<Sha256>;

/// Abstract trade endpoint consumed by the fetcher and the REST poller.
#[async_trait]
pub trait TradeApi: Send + Sync {
    /// Fetch aggregated trades in `[start_ms, end_ms)`, at most `limit` rows,
    /// ordered by timestamp ascending.
    async fn fetch_agg_trades(&self, start_ms: i64, end_ms: i64, limit: usize)
        -> Result<Vec<Trade>>;

    /// Whether requests currently go out authenticated.
    fn is_authenticated(&self) -> bool;
}

/// One-shot transport underneath the retry policy.
#[async_trait]
pub trait RawTradeApi: Send + Sync {
    async fn send(&self, start_ms: i64, end_ms: i64, limit: usize) -> Result<Vec<Trade>>;
    fn is_authenticated(&self) -> bool;
    /// Drop credentials for the rest of the process.
    fn downgrade_to_public(&self, reason: &str);
}

/// Sign `query` with the API secret; returns the hex signature.
pub fn sign_query(secret: &str, query: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Exponential backoff delay with ±20 % jitter.
pub fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let exp = base.mul_f64(2f64.powi(attempt.min(16) as i32));
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    exp.mul_f64(factor)
}

/// Binance aggregated-trades HTTP transport.
pub struct BinanceRestClient {
    http: reqwest::Client,
    base_url: String,
    symbol: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    authenticated: AtomicBool,
    /// Log full request parameters and the signature prefix (test mode).
    verbose: bool,
}

impl BinanceRestClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.api_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: settings.rest_base_url.trim_end_matches('/').to_string(),
            symbol: settings.symbol.clone(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            authenticated: AtomicBool::new(settings.has_credentials()),
            verbose: settings.backfill_test_mode,
        })
    }
}

#[async_trait]
impl RawTradeApi for BinanceRestClient {
    async fn send(&self, start_ms: i64, end_ms: i64, limit: usize) -> Result<Vec<Trade>> {
        let mut query = format!(
            "endTime={end_ms}&limit={limit}&startTime={start_ms}&symbol={}",
            self.symbol
        );
        let mut api_key = None;

        if self.is_authenticated() {
            // Signed variant: parameters sorted, timestamp + recvWindow
            // appended before signing, key in a header.
            let ts = chrono::Utc::now().timestamp_millis();
            query = format!("{query}&recvWindow=5000&timestamp={ts}");
            let mut sorted: Vec<&str> = query.split('&').collect();
            sorted.sort_unstable();
            let canonical = sorted.join("&");
            let signature = sign_query(self.api_secret.as_deref().unwrap_or(""), &canonical);
            if self.verbose {
                info!(
                    params = %canonical,
                    signature_prefix = &signature[..8.min(signature.len())],
                    "test mode request"
                );
            }
            query = format!("{canonical}&signature={signature}");
            api_key = self.api_key.clone();
        } else if self.verbose {
            info!(params = %query, "test mode request (public)");
        }

        let url = format!("{}/fapi/v1/aggTrades?{query}", self.base_url);
        let mut request = self.http.get(&url);
        if let Some(key) = api_key {
            request = request.header("X-MBX-APIKEY", key);
        }
        let response = request.send().await?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::from_status(status, &body));
        }

        let payload: Value = response.json().await?;
        let rows = payload
            .as_array()
            .ok_or_else(|| EngineError::Parse("aggTrades response is not an array".into()))?;

        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            match parser::parse_agg_trade(row) {
                Ok(trade) => trades.push(trade),
                // A single malformed record never fails the batch.
                Err(e) => debug!(error = %e, "skipping unparseable trade"),
            }
        }
        Ok(trades)
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn downgrade_to_public(&self, reason: &str) {
        if self.authenticated.swap(false, Ordering::SeqCst) {
            warn!(reason, "downgrading exchange client to public mode");
        }
    }
}

/// Retry, pacing, and circuit-breaker policy over a raw transport.
pub struct ResilientApi {
    raw: Arc<dyn RawTradeApi>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<EngineMetrics>,
    max_retries: u32,
    retry_base: Duration,
    public_delay: Duration,
}

impl ResilientApi {
    pub fn new(
        raw: Arc<dyn RawTradeApi>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<EngineMetrics>,
        settings: &Settings,
    ) -> Self {
        Self {
            raw,
            breaker,
            metrics,
            max_retries: settings.max_retries,
            retry_base: Duration::from_secs_f64(settings.retry_base_secs.max(0.01)),
            public_delay: Duration::from_millis(settings.public_delay_ms),
        }
    }

    fn pacing_base(&self) -> Duration {
        if self.raw.is_authenticated() {
            Duration::ZERO
        } else {
            self.public_delay
        }
    }
}

#[async_trait]
impl TradeApi for ResilientApi {
    async fn fetch_agg_trades(
        &self,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<Trade>> {
        let mut attempt: u32 = 0;
        loop {
            self.breaker.acquire().await;
            let pacing = self.breaker.throttle_delay(self.pacing_base());
            if !pacing.is_zero() {
                sleep(pacing).await;
            }

            match self.raw.send(start_ms, end_ms, limit).await {
                Ok(trades) => {
                    self.breaker.on_success();
                    return Ok(trades);
                }
                Err(EngineError::RateLimited { status }) => {
                    self.metrics.rate_limit_hits.inc();
                    let opened = self.breaker.on_rate_limit(status);
                    if opened && self.raw.is_authenticated() {
                        self.raw.downgrade_to_public("rate limit threshold reached");
                    }
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(EngineError::RateLimited { status });
                    }
                    // The breaker's cooldown gates the next iteration.
                }
                Err(EngineError::AuthFailure(msg)) if self.raw.is_authenticated() => {
                    // One-shot degrade, then re-issue immediately.
                    self.raw.downgrade_to_public(&msg);
                }
                Err(EngineError::Transient(msg)) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(EngineError::Transient(format!("retries exhausted: {msg}")));
                    }
                    let delay = backoff_with_jitter(self.retry_base, attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "transient error, backing off"
                    );
                    sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn is_authenticated(&self) -> bool {
        self.raw.is_authenticated()
    }
}
