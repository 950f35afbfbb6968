//! Rate-limit circuit breaker shared by all backfill chunk workers.
//!
//! One breaker per exchange client. All state transitions happen under a
//! single mutex that is never held across an await; waiting out a cooldown
//! happens outside the lock.

use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

const THROTTLE_MAX: f64 = 5.0;
const THROTTLE_GROWTH: f64 = 1.5;
const THROTTLE_DECAY: f64 = 0.95;

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_rate_errors: u32,
    cooldown_until: Option<Instant>,
    throttle_multiplier: f64,
    concurrency: usize,
}

/// Circuit breaker with adaptive throttle and concurrency.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    threshold: u32,
    cooldown: Duration,
    base_concurrency: usize,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration, base_concurrency: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_rate_errors: 0,
                cooldown_until: None,
                throttle_multiplier: 1.0,
                concurrency: base_concurrency.max(1),
            }),
            threshold: threshold.max(1),
            cooldown,
            base_concurrency: base_concurrency.max(1),
        }
    }

    /// Wait until the breaker admits traffic. While OPEN this sleeps out the
    /// cooldown, then transitions to HALF_OPEN.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut inner = self.inner.lock().unwrap();
                match inner.state {
                    BreakerState::Open => {
                        let now = Instant::now();
                        match inner.cooldown_until {
                            Some(until) if until > now => Some(until - now),
                            _ => {
                                inner.state = BreakerState::HalfOpen;
                                info!("circuit breaker half-open, probing");
                                None
                            }
                        }
                    }
                    _ => None,
                }
            };
            match wait {
                Some(duration) => sleep(duration).await,
                None => return,
            }
        }
    }

    /// Pre-request pacing delay: `base * throttle_multiplier`.
    pub fn throttle_delay(&self, base: Duration) -> Duration {
        let multiplier = self.inner.lock().unwrap().throttle_multiplier;
        base.mul_f64(multiplier)
    }

    /// Record a successful request.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::HalfOpen {
            info!("circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_rate_errors = 0;
        inner.cooldown_until = None;
        inner.throttle_multiplier = (inner.throttle_multiplier * THROTTLE_DECAY).max(1.0);
    }

    /// Record a rate-limit response (418/429/451).
    ///
    /// Returns `true` when this error tripped the breaker open, so the caller
    /// can downgrade an authenticated client exactly once.
    pub fn on_rate_limit(&self, status: u16) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_rate_errors += 1;
        inner.throttle_multiplier = (inner.throttle_multiplier * THROTTLE_GROWTH).min(THROTTLE_MAX);
        inner.concurrency = (inner.concurrency / 2).max(1);

        let should_open = inner.consecutive_rate_errors >= self.threshold
            || inner.state == BreakerState::HalfOpen;
        let was_open = inner.state == BreakerState::Open;
        if should_open {
            inner.state = BreakerState::Open;
            inner.cooldown_until = Some(Instant::now() + self.cooldown);
        }
        warn!(
            status,
            consecutive = inner.consecutive_rate_errors,
            throttle = inner.throttle_multiplier,
            concurrency = inner.concurrency,
            open = should_open,
            "rate limit recorded"
        );
        should_open && !was_open
    }

    /// Current admitted worker count.
    pub fn concurrency(&self) -> usize {
        self.inner.lock().unwrap().concurrency
    }

    /// Reset concurrency to the configured base (new backfill run).
    pub fn reset_concurrency(&self) {
        self.inner.lock().unwrap().concurrency = self.base_concurrency;
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn snapshot(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        json!({
            "state": match inner.state {
                BreakerState::Closed => "closed",
                BreakerState::Open => "open",
                BreakerState::HalfOpen => "half_open",
            },
            "consecutive_rate_errors": inner.consecutive_rate_errors,
            "throttle_multiplier": inner.throttle_multiplier,
            "concurrency": inner.concurrency,
        })
    }
}
