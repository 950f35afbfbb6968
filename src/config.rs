//! Runtime configuration sourced from environment variables.
//!
//! Every knob has a default that works against Binance USD-M perpetual
//! futures in public (unauthenticated) mode.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Which live transport feeds the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceKind {
    /// Poll the aggregated-trades REST endpoint.
    LiveRest,
    /// Aggregated-trades websocket stream.
    LiveStream,
    /// External connector subprocess speaking JSON lines over a pipe.
    LiveConnector,
    /// Connector subprocess that already replays history; backfill is skipped.
    SkipBackfillConnector,
}

impl DataSourceKind {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live_rest" => Some(DataSourceKind::LiveRest),
            "live_stream" => Some(DataSourceKind::LiveStream),
            "live_connector" => Some(DataSourceKind::LiveConnector),
            "skip_backfill_connector" => Some(DataSourceKind::SkipBackfillConnector),
            _ => None,
        }
    }

    /// Sources that carry their own history and must not be backfilled over.
    pub fn skips_backfill(self) -> bool {
        matches!(self, DataSourceKind::SkipBackfillConnector)
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    // === Instrument ===
    /// Symbol to track, e.g. BTCUSDT.
    pub symbol: String,
    /// Live transport selection.
    pub data_source: DataSourceKind,

    // === Backfill ===
    /// Master switch for the historical backfill.
    pub backfill_enabled: bool,
    /// Reject live trades after backfill (reconciliation/verification mode).
    pub disable_live_data: bool,
    /// Single 1-hour authenticated probe instead of a day backfill.
    pub backfill_test_mode: bool,
    /// Backfill window chunk length in minutes.
    pub chunk_minutes: i64,
    /// Override the per-mode concurrent chunk worker count.
    pub max_concurrent_chunks: Option<usize>,

    // === Cache ===
    pub cache_enabled: bool,
    /// Directory for per-day raw trade cache files.
    pub cache_dir: String,
    /// Directory for rolled daily volume-profile files.
    pub history_dir: String,
    /// Days of raw trade cache to retain.
    pub cache_keep_days: u32,
    /// Load previous-day levels on startup when available.
    pub bootstrap_prev_day: bool,
    /// Fetch the previous day over REST when no history file exists.
    pub fetch_missing_history: bool,

    // === Profile ===
    /// Fallback tick size when exchange metadata is unavailable.
    pub profile_tick_size: Decimal,
    /// Resolve the tick from the exchange at startup; the fallback tick is
    /// used directly when off.
    pub fetch_exchange_info: bool,

    // === Retry / circuit breaker ===
    pub max_retries: u32,
    /// Base retry delay in seconds; doubles per attempt with ±20 % jitter.
    pub retry_base_secs: f64,
    /// Consecutive rate-limit errors before the breaker opens.
    pub rate_limit_threshold: u32,
    /// Breaker cooldown once open, in seconds.
    pub cooldown_seconds: u64,
    /// Base inter-request delay in public mode, in milliseconds.
    pub public_delay_ms: u64,

    // === Exchange endpoints / credentials ===
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub rest_base_url: String,
    pub ws_base_url: String,
    /// Per-request HTTP timeout in seconds.
    pub api_timeout_secs: u64,
    /// Command line for the connector subprocess transports.
    pub connector_command: Option<String>,

    // === Process ===
    /// Read-only API listen port.
    pub api_port: u16,
    /// Live event queue capacity.
    pub max_queue: usize,
    /// Default log directive when RUST_LOG is unset.
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            data_source: DataSourceKind::LiveStream,

            backfill_enabled: true,
            disable_live_data: false,
            backfill_test_mode: false,
            chunk_minutes: 10,
            max_concurrent_chunks: None,

            cache_enabled: true,
            cache_dir: "./data/backfill".to_string(),
            history_dir: "./data/history".to_string(),
            cache_keep_days: 5,
            bootstrap_prev_day: true,
            fetch_missing_history: false,

            profile_tick_size: dec!(0.1),
            fetch_exchange_info: true,

            max_retries: 5,
            retry_base_secs: 0.5,
            rate_limit_threshold: 3,
            cooldown_seconds: 60,
            public_delay_ms: 100,

            api_key: None,
            api_secret: None,
            rest_base_url: "https://fapi.binance.com".to_string(),
            ws_base_url: "wss://fstream.binance.com/ws".to_string(),
            api_timeout_secs: 30,
            connector_command: None,

            api_port: 8000,
            max_queue: 5000,
            log_level: "info".to_string(),
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl Settings {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("SYMBOL") {
            if !v.trim().is_empty() {
                config.symbol = v.trim().to_uppercase();
            }
        }
        if let Ok(v) = std::env::var("DATA_SOURCE") {
            if let Some(kind) = DataSourceKind::parse(&v) {
                config.data_source = kind;
            }
        }

        if let Some(b) = env_bool("CONTEXT_BACKFILL_ENABLED") {
            config.backfill_enabled = b;
        }
        if let Some(b) = env_bool("CONTEXT_DISABLE_LIVE_DATA") {
            config.disable_live_data = b;
        }
        if let Some(b) = env_bool("CONTEXT_BACKFILL_TEST_MODE") {
            config.backfill_test_mode = b;
        }
        if let Ok(v) = std::env::var("BACKFILL_CHUNK_MINUTES") {
            if let Ok(n) = v.parse() {
                config.chunk_minutes = n;
            }
        }
        if let Ok(v) = std::env::var("BACKFILL_MAX_CONCURRENT_CHUNKS") {
            if let Ok(n) = v.parse() {
                config.max_concurrent_chunks = Some(n);
            }
        }

        if let Some(b) = env_bool("BACKFILL_CACHE_ENABLED") {
            config.cache_enabled = b;
        }
        if let Ok(v) = std::env::var("BACKFILL_CACHE_DIR") {
            config.cache_dir = v;
        }
        if let Ok(v) = std::env::var("CONTEXT_HISTORY_DIR") {
            config.history_dir = v;
        }
        if let Ok(v) = std::env::var("CACHE_KEEP_DAYS") {
            if let Ok(n) = v.parse() {
                config.cache_keep_days = n;
            }
        }
        if let Some(b) = env_bool("CONTEXT_BOOTSTRAP_PREV_DAY") {
            config.bootstrap_prev_day = b;
        }
        if let Some(b) = env_bool("CONTEXT_FETCH_MISSING_HISTORY") {
            config.fetch_missing_history = b;
        }

        if let Ok(v) = std::env::var("PROFILE_TICK_SIZE") {
            if let Ok(d) = v.parse() {
                config.profile_tick_size = d;
            }
        }
        if let Some(b) = env_bool("CONTEXT_FETCH_EXCHANGE_INFO") {
            config.fetch_exchange_info = b;
        }

        if let Ok(v) = std::env::var("BACKFILL_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                config.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("BACKFILL_RETRY_BASE") {
            if let Ok(f) = v.parse() {
                config.retry_base_secs = f;
            }
        }
        if let Ok(v) = std::env::var("BACKFILL_RATE_LIMIT_THRESHOLD") {
            if let Ok(n) = v.parse() {
                config.rate_limit_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("BACKFILL_COOLDOWN_SECONDS") {
            if let Ok(n) = v.parse() {
                config.cooldown_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("BACKFILL_PUBLIC_DELAY_MS") {
            if let Ok(n) = v.parse() {
                config.public_delay_ms = n;
            }
        }

        if let Ok(v) = std::env::var("BINANCE_API_KEY") {
            if !v.is_empty() {
                config.api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("BINANCE_API_SECRET") {
            if !v.is_empty() {
                config.api_secret = Some(v);
            }
        }
        if let Ok(v) = std::env::var("BINANCE_REST_BASE_URL") {
            config.rest_base_url = v;
        }
        if let Ok(v) = std::env::var("BINANCE_WS_BASE_URL") {
            config.ws_base_url = v;
        }
        if let Ok(v) = std::env::var("BINANCE_API_TIMEOUT") {
            if let Ok(n) = v.parse() {
                config.api_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("CONNECTOR_COMMAND") {
            if !v.trim().is_empty() {
                config.connector_command = Some(v);
            }
        }

        if let Ok(v) = std::env::var("API_PORT") {
            if let Ok(n) = v.parse() {
                config.api_port = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_QUEUE") {
            if let Ok(n) = v.parse() {
                config.max_queue = n;
            }
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            config.log_level = v.to_lowercase();
        }

        config
    }

    pub fn symbol_lower(&self) -> String {
        self.symbol.to_lowercase()
    }

    /// Credentials present and not yet downgraded.
    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some()
    }

    /// Worker count for the chunked backfill, per mode unless overridden.
    pub fn chunk_concurrency(&self, authenticated: bool) -> usize {
        if let Some(n) = self.max_concurrent_chunks {
            return n.max(1);
        }
        if self.backfill_test_mode {
            1
        } else if authenticated {
            8
        } else {
            4
        }
    }

    /// Base inter-request delay for the current mode, in milliseconds.
    pub fn request_delay_ms(&self, authenticated: bool) -> u64 {
        if authenticated || self.backfill_test_mode {
            0
        } else {
            self.public_delay_ms
        }
    }

    /// Websocket URL for the aggregated-trades stream.
    pub fn trades_ws_url(&self) -> String {
        format!(
            "{}/{}@aggTrade",
            self.ws_base_url.trim_end_matches('/'),
            self.symbol_lower()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_public_mode() {
        let s = Settings::default();
        assert!(!s.has_credentials());
        assert_eq!(s.chunk_concurrency(false), 4);
        assert_eq!(s.chunk_concurrency(true), 8);
        assert_eq!(s.request_delay_ms(false), 100);
        assert_eq!(s.request_delay_ms(true), 0);
    }

    #[test]
    fn test_mode_forces_serial() {
        let s = Settings {
            backfill_test_mode: true,
            ..Settings::default()
        };
        assert_eq!(s.chunk_concurrency(true), 1);
        assert_eq!(s.request_delay_ms(false), 0);
    }

    #[test]
    fn concurrency_override_wins() {
        let s = Settings {
            max_concurrent_chunks: Some(12),
            ..Settings::default()
        };
        assert_eq!(s.chunk_concurrency(false), 12);
    }

    #[test]
    fn ws_url_uses_lowercase_symbol() {
        let s = Settings::default();
        assert_eq!(
            s.trades_ws_url(),
            "wss://fstream.binance.com/ws/btcusdt@aggTrade"
        );
    }
}
