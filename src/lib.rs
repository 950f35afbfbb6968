//! Context Engine: intraday market-structure metrics for one perpetual
//! futures symbol.
//!
//! Ingests trades from two reconciled paths (a chunked, rate-limit-aware
//! REST backfill and a live stream) into a single accumulator, and exposes
//! VWAP, volume-profile levels (POC / value area), opening range, and
//! previous-day levels over a read-only HTTP API. Values reconcile exactly
//! with reference chart tools because every path bins prices through the
//! same decimal quantizer.
//!
//! ## Architecture
//!
//! - **Backfill**: cache-aware historical download with a circuit breaker
//!   and bounded chunk concurrency
//! - **Live**: swappable trade sources (websocket / REST poll / connector
//!   pipe) behind one reconnecting stream service
//! - **Accumulator**: single-owner session-day state; all ingress serialized
//! - **Orchestrator**: owns every task, non-blocking startup, bounded
//!   shutdown

pub mod accumulator;
pub mod backfill;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange_info;
pub mod http;
pub mod live;
pub mod metrics;
pub mod models;
pub mod parser;
pub mod profile;
pub mod quantize;

pub use accumulator::{SessionAccumulator, VwapMode};
pub use backfill::{CircuitBreaker, HistoricalFetcher, TradeApi};
pub use cache::{HistoryStore, TradeCache};
pub use config::{DataSourceKind, Settings};
pub use engine::ContextEngine;
pub use error::{EngineError, Result};
pub use models::{BackfillState, Trade, TradeId, TradeSide};
pub use profile::{DayLevels, ValueArea, VolumeProfile};
pub use quantize::quantize;
