//! Prometheus counters exposed at `/metrics`.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Engine-wide metric handles, registered against one registry.
pub struct EngineMetrics {
    registry: Registry,
    pub trades_ingested: IntCounterVec,
    pub live_trades_rejected: IntCounter,
    pub live_reconnects: IntCounter,
    pub chunks_failed: IntCounter,
    pub rate_limit_hits: IntCounter,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let trades_ingested = IntCounterVec::new(
            Opts::new("context_trades_ingested_total", "Trades ingested by origin"),
            &["origin"],
        )
        .expect("valid metric definition");
        let live_trades_rejected = IntCounter::new(
            "context_live_trades_rejected_total",
            "Live trades rejected by configuration",
        )
        .expect("valid metric definition");
        let live_reconnects = IntCounter::new(
            "context_live_reconnects_total",
            "Live source reconnections",
        )
        .expect("valid metric definition");
        let chunks_failed = IntCounter::new(
            "context_backfill_chunks_failed_total",
            "Backfill chunks skipped after failure",
        )
        .expect("valid metric definition");
        let rate_limit_hits = IntCounter::new(
            "context_rate_limit_hits_total",
            "Rate-limit responses from the exchange",
        )
        .expect("valid metric definition");

        for collector in [
            Box::new(trades_ingested.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(live_trades_rejected.clone()),
            Box::new(live_reconnects.clone()),
            Box::new(chunks_failed.clone()),
            Box::new(rate_limit_hits.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric registration cannot collide");
        }

        Self {
            registry,
            trades_ingested,
            live_trades_rejected,
            live_reconnects,
            chunks_failed,
            rate_limit_hits,
        }
    }

    /// Render the registry in Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_text_format() {
        let metrics = EngineMetrics::new();
        metrics.trades_ingested.with_label_values(&["backfill"]).inc_by(3);
        metrics.rate_limit_hits.inc();
        let text = metrics.encode();
        assert!(text.contains("context_trades_ingested_total"));
        assert!(text.contains("context_rate_limit_hits_total 1"));
    }
}
