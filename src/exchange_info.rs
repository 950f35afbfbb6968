//! One-shot symbol metadata fetch.
//!
//! Resolves the instrument's tick size (plus step size / min qty for
//! diagnostics) from the exchange at startup. On any failure the configured
//! fallback tick is used and the fetch is never retried; the resolved tick
//! is immutable for the process lifetime.

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{EngineError, Result};

/// Symbol filters as reported by the exchange.
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub symbol: String,
    pub tick_size: Option<Decimal>,
    pub step_size: Option<Decimal>,
    pub min_qty: Option<Decimal>,
    pub min_notional: Option<Decimal>,
    /// Raw symbol entry, kept for the debug route.
    pub raw: Value,
}

fn filter_decimal(filters: &[Value], filter_type: &str, key: &str) -> Option<Decimal> {
    filters
        .iter()
        .find(|f| f.get("filterType").and_then(Value::as_str) == Some(filter_type))
        .and_then(|f| f.get(key))
        .and_then(Value::as_str)
        .and_then(|s| Decimal::from_str(s).ok())
}

/// Fetch exchange info for the configured symbol.
pub async fn fetch_symbol_info(settings: &Settings) -> Result<SymbolInfo> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;

    let endpoint = format!(
        "{}/fapi/v1/exchangeInfo",
        settings.rest_base_url.trim_end_matches('/')
    );
    let response = client
        .get(&endpoint)
        .query(&[("symbol", settings.symbol.as_str())])
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(EngineError::Transient(format!(
            "exchangeInfo returned http {}",
            response.status().as_u16()
        )));
    }

    let body: Value = response.json().await?;
    let entry = body
        .get("symbols")
        .and_then(Value::as_array)
        .and_then(|symbols| {
            symbols
                .iter()
                .find(|s| s.get("symbol").and_then(Value::as_str) == Some(settings.symbol.as_str()))
        })
        .cloned()
        .ok_or_else(|| {
            EngineError::Parse(format!("symbol {} missing from exchangeInfo", settings.symbol))
        })?;

    let filters = entry
        .get("filters")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    Ok(SymbolInfo {
        symbol: settings.symbol.clone(),
        tick_size: filter_decimal(&filters, "PRICE_FILTER", "tickSize"),
        step_size: filter_decimal(&filters, "LOT_SIZE", "stepSize"),
        min_qty: filter_decimal(&filters, "LOT_SIZE", "minQty"),
        min_notional: filter_decimal(&filters, "MIN_NOTIONAL", "notional")
            .or_else(|| filter_decimal(&filters, "MIN_NOTIONAL", "minNotional"))
            .or_else(|| filter_decimal(&filters, "NOTIONAL", "notional")),
        raw: entry,
    })
}

/// Resolve the tick size for the process: exchange value when sane,
/// configured fallback otherwise.
pub async fn resolve_tick_size(settings: &Settings) -> (Decimal, Option<SymbolInfo>) {
    match fetch_symbol_info(settings).await {
        Ok(info) => {
            match info.tick_size {
                Some(tick) if tick > Decimal::ZERO => {
                    info!(
                        symbol = %info.symbol,
                        tick_size = %tick,
                        step_size = ?info.step_size.map(|d| d.to_string()),
                        min_qty = ?info.min_qty.map(|d| d.to_string()),
                        "exchange info loaded"
                    );
                    (tick, Some(info))
                }
                other => {
                    warn!(
                        symbol = %settings.symbol,
                        tick_size = ?other.map(|d| d.to_string()),
                        fallback = %settings.profile_tick_size,
                        "exchange tick size unusable, using fallback"
                    );
                    (settings.profile_tick_size, Some(info))
                }
            }
        }
        Err(e) => {
            warn!(
                symbol = %settings.symbol,
                error = %e,
                fallback = %settings.profile_tick_size,
                "exchange info fetch failed, using fallback tick"
            );
            (settings.profile_tick_size, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn extracts_filters_from_symbol_entry() {
        let filters = vec![
            json!({"filterType": "PRICE_FILTER", "tickSize": "0.10", "minPrice": "556.80"}),
            json!({"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"}),
            json!({"filterType": "MIN_NOTIONAL", "notional": "100"}),
        ];
        assert_eq!(
            filter_decimal(&filters, "PRICE_FILTER", "tickSize"),
            Some(dec!(0.10))
        );
        assert_eq!(
            filter_decimal(&filters, "LOT_SIZE", "stepSize"),
            Some(dec!(0.001))
        );
        assert_eq!(
            filter_decimal(&filters, "MIN_NOTIONAL", "notional"),
            Some(dec!(100))
        );
        assert_eq!(filter_decimal(&filters, "PERCENT_PRICE", "multiplierUp"), None);
    }
}
