//! Wire-format parsing for exchange payloads.
//!
//! The REST aggregated-trades endpoint and the websocket stream share one
//! payload shape (`p`/`q`/`T`/`m`/`a`), so live and historical paths parse
//! through the same function and cannot diverge.

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

use crate::error::{EngineError, Result};
use crate::models::{DepthUpdate, Trade, TradeId, TradeSide};

fn decimal_field(value: &Value, key: &str) -> Result<Decimal> {
    let raw = value
        .get(key)
        .ok_or_else(|| EngineError::Parse(format!("missing field {key}")))?;
    match raw {
        Value::String(s) => {
            Decimal::from_str(s).map_err(|e| EngineError::Parse(format!("bad {key}: {e}")))
        }
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .map_err(|e| EngineError::Parse(format!("bad {key}: {e}"))),
        _ => Err(EngineError::Parse(format!("unexpected type for {key}"))),
    }
}

/// Normalize a Binance aggTrade/trade payload into a [`Trade`].
///
/// `m == true` means the buyer was the maker, i.e. the aggressor sold.
pub fn parse_agg_trade(value: &Value) -> Result<Trade> {
    let price = decimal_field(value, "p")?;
    let qty = decimal_field(value, "q")?;

    let ts_ms = value
        .get("T")
        .and_then(Value::as_i64)
        .or_else(|| value.get("E").and_then(Value::as_i64))
        .ok_or_else(|| EngineError::Parse("trade payload missing timestamp".into()))?;

    let is_buyer_maker = value.get("m").and_then(Value::as_bool).unwrap_or(false);
    let side = if is_buyer_maker {
        TradeSide::Sell
    } else {
        TradeSide::Buy
    };

    let id = match value.get("a").or_else(|| value.get("t")) {
        Some(Value::Number(n)) => n
            .as_i64()
            .map(TradeId::Int)
            .ok_or_else(|| EngineError::Parse("non-integer trade id".into()))?,
        Some(Value::String(s)) => TradeId::parse(s),
        _ => return Err(EngineError::Parse("trade payload missing id".into())),
    };

    if price <= Decimal::ZERO || qty <= Decimal::ZERO {
        return Err(EngineError::Parse(format!(
            "non-positive price/qty: p={price} q={qty}"
        )));
    }

    Ok(Trade {
        ts_ms,
        price,
        qty,
        side,
        is_buyer_maker,
        id,
    })
}

/// Parse a connector-pipe trade event:
/// `{"type":"trade","timestamp":ms,"price":..,"qty":..,"side":"buy","is_buyer_maker":..,"id":..}`.
pub fn parse_connector_trade(value: &Value) -> Result<Trade> {
    let ts_ms = value
        .get("timestamp")
        .and_then(Value::as_i64)
        .ok_or_else(|| EngineError::Parse("connector trade missing timestamp".into()))?;
    let price = decimal_field(value, "price")?;
    let qty = decimal_field(value, "qty")?;

    let side: TradeSide = value
        .get("side")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Parse("connector trade missing side".into()))?
        .parse()
        .map_err(EngineError::Parse)?;

    let is_buyer_maker = value
        .get("is_buyer_maker")
        .and_then(Value::as_bool)
        .unwrap_or(side == TradeSide::Sell);

    let id = match value.get("id") {
        Some(Value::Number(n)) => n
            .as_i64()
            .map(TradeId::Int)
            .ok_or_else(|| EngineError::Parse("non-integer trade id".into()))?,
        Some(Value::String(s)) => TradeId::parse(s),
        _ => return Err(EngineError::Parse("connector trade missing id".into())),
    };

    if price <= Decimal::ZERO || qty <= Decimal::ZERO {
        return Err(EngineError::Parse(format!(
            "non-positive price/qty: p={price} q={qty}"
        )));
    }

    Ok(Trade {
        ts_ms,
        price,
        qty,
        side,
        is_buyer_maker,
        id,
    })
}

/// Parse a connector-pipe depth event.
pub fn parse_connector_depth(value: &Value) -> Result<DepthUpdate> {
    let ts_ms = value
        .get("timestamp")
        .and_then(Value::as_i64)
        .ok_or_else(|| EngineError::Parse("connector depth missing timestamp".into()))?;

    let parse_levels = |key: &str| -> Result<Vec<(Decimal, Decimal)>> {
        let arr = value
            .get(key)
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::Parse(format!("connector depth missing {key}")))?;
        arr.iter()
            .map(|level| {
                let pair = level
                    .as_array()
                    .filter(|p| p.len() == 2)
                    .ok_or_else(|| EngineError::Parse("malformed depth level".into()))?;
                let px = Decimal::from_str(&pair[0].to_string().replace('"', ""))
                    .map_err(|e| EngineError::Parse(format!("bad depth price: {e}")))?;
                let qty = Decimal::from_str(&pair[1].to_string().replace('"', ""))
                    .map_err(|e| EngineError::Parse(format!("bad depth qty: {e}")))?;
                Ok((px, qty))
            })
            .collect()
    };

    Ok(DepthUpdate {
        ts_ms,
        bids: parse_levels("bids")?,
        asks: parse_levels("asks")?,
        last_update_id: value
            .get("last_update_id")
            .and_then(Value::as_i64)
            .unwrap_or(0),
    })
}
