//! Read-only HTTP surface.
//!
//! Thin wrappers over engine snapshots; every handler takes one consistent
//! read of the accumulator state and never mutates anything.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

use crate::accumulator::VwapMode;
use crate::engine::ContextEngine;

#[derive(Debug, Deserialize)]
pub struct ContextQuery {
    vwap_mode: Option<String>,
}

/// Build the API router over a running engine.
pub fn router(engine: Arc<ContextEngine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/context", get(context))
        .route("/backfill/status", get(backfill_status))
        .route("/debug/vwap", get(debug_vwap))
        .route("/debug/poc", get(debug_poc))
        .route("/debug/trades", get(debug_trades))
        .route("/debug/exchangeinfo", get(debug_exchange_info))
        .route("/metrics", get(metrics))
        .with_state(engine)
}

async fn health(State(engine): State<Arc<ContextEngine>>) -> Json<serde_json::Value> {
    Json(engine.health_payload().await)
}

async fn ready(State(engine): State<Arc<ContextEngine>>) -> Json<serde_json::Value> {
    Json(engine.ready_payload().await)
}

async fn context(
    State(engine): State<Arc<ContextEngine>>,
    Query(query): Query<ContextQuery>,
) -> Json<serde_json::Value> {
    let mode = VwapMode::parse(query.vwap_mode.as_deref());
    Json(engine.context_payload(mode).await)
}

async fn backfill_status(State(engine): State<Arc<ContextEngine>>) -> Json<serde_json::Value> {
    Json(engine.backfill_status_payload().await)
}

async fn debug_vwap(State(engine): State<Arc<ContextEngine>>) -> Json<serde_json::Value> {
    Json(engine.debug_vwap_payload().await)
}

async fn debug_poc(State(engine): State<Arc<ContextEngine>>) -> Json<serde_json::Value> {
    Json(engine.debug_poc_payload().await)
}

async fn debug_trades(State(engine): State<Arc<ContextEngine>>) -> Json<serde_json::Value> {
    Json(engine.debug_trades_payload().await)
}

async fn debug_exchange_info(State(engine): State<Arc<ContextEngine>>) -> Json<serde_json::Value> {
    Json(engine.debug_exchange_info_payload().await)
}

async fn metrics(State(engine): State<Arc<ContextEngine>>) -> String {
    engine.metrics_text()
}
