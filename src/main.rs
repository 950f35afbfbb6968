//! Context engine binary.
//!
//! Starts the engine (non-blocking; the backfill runs behind it) and serves
//! the read-only API until ctrl-c.

use std::net::SocketAddr;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use context_engine::config::Settings;
use context_engine::engine::ContextEngine;
use context_engine::http;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env();

    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    info!(
        symbol = %settings.symbol,
        data_source = ?settings.data_source,
        backfill_enabled = settings.backfill_enabled,
        cache_enabled = settings.cache_enabled,
        "context engine starting"
    );

    let engine = ContextEngine::start(settings.clone()).await?;

    let app = http::router(engine.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.api_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "read API listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "api server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, shutting down");

    engine.shutdown().await;
    server.abort();

    Ok(())
}
