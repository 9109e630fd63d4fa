//! harman-daemon entry point.
//!
//! This file is intentionally thin: tracing, config, database, runtime,
//! HTTP server. The process exits nonzero when the database is unreachable
//! or the configuration is invalid; adapter trouble never kills it.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use harman_daemon::{quotes::QuoteStore, routes, state::AppState};
use harman_exchange::MockExchange;
use tokio::sync::watch;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let loaded = match config_paths_from_env() {
        Some(paths) => {
            let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
            harman_config::load_layered_yaml(&refs).context("load config failed")?
        }
        None => harman_config::LoadedConfig::empty(),
    };
    let config = harman_config::HarmanConfig::from_loaded(&loaded)
        .context("configuration invalid")?;
    info!(config_hash = %loaded.config_hash, "configuration loaded");

    // Database unavailable at startup is fatal (nonzero exit).
    let pool = harman_db::connect_from_env().await?;
    harman_db::migrate(&pool).await?;

    // The production exchange client lives outside this repository and is
    // injected at deploy time; the built-in adapter is the deterministic
    // paper exchange.
    let adapter = Arc::new(MockExchange::new());
    let quotes = Arc::new(QuoteStore::new());
    let shared = Arc::new(AppState::new(
        pool.clone(),
        adapter.clone(),
        quotes,
        config.clone(),
    ));

    // Background machinery: sweeper workers + reconcile loop.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runtime = harman_runtime::Runtime::new(
        pool.clone(),
        adapter.clone(),
        shared.runtime_config(),
    );
    let mut runtime_task = tokio::spawn(async move { runtime.run(shutdown_rx).await });

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind_addr {}", config.bind_addr))?;
    info!("harman-daemon listening on http://{}", addr);

    let server = axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal());

    // A runtime failure (store unavailable, fatal reconcile disagreement)
    // must take the whole process down nonzero; adapter trouble never
    // reaches this point.
    tokio::select! {
        result = server => result.context("server crashed")?,
        result = &mut runtime_task => {
            result.context("runtime task panicked")??;
            anyhow::bail!("runtime exited unexpectedly");
        }
    }

    // Stop the background loops, then sweep everything to a safe state.
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = runtime_task.await;

    harman_runtime::graceful_shutdown(
        &pool,
        adapter,
        &shared.runtime_config(),
        Duration::from_secs(10),
    )
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// `HARMAN_CONFIG=base.yaml,prod.yaml` — later files override earlier.
fn config_paths_from_env() -> Option<Vec<String>> {
    let raw = std::env::var("HARMAN_CONFIG").ok()?;
    let paths: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if paths.is_empty() {
        None
    } else {
        Some(paths)
    }
}

/// CORS: allow only localhost origins (the operator dashboard).
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
