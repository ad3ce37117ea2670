//! llm-relay — reverse proxy core that multiplexes a pool of upstream
//! LLM API credentials across concurrent clients.
//!
//! Boots a Tokio runtime, wires the Key Pool, Request Queue, Mutator
//! pipeline and SSE Aggregator together as explicit dependencies, and
//! exposes them over HTTP via a thin `axum` router. The core
//! subsystems never depend on `axum` types directly.

mod config;
mod decompress;
mod error;
mod family;
mod http;
mod keypool;
mod mutate;
mod promptlog;
mod queue;
mod secret;
mod sse;
mod telemetry;
mod tokenize;
mod userstore;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use promptlog::NoopPromptLogSink;
use tokenize::ApproximateTokenizer;
use userstore::NoopFlush;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();

    info!("llm-relay v{}", env!("CARGO_PKG_VERSION"));

    let settings = config::Settings::load().context("failed to load configuration")?;

    let keys: Vec<keypool::Key> = settings
        .keys
        .clone()
        .into_iter()
        .map(config::KeyConfig::into_key)
        .collect();
    info!(count = keys.len(), "key pool loaded");

    let pool = Arc::new(keypool::Pool::new(keys));
    let queue = queue::RequestQueue::with_heartbeat(
        Arc::clone(&pool),
        Duration::from_millis(settings.heartbeat_threshold_ms),
        Duration::from_millis(settings.heartbeat_interval_ms),
    );
    let users = Arc::new(userstore::UserStore::new(
        Box::new(NoopFlush),
        settings.token_quota_limits(),
    ));

    if settings.key_health_sweep {
        let sweep_pool = Arc::clone(&pool);
        tokio::spawn(keypool::probe::run_sweep(sweep_pool, Duration::from_secs(3600)));
    }

    let quota_users = Arc::clone(&users);
    let quota_refresh_period = Duration::from_secs(settings.quota_refresh_period_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(quota_refresh_period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            quota_users.refresh_all_quotas().await;
        }
    });

    // Temporary-user expiry runs on its own minute-level cadence (§5's
    // `* * * * *` cron), independent of the quota-refresh schedule
    // above, which is hourly/daily.
    let sweep_users = Arc::clone(&users);
    let temp_user_sweep_interval = Duration::from_secs(settings.temp_user_sweep_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(temp_user_sweep_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep_users.expire_temporary_users().await;
        }
    });

    let flush_users = Arc::clone(&users);
    let flush_interval = Duration::from_secs(settings.user_store_flush_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = flush_users.flush().await {
                warn!(error = %e, "user store flush failed");
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let dispatch_queue = Arc::clone(&queue);
    let dispatch_handle = tokio::spawn(dispatch_queue.run_dispatch_loop(shutdown_rx));

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_millis(settings.upstream_timeout_ms))
        .build()
        .context("failed to build upstream HTTP client")?;

    let bind_addr = settings.bind_addr.clone();
    let state = Arc::new(http::AppState {
        pool,
        queue,
        users,
        tokenizer: Arc::new(ApproximateTokenizer),
        prompt_log: Arc::new(NoopPromptLogSink),
        pipeline: mutate::default_pipeline(),
        http_client,
        settings,
    });

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    info!(addr = %bind_addr, "llm-relay listening");

    let serve_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    let _ = shutdown_tx.send(()).await;
    let _ = dispatch_handle.await;

    serve_result.context("server error")
}
