mod bootstrap;
mod conversation;
mod health;
mod ingress;

use std::time::Duration;

use anyhow::Result;
use axum::Router;
use outreach_core::config::{AppConfig, LoadOptions};
use outreach_db::ScheduledActionRepository;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::bootstrap::Application;
use crate::health::HealthState;

fn init_logging(config: &AppConfig) {
    use outreach_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let builder = tracing_subscriber::fmt().with_target(false).with_env_filter(filter);

    match config.logging.format {
        Compact => builder.compact().init(),
        Pretty => builder.pretty().init(),
        Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Config first so logging honours the configured level and format.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let pending = app.store.list_pending(None).await?;
    tracing::info!(
        event_name = "system.server.pending_actions",
        correlation_id = "bootstrap",
        pending_actions = pending.len(),
        "scheduled actions waiting in store"
    );
    app.poller.start()?;

    let http_shutdown = CancellationToken::new();
    let http = spawn_http(&app, http_shutdown.clone()).await?;

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        worker_id = %app.poller.worker_id(),
        "outreach-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "outreach-server stopping"
    );

    shutdown(app, http_shutdown, http).await;
    Ok(())
}

fn http_router(app: &Application) -> Router {
    health::router(HealthState::new(app.db_pool.clone(), app.poller.clone()))
        .merge(ingress::router(app.buffer.clone()))
}

async fn spawn_http(
    app: &Application,
    shutdown: CancellationToken,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let server = &app.config.server;
    let address = format!("{}:{}", server.bind_address, server.health_check_port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    let router = http_router(app);

    tracing::info!(
        event_name = "system.http.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "http endpoints listening"
    );

    Ok(tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(error) = served {
            tracing::error!(
                event_name = "system.http.error",
                correlation_id = "shutdown",
                error = %error,
                "http server terminated unexpectedly"
            );
        }
    }))
}

async fn shutdown(
    app: Application,
    http_shutdown: CancellationToken,
    http: tokio::task::JoinHandle<()>,
) {
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);

    http_shutdown.cancel();
    if tokio::time::timeout(grace, http).await.is_err() {
        tracing::warn!(
            event_name = "system.http.shutdown_timeout",
            correlation_id = "shutdown",
            "http connections still open after grace period"
        );
    }

    if tokio::time::timeout(grace, app.buffer.shutdown()).await.is_err() {
        tracing::warn!(
            event_name = "system.server.buffer_flush_timeout",
            correlation_id = "shutdown",
            pending_keys = app.buffer.pending_keys().len(),
            "conversation flushes still running after grace period"
        );
    }

    let drained = app.poller.stop().await;
    app.db_pool.close().await;

    tracing::info!(
        event_name = "system.server.stopped",
        correlation_id = "shutdown",
        poller_drained = drained,
        "outreach-server stopped"
    );
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
