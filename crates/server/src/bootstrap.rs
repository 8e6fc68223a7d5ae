use std::sync::Arc;

use outreach_core::config::{AppConfig, ConfigError, LoadOptions};
use outreach_db::{
    connect_with_settings, migrations, DbPool, ScheduledActionRepository,
    SqlScheduledActionRepository,
};
use outreach_runtime::{ActionPoller, BufferSettings, MessageBuffer, PollerSettings};
use thiserror::Error;
use tracing::info;

use crate::conversation::{ChannelDispatcher, FollowUpPlanner, LoggingOutboundChannel};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub store: Arc<dyn ScheduledActionRepository>,
    pub buffer: MessageBuffer,
    pub poller: Arc<ActionPoller>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

/// Connects, migrates and wires the buffer and poller. Nothing is started.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let store: Arc<dyn ScheduledActionRepository> = Arc::new(
        SqlScheduledActionRepository::with_claim_lease(db_pool.clone(), config.poller.claim_lease()),
    );

    let planner = FollowUpPlanner::new(store.clone(), &config.follow_up);
    let buffer = MessageBuffer::new(BufferSettings::from(&config.buffer), Arc::new(planner));

    let dispatcher = ChannelDispatcher::new(Arc::new(LoggingOutboundChannel));
    let poller = Arc::new(ActionPoller::new(
        store.clone(),
        Arc::new(dispatcher),
        PollerSettings::from_config(&config.poller),
    ));

    info!(
        event_name = "system.bootstrap.wired",
        correlation_id = "bootstrap",
        worker_id = %poller.worker_id(),
        "message buffer and action poller constructed"
    );

    Ok(Application { config, db_pool, store, buffer, poller })
}
