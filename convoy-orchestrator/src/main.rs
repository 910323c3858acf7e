//! Convoy Orchestrator
//!
//! Runs the control-plane background loops against PostgreSQL:
//! - Dispatcher: consumes workflow promotion events
//! - Rescan: republishes workflows that still have queued executions
//! - Retention: deletes closed alerts past their retention window
//! - Projection: refreshes pipeline executions that are still in flight

use anyhow::{Context, Result};
use convoy_core::domain::alert::AlertCategory;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use convoy_orchestrator::config::Config;
use convoy_orchestrator::db;
use convoy_orchestrator::executor::PgStateMachineExecutor;
use convoy_orchestrator::lock::PgLock;
use convoy_orchestrator::notification::{NotificationRule, TracingNotificationSender};
use convoy_orchestrator::queue::PgExecutionQueue;
use convoy_orchestrator::repository::{
    PgAlertRepository, PgConnectionResultRepository, PgPipelineRepository,
    PgStateExecutionRepository, PgWorkerRepository, PgWorkflowExecutionRepository,
};
use convoy_orchestrator::service::{
    AlertService, DispatchSettings, ExecutionQueueDispatcher, PipelineStateProjector,
    RoutingEngine, SweepSettings,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convoy_orchestrator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Convoy Orchestrator...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;

    info!("Connecting to database...");
    let pool = connect_with_retry(&config).await?;
    info!("Database connection pool created");

    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let routing = RoutingEngine::new(
        Arc::new(PgWorkerRepository::new(pool.clone())),
        Arc::new(PgConnectionResultRepository::new(pool.clone())),
        config.worker_heartbeat_timeout,
        config.whitelist_ttl,
    );

    let rules = if config.alert_notification_groups.is_empty() {
        Vec::new()
    } else {
        [
            AlertCategory::Setup,
            AlertCategory::Approval,
            AlertCategory::ManualIntervention,
        ]
        .into_iter()
        .map(|category| NotificationRule::new(category, config.alert_notification_groups.clone()))
        .collect()
    };

    let alerts = AlertService::new(
        Arc::new(PgAlertRepository::new(pool.clone())),
        routing,
        Arc::new(TracingNotificationSender),
        rules,
        SweepSettings::from_config(&config),
    );

    let dispatcher = ExecutionQueueDispatcher::new(
        Arc::new(PgWorkflowExecutionRepository::new(pool.clone())),
        Arc::new(PgStateMachineExecutor::new(pool.clone())),
        Arc::new(PgLock::new(pool.clone())),
        Arc::new(PgExecutionQueue::new(pool.clone())),
        DispatchSettings::from_config(&config),
    );

    let projector = PipelineStateProjector::new(
        Arc::new(PgPipelineRepository::new(pool.clone())),
        Arc::new(PgWorkflowExecutionRepository::new(pool.clone())),
        Arc::new(PgStateExecutionRepository::new(pool.clone())),
        Arc::new(PgStateMachineExecutor::new(pool.clone())),
        config.eta_sample_size,
    );

    info!("Services initialized");

    let dispatch_loop = tokio::spawn(dispatcher.clone().run());

    let rescan_interval = config.queue_rescan_interval;
    let rescan_loop = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(rescan_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = dispatcher.rescan().await {
                error!("Queue rescan failed: {}", e);
            }
        }
    });

    let retention = config.alert_retention;
    let sweep_interval = config.alert_sweep_interval;
    let retention_loop = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            alerts.delete_old_alerts(retention).await;
        }
    });

    let refresh_interval = config.projection_refresh_interval;
    let refresh_limit = config.projection_refresh_limit;
    let projection_loop = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(refresh_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = projector.refresh_unfinished(refresh_limit).await {
                error!("Pipeline projection refresh failed: {}", e);
            }
        }
    });

    info!(
        "Orchestrator running: rescan every {:?}, alert sweep every {:?}, projection refresh every {:?}",
        rescan_interval, sweep_interval, refresh_interval
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    dispatch_loop.abort();
    rescan_loop.abort();
    retention_loop.abort();
    projection_loop.abort();

    Ok(())
}

/// Connects to the database, retrying with exponential backoff
///
/// The database may still be starting when the orchestrator boots.
async fn connect_with_retry(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match db::create_pool(&config.database_url, config.max_connections).await {
            Ok(pool) => return Ok(pool),
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    return Err(anyhow::anyhow!(
                        "Failed to connect to database after {} attempts: {}",
                        MAX_RETRIES,
                        e
                    ));
                }

                warn!(
                    "Failed to connect to database (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
