use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Workers embed copies of their scopes
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workers (
            id VARCHAR(255) PRIMARY KEY,
            account_id VARCHAR(255) NOT NULL,
            host_name VARCHAR(255) NOT NULL,
            registered_at TIMESTAMPTZ NOT NULL,
            last_heartbeat_at TIMESTAMPTZ NOT NULL,
            status VARCHAR(50) NOT NULL,
            include_scopes JSONB NOT NULL DEFAULT '[]',
            exclude_scopes JSONB NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_workers_account_id ON workers(account_id)")
        .execute(pool)
        .await?;

    // Cached connectivity check results
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS connection_results (
            id UUID PRIMARY KEY,
            account_id VARCHAR(255) NOT NULL,
            worker_id VARCHAR(255) NOT NULL,
            criteria TEXT NOT NULL,
            validated BOOLEAN NOT NULL,
            last_updated_at TIMESTAMPTZ NOT NULL,
            UNIQUE (account_id, worker_id, criteria)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Alerts
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id UUID PRIMARY KEY,
            account_id VARCHAR(255) NOT NULL,
            app_id VARCHAR(255) NOT NULL,
            alert_type VARCHAR(50) NOT NULL,
            status VARCHAR(20) NOT NULL,
            category VARCHAR(50) NOT NULL,
            severity VARCHAR(20) NOT NULL,
            title TEXT NOT NULL,
            payload JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            closed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_alerts_open ON alerts(account_id, app_id, alert_type, status)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_closed_at ON alerts(status, closed_at)")
        .execute(pool)
        .await?;

    // Workflow executions
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflow_executions (
            id UUID PRIMARY KEY,
            app_id VARCHAR(255) NOT NULL,
            workflow_id VARCHAR(255) NOT NULL,
            workflow_type VARCHAR(50) NOT NULL,
            name VARCHAR(255) NOT NULL,
            status VARCHAR(50) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            ended_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_workflow_executions_workflow ON workflow_executions(app_id, workflow_id, status, created_at)",
    )
    .execute(pool)
    .await?;

    // Pipelines and their ETA tables
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipelines (
            id VARCHAR(255) PRIMARY KEY,
            app_id VARCHAR(255) NOT NULL,
            name VARCHAR(255) NOT NULL,
            state_eta_map JSONB NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_executions (
            workflow_execution_id UUID PRIMARY KEY,
            app_id VARCHAR(255) NOT NULL,
            pipeline_id VARCHAR(255) NOT NULL,
            pipeline_name VARCHAR(255) NOT NULL,
            status VARCHAR(50) NOT NULL,
            started_at TIMESTAMPTZ,
            ended_at TIMESTAMPTZ,
            stage_executions JSONB NOT NULL DEFAULT '[]',
            state_eta_map JSONB NOT NULL DEFAULT '{}',
            version BIGINT NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pipeline_executions_pipeline ON pipeline_executions(app_id, pipeline_id, status, ended_at DESC)",
    )
    .execute(pool)
    .await?;

    // Per-state records written by the state-machine interpreter
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS state_execution_instances (
            id UUID PRIMARY KEY,
            app_id VARCHAR(255) NOT NULL,
            execution_id UUID NOT NULL,
            state_name VARCHAR(255) NOT NULL,
            state_type VARCHAR(50) NOT NULL,
            status VARCHAR(50) NOT NULL,
            started_at TIMESTAMPTZ,
            ended_at TIMESTAMPTZ,
            state_execution_map JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_state_execution_instances_execution ON state_execution_instances(app_id, execution_id)",
    )
    .execute(pool)
    .await?;

    // Compiled state machine graphs
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS state_machines (
            id UUID PRIMARY KEY,
            app_id VARCHAR(255) NOT NULL,
            origin_id VARCHAR(255) NOT NULL,
            initial_state_name VARCHAR(255) NOT NULL,
            states JSONB NOT NULL,
            transitions JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_state_machines_origin ON state_machines(app_id, origin_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    // Distributed locks
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS distributed_locks (
            resource VARCHAR(255) PRIMARY KEY,
            holder_id UUID NOT NULL,
            acquired_at TIMESTAMPTZ NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Durable execution event queue
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS execution_queue (
            id UUID PRIMARY KEY,
            app_id VARCHAR(255) NOT NULL,
            workflow_id VARCHAR(255) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            visible_at TIMESTAMPTZ NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_execution_queue_visible ON execution_queue(visible_at, created_at)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
