// Copyright (C) 2025 The trxd Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! trxd Instancer - Challenge Instance Lifecycle Daemon
//!
//! Runs the reclaim scheduler against the platform database and Docker
//! engine:
//! - Applies the instancer schema
//! - Connects to the Docker engine and locates the reverse proxy
//! - Reclaims expired instances until interrupted

use std::sync::Arc;
use tracing::{info, warn};

use trxd_instancer::config::Config;
use trxd_instancer::persistence::{PgConfigStore, PgInstanceStore};
use trxd_instancer::runner::{ComposeRunner, ContainerBackend, DockerRunner, StackBackend};
use trxd_instancer::runtime::InstancerRuntime;
use trxd_instancer::settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trxd_instancer=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        data_dir = %config.data_dir.display(),
        compose_bin = %config.compose_bin,
        "Starting trxd instancer"
    );

    // Connect to database
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    sqlx::raw_sql(include_str!("../migrations/schema.sql"))
        .execute(&pool)
        .await?;

    info!("Database schema verified");

    let configs = Arc::new(PgConfigStore::new(pool.clone()));
    let settings = Settings::load(configs.as_ref()).await?;

    // Create engine runners
    let docker = Arc::new(DockerRunner::connect(Some(settings.proxy_container())).await?);
    let compose = Arc::new(ComposeRunner::new(&config.compose_bin, &config.data_dir));
    info!(
        container_runner = docker.runner_type(),
        stack_runner = compose.runner_type(),
        proxy = %settings.proxy_container(),
        "Runners initialized"
    );

    // Start the runtime
    let runtime = InstancerRuntime::builder()
        .store(Arc::new(PgInstanceStore::new(pool)))
        .config_store(configs)
        .containers(docker.clone())
        .networks(docker)
        .stacks(compose)
        .settings(settings)
        .build()?
        .start()
        .await?;

    info!("Instancer ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("trxd instancer shut down");

    Ok(())
}
