// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tributary Core - Activity Ingestion Engine
//!
//! Standalone worker binary: connects to PostgreSQL, runs migrations,
//! and drives the scheduler, executors, auditor, and retention sweeper
//! until interrupted.
//!
//! Platform adapters are registered by the embedding application; this
//! binary starts with an empty registry and is mostly useful for
//! draining queues and running the auditor/retention loops against an
//! existing database.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use tributary_core::adapter::AdapterRegistry;
use tributary_core::config::Config;
use tributary_core::persistence::PostgresPersistence;
use tributary_core::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tributary_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Tributary Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        tick_interval_secs = config.tick_interval_secs,
        max_retries = config.max_retries,
        "Configuration loaded"
    );

    // Connect to database
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Database connection established");

    // Verify connection
    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
    info!(result = row.0, "Database health check passed");

    info!("Running database migrations...");
    tributary_core::migrations::run_postgres(&pool).await?;
    info!("Migrations completed");

    let store = Arc::new(PostgresPersistence::new(pool.clone()));
    let registry = Arc::new(AdapterRegistry::new());

    let runtime = EngineRuntime::builder()
        .store(store)
        .registry(registry)
        .config(config)
        .build()?
        .start()
        .await?;

    info!("Tributary Core initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
