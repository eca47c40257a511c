// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! tributary - operational CLI for the ingestion engine.
//!
//! Thin wrappers over the persistence layer. Replays work by resetting
//! rows and delaying their runs; a running worker's scheduler then
//! promotes and re-enqueues them, so every replay survives the CLI
//! process exiting.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use tributary_core::adapter::AdapterRegistry;
use tributary_core::auditor::StuckAuditor;
use tributary_core::config::Config;
use tributary_core::error::EngineError;
use tributary_core::persistence::{
    Persistence, PostgresPersistence, RunRecord, RunState, SqlitePersistence,
};
use tributary_core::queue::{QueueEmitter, QueueMessage};
use tributary_core::retention::RetentionSweeper;

#[derive(Parser)]
#[command(
    name = "tributary",
    version,
    about = "Operational tooling for the Tributary ingestion engine"
)]
struct Cli {
    /// Database connection URL (postgres:// or sqlite:)
    #[arg(long, env = "TRIBUTARY_DATABASE_URL")]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay one or more runs by id
    ReplayRun {
        /// Run ids to replay
        #[arg(required = true)]
        run_ids: Vec<String>,
    },
    /// Replay one or more streams by id
    ReplayStream {
        /// Stream ids to replay
        #[arg(required = true)]
        stream_ids: Vec<String>,
    },
    /// Replay the integrations of a platform, or a single integration
    ReplayIntegration {
        /// Platform whose integrations to replay
        #[arg(long, conflicts_with = "id")]
        platform: Option<String>,
        /// A single integration id to replay
        #[arg(long)]
        id: Option<String>,
    },
    /// Run the stuck-state auditor once
    CheckStuck,
    /// Delete terminal rows past the retention window
    Purge {
        /// Override the retention window in days
        #[arg(long)]
        days: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = connect(&cli.database_url).await?;
    let config = Config {
        database_url: cli.database_url.clone(),
        ..Config::default()
    };

    match cli.command {
        Commands::ReplayRun { run_ids } => {
            for run_id in &run_ids {
                replay_run(&store, run_id).await?;
                println!("Run {run_id} scheduled for replay");
            }
        }

        Commands::ReplayStream { stream_ids } => {
            for stream_id in &stream_ids {
                let stream = store
                    .find_stream(stream_id)
                    .await?
                    .with_context(|| format!("stream {stream_id} not found"))?;
                store.reset_stream(stream_id).await?;
                replay_run(&store, &stream.run_id).await?;
                println!("Stream {stream_id} reset, run {} scheduled", stream.run_id);
            }
        }

        Commands::ReplayIntegration { platform, id } => {
            let integrations = match (platform, id) {
                (Some(platform), None) => {
                    let mut all = Vec::new();
                    let mut offset = 0i64;
                    loop {
                        let page = store
                            .find_integrations_by_platform(
                                &platform,
                                &["active", "in-progress", "error"],
                                config.page_size,
                                offset,
                            )
                            .await?;
                        let page_len = page.len();
                        all.extend(page);
                        if (page_len as i64) < config.page_size {
                            break;
                        }
                        offset += config.page_size;
                    }
                    all
                }
                (None, Some(id)) => {
                    let integration = store
                        .find_integration(&id)
                        .await?
                        .with_context(|| format!("integration {id} not found"))?;
                    vec![integration]
                }
                _ => bail!("exactly one of --platform or --id is required"),
            };

            for integration in &integrations {
                replay_integration(&store, &integration.id).await?;
                println!("Integration {} scheduled for replay", integration.id);
            }
            println!("{} integration(s) scheduled", integrations.len());
        }

        Commands::CheckStuck => {
            // webhook re-enqueues only take effect inside a running
            // worker; here they are printed so an operator can follow up
            let emitter: Arc<dyn QueueEmitter> = Arc::new(PrintingEmitter);
            let auditor = StuckAuditor::new(
                store.clone(),
                Arc::new(AdapterRegistry::new()),
                emitter,
                config,
            );
            let report = auditor.sweep().await?;
            println!(
                "restarted integrations: {}\nrequeued runs: {}\nsettled runs: {}\nflagged runs: {}\nstale webhooks: {}",
                report.restarted_integrations,
                report.requeued_runs,
                report.settled_runs,
                report.flagged_runs,
                report.requeued_webhooks,
            );
        }

        Commands::Purge { days } => {
            let config = Config {
                retention_days: days.unwrap_or(config.retention_days),
                ..config
            };
            let sweeper = RetentionSweeper::new(store.clone(), config);
            let report = sweeper.sweep().await?;
            println!(
                "deleted runs: {}\ndeleted webhooks: {}\ndeleted orphaned webhooks: {}",
                report.runs, report.webhooks, report.orphaned_webhooks,
            );
        }
    }

    Ok(())
}

async fn connect(database_url: &str) -> Result<Arc<dyn Persistence>> {
    if database_url.starts_with("sqlite") {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .context("connecting to sqlite database")?;
        Ok(Arc::new(SqlitePersistence::new(pool)))
    } else {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .context("connecting to postgres database")?;
        Ok(Arc::new(PostgresPersistence::new(pool)))
    }
}

/// Delay a run to right now; the worker's next scheduler tick promotes
/// it back to pending and emits its message.
async fn replay_run(store: &Arc<dyn Persistence>, run_id: &str) -> Result<()> {
    store
        .find_run(run_id)
        .await?
        .with_context(|| format!("run {run_id} not found"))?;
    store.delay_run(run_id, Utc::now()).await?;
    info!(run_id, "run delayed for immediate promotion");
    Ok(())
}

/// Replay an integration: delay its last run, or create a fresh one
/// already eligible for promotion when no run exists yet.
async fn replay_integration(store: &Arc<dyn Persistence>, integration_id: &str) -> Result<()> {
    if let Some(run) = store.find_last_run_for_integration(integration_id).await? {
        store.delay_run(&run.id, Utc::now()).await?;
        return Ok(());
    }

    let integration = store
        .find_integration(integration_id)
        .await?
        .with_context(|| format!("integration {integration_id} not found"))?;
    let run = RunRecord {
        id: uuid::Uuid::new_v4().to_string(),
        tenant_id: integration.tenant_id,
        integration_id: Some(integration.id),
        microservice_id: None,
        onboarding: false,
        state: RunState::Delayed.as_str().to_string(),
        delayed_until: Some(Utc::now()),
        processed_at: None,
        error: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    store.create_run(&run).await?;
    info!(run_id = %run.id, integration_id, "created replay run");
    Ok(())
}

/// Emitter that prints instead of delivering; the CLI has no worker
/// queue to hand messages to.
struct PrintingEmitter;

#[async_trait::async_trait]
impl QueueEmitter for PrintingEmitter {
    async fn emit(&self, message: QueueMessage) -> Result<(), EngineError> {
        println!("would emit: {}", serde_json::to_string(&message)?);
        Ok(())
    }

    async fn emit_delayed(
        &self,
        message: QueueMessage,
        delay: Duration,
    ) -> Result<(), EngineError> {
        println!(
            "would emit after {}s: {}",
            delay.as_secs(),
            serde_json::to_string(&message)?
        );
        Ok(())
    }
}
