// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Embeddable engine runtime.
//!
//! [`EngineRuntime`] wires the scheduler, the three queue consumers,
//! the auditor, and the retention sweeper onto one tokio runtime so
//! the engine can run standalone or inside an existing application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tributary_core::runtime::EngineRuntime;
//! use tributary_core::persistence::PostgresPersistence;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     let store = Arc::new(PostgresPersistence::new(pool));
//!
//!     let runtime = EngineRuntime::builder()
//!         .store(store)
//!         .registry(registry)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::adapter::{ActivitySink, AdapterRegistry, NullActivitySink};
use crate::auditor::StuckAuditor;
use crate::checker::CheckTrigger;
use crate::config::Config;
use crate::executor::{RunExecutor, StreamExecutor, WebhookExecutor};
use crate::persistence::Persistence;
use crate::queue::{QueueEmitter, QueueMessage, QueueReceivers, TokioQueue};
use crate::retention::RetentionSweeper;
use crate::scheduler::{SchedulerState, TickScheduler};

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    store: Option<Arc<dyn Persistence>>,
    registry: Option<Arc<AdapterRegistry>>,
    sink: Arc<dyn ActivitySink>,
    config: Config,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("registry", &self.registry.as_ref().map(|r| r.len()))
            .field("config", &self.config)
            .finish()
    }
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            registry: None,
            sink: Arc::new(NullActivitySink),
            config: Config::default(),
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn store(mut self, store: Arc<dyn Persistence>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the adapter registry (required).
    pub fn registry(mut self, registry: Arc<AdapterRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the activity sink.
    ///
    /// Default: [`NullActivitySink`], which drops all domain writes.
    pub fn sink(mut self, sink: Arc<dyn ActivitySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Set the engine configuration.
    ///
    /// Default: [`Config::default`].
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let store = self.store.ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;

        Ok(EngineRuntimeConfig {
            store,
            registry,
            sink: self.sink,
            config: self.config,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    store: Arc<dyn Persistence>,
    registry: Arc<AdapterRegistry>,
    sink: Arc<dyn ActivitySink>,
    config: Config,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("registry", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Start the runtime, spawning the scheduler, consumers, auditor,
    /// and retention tasks.
    pub async fn start(self) -> Result<EngineRuntime> {
        let (queue, receivers) = TokioQueue::new();
        let emitter: Arc<dyn QueueEmitter> = Arc::new(queue);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let trigger = Arc::new(CheckTrigger::new(
            self.store.clone(),
            self.registry.clone(),
            emitter.clone(),
            self.config.clone(),
        ));
        let scheduler = TickScheduler::new(
            self.store.clone(),
            self.registry.clone(),
            emitter.clone(),
            trigger,
            self.config.clone(),
        );
        let auditor = StuckAuditor::new(
            self.store.clone(),
            self.registry.clone(),
            emitter.clone(),
            self.config.clone(),
        );
        let retention = RetentionSweeper::new(self.store.clone(), self.config.clone());

        let run_executor = Arc::new(RunExecutor::new(
            self.store.clone(),
            self.registry.clone(),
            emitter.clone(),
            self.config.clone(),
        ));
        let stream_executor = Arc::new(StreamExecutor::new(
            self.store.clone(),
            self.registry.clone(),
            emitter.clone(),
            self.sink.clone(),
            self.config.clone(),
        ));
        let webhook_executor = Arc::new(WebhookExecutor::new(
            self.store.clone(),
            self.registry.clone(),
            emitter.clone(),
            self.sink.clone(),
            self.config.clone(),
        ));

        let QueueReceivers {
            runs,
            streams,
            webhooks,
        } = receivers;

        let mut handles = Vec::new();
        handles.push(tokio::spawn(run_tick_loop(
            scheduler,
            self.registry.clone(),
            self.config.tick_interval_secs,
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(run_audit_loop(
            auditor,
            self.config.audit_interval_secs,
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(run_retention_loop(
            retention,
            self.config.retention_interval_secs,
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(consume(
            "runs",
            runs,
            shutdown_rx.clone(),
            move |message| {
                let executor = run_executor.clone();
                async move {
                    if let QueueMessage::ProcessRun { run_id, stream_id } = message {
                        executor.handle(&run_id, stream_id.as_deref()).await
                    } else {
                        Ok(())
                    }
                }
            },
        )));
        handles.push(tokio::spawn(consume(
            "streams",
            streams,
            shutdown_rx.clone(),
            move |message| {
                let executor = stream_executor.clone();
                async move {
                    if let QueueMessage::ProcessStream { stream_id } = message {
                        executor.handle(&stream_id).await
                    } else {
                        Ok(())
                    }
                }
            },
        )));
        handles.push(tokio::spawn(consume(
            "webhooks",
            webhooks,
            shutdown_rx,
            move |message| {
                let executor = webhook_executor.clone();
                async move {
                    if let QueueMessage::ProcessWebhook {
                        webhook_id,
                        force,
                        fire_downstream_webhooks,
                        ..
                    } = message
                    {
                        executor
                            .handle(&webhook_id, force, fire_downstream_webhooks)
                            .await
                    } else {
                        Ok(())
                    }
                }
            },
        )));

        info!(
            platforms = ?self.registry.platforms(),
            tick_interval_secs = self.config.tick_interval_secs,
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            handles,
            shutdown_tx,
            store: self.store,
            emitter,
        })
    }
}

/// A running engine that can be embedded in an application.
///
/// The runtime manages:
/// - the tick scheduler (checks, delayed-run promotion)
/// - three queue consumers (runs, streams, webhooks)
/// - the stuck-state auditor
/// - the retention sweeper
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    store: Arc<dyn Persistence>,
    emitter: Arc<dyn QueueEmitter>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Get a reference to the persistence layer.
    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    /// Get the queue emitter, for injecting messages from outside the
    /// engine (webhook ingress, manual replays).
    pub fn emitter(&self) -> &Arc<dyn QueueEmitter> {
        &self.emitter
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals all tasks to stop and waits for them to finish their
    /// current unit of work.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");
        let _ = self.shutdown_tx.send(true);

        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("engine task panicked during shutdown: {}", e);
                return Err(anyhow::anyhow!("engine task panicked: {}", e));
            }
        }

        info!("EngineRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|handle| !handle.is_finished())
    }
}

async fn run_tick_loop(
    scheduler: TickScheduler,
    registry: Arc<AdapterRegistry>,
    interval_secs: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut state = SchedulerState::new(&registry);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the interval fires immediately; skip the startup tick
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("tick loop received shutdown signal");
                    break;
                }
            }

            _ = ticker.tick() => {
                if let Err(e) = scheduler.process_tick(&mut state).await {
                    error!("tick processing failed: {}", e);
                }
            }
        }
    }
}

async fn run_audit_loop(
    auditor: StuckAuditor,
    interval_secs: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("audit loop received shutdown signal");
                    break;
                }
            }

            _ = ticker.tick() => {
                if let Err(e) = auditor.sweep().await {
                    error!("audit sweep failed: {}", e);
                }
            }
        }
    }
}

async fn run_retention_loop(
    retention: RetentionSweeper,
    interval_secs: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("retention loop received shutdown signal");
                    break;
                }
            }

            _ = ticker.tick() => {
                if let Err(e) = retention.sweep().await {
                    error!("retention sweep failed: {}", e);
                }
            }
        }
    }
}

/// Drain one queue until shutdown. Handler failures are logged and the
/// loop continues; fatal store assertions are logged loudly because
/// they indicate a broken processing precondition.
async fn consume<F, Fut>(
    queue_name: &'static str,
    mut receiver: mpsc::UnboundedReceiver<QueueMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
    handler: F,
) where
    F: Fn(QueueMessage) -> Fut,
    Fut: Future<Output = Result<(), crate::error::EngineError>>,
{
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!(queue = queue_name, "consumer received shutdown signal");
                    break;
                }
            }

            message = receiver.recv() => {
                match message {
                    Some(message) => {
                        if let Err(e) = handler(message).await {
                            if e.is_fatal() {
                                error!(queue = queue_name, "FATAL consumer error: {}", e);
                            } else {
                                error!(queue = queue_name, "consumer error: {}", e);
                            }
                        }
                    }
                    None => {
                        info!(queue = queue_name, "queue closed, consumer stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{
        AdapterError, CheckScope, PlatformAdapter, RunContext, StreamContext, StreamResult,
        StreamSpec,
    };
    use crate::persistence::{IntegrationRecord, SqlitePersistence};
    use async_trait::async_trait;
    use chrono::Utc;

    struct OneStreamAdapter;

    #[async_trait]
    impl PlatformAdapter for OneStreamAdapter {
        fn platform(&self) -> &str {
            "github"
        }

        fn check_scope(&self) -> CheckScope {
            CheckScope::Integrations
        }

        fn ticks_between_checks(&self) -> i32 {
            1
        }

        async fn generate_streams(
            &self,
            _ctx: &RunContext,
        ) -> Result<Vec<StreamSpec>, AdapterError> {
            Ok(vec![StreamSpec::new("members")])
        }

        async fn process_stream(
            &self,
            _ctx: &StreamContext,
        ) -> Result<StreamResult, AdapterError> {
            Ok(StreamResult::default())
        }
    }

    async fn memory_store() -> Arc<SqlitePersistence> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::run_sqlite(&pool).await.unwrap();
        Arc::new(SqlitePersistence::new(pool))
    }

    #[test]
    fn test_builder_missing_store() {
        let result = EngineRuntimeBuilder::new()
            .registry(Arc::new(AdapterRegistry::new()))
            .build();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("store is required"));
    }

    #[test]
    fn test_builder_debug() {
        let builder = EngineRuntimeBuilder::new();
        let debug_str = format!("{:?}", builder);
        assert!(debug_str.contains("EngineRuntimeBuilder"));
    }

    #[tokio::test]
    async fn test_built_config_debug() {
        let store = memory_store().await;
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(OneStreamAdapter));

        let built = EngineRuntimeBuilder::new()
            .store(store)
            .registry(Arc::new(registry))
            .build()
            .unwrap();
        let debug_str = format!("{:?}", built);
        assert!(debug_str.contains("EngineRuntimeConfig"));
    }

    #[tokio::test]
    async fn test_runtime_start_and_shutdown() {
        let store = memory_store().await;
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(OneStreamAdapter));

        let runtime = EngineRuntime::builder()
            .store(store)
            .registry(Arc::new(registry))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_runtime_processes_check_cycle() {
        let store = memory_store().await;
        store
            .create_integration(&IntegrationRecord {
                id: "int-1".to_string(),
                tenant_id: "tenant-1".to_string(),
                platform: "github".to_string(),
                status: "active".to_string(),
                settings: "{}".to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(OneStreamAdapter));

        // tick every second so the cycle completes inside the test
        let config = Config {
            tick_interval_secs: 1,
            ..Config::default()
        };
        let runtime = EngineRuntime::builder()
            .store(store.clone())
            .registry(Arc::new(registry))
            .config(config)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        // one tick creates the run, the consumers drive it to processed
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(run) = store
                .find_last_run_for_integration("int-1")
                .await
                .unwrap()
                && run.state == "processed"
            {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "run never reached processed"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        runtime.shutdown().await.unwrap();
    }
}
