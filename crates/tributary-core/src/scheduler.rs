// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tick scheduler.
//!
//! Fires on a fixed interval. Each tick it (a) advances per-platform
//! tick counters and triggers checks for platforms that are due, (b)
//! polls the queue health hook, and (c) promotes delayed runs whose
//! delay has elapsed back into the pipeline.
//!
//! The counters are process-local and non-durable; losing or
//! double-firing one check cycle is scheduling jitter, not data loss.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{error, info, warn};

use crate::adapter::AdapterRegistry;
use crate::checker::CheckTrigger;
use crate::config::Config;
use crate::error::EngineError;
use crate::persistence::Persistence;
use crate::queue::{QueueEmitter, QueueMessage};

/// Per-platform tick counters.
#[derive(Debug, Default)]
pub struct SchedulerState {
    counters: HashMap<String, i32>,
}

impl SchedulerState {
    /// Counters for every registered platform, starting at zero.
    pub fn new(registry: &AdapterRegistry) -> Self {
        Self {
            counters: registry
                .platforms()
                .into_iter()
                .map(|platform| (platform, 0))
                .collect(),
        }
    }

    /// Advance one platform's counter; returns true when the platform
    /// is due and the counter was reset.
    fn advance(&mut self, platform: &str, ticks_between_checks: i32) -> bool {
        if ticks_between_checks < 0 {
            return false;
        }
        if ticks_between_checks == 0 {
            warn!(platform, "check on every tick, this is expensive");
            return true;
        }

        let counter = self.counters.entry(platform.to_string()).or_insert(0);
        *counter += 1;
        if *counter >= ticks_between_checks {
            *counter = 0;
            true
        } else {
            false
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Platforms whose check ran this tick.
    pub checked_platforms: Vec<String>,
    /// Delayed runs promoted back into the pipeline.
    pub promoted_runs: usize,
}

/// Drives checks and delayed-run promotion off a wall-clock tick.
pub struct TickScheduler {
    store: Arc<dyn Persistence>,
    registry: Arc<AdapterRegistry>,
    emitter: Arc<dyn QueueEmitter>,
    trigger: Arc<CheckTrigger>,
    config: Config,
}

impl TickScheduler {
    /// New scheduler over the given collaborators.
    pub fn new(
        store: Arc<dyn Persistence>,
        registry: Arc<AdapterRegistry>,
        emitter: Arc<dyn QueueEmitter>,
        trigger: Arc<CheckTrigger>,
        config: Config,
    ) -> Self {
        Self {
            store,
            registry,
            emitter,
            trigger,
            config,
        }
    }

    /// Process one tick.
    pub async fn process_tick(
        &self,
        state: &mut SchedulerState,
    ) -> Result<TickOutcome, EngineError> {
        let mut outcome = TickOutcome::default();

        // 1. platform checks, in parallel, failures isolated
        let due: Vec<String> = self
            .registry
            .platforms()
            .into_iter()
            .filter(|platform| {
                let Some(adapter) = self.registry.get(platform) else {
                    return false;
                };
                state.advance(platform, adapter.ticks_between_checks())
            })
            .collect();

        let checks = due.iter().map(|platform| {
            let trigger = self.trigger.clone();
            let platform = platform.clone();
            async move {
                let result = trigger.check_platform(&platform).await;
                (platform, result)
            }
        });
        for (platform, result) in join_all(checks).await {
            match result {
                Ok(_) => outcome.checked_platforms.push(platform),
                // one platform's failure must not block the others
                Err(err) => error!(platform, %err, "platform check failed"),
            }
        }

        // 2. queue health hook
        match self.emitter.health_check().await {
            Ok(true) => {}
            Ok(false) => warn!("queue health check reported unhealthy"),
            Err(err) => warn!(%err, "queue health check failed"),
        }

        // 3. delayed-run promotion
        outcome.promoted_runs = self.promote_delayed_runs().await?;

        if !outcome.checked_platforms.is_empty() || outcome.promoted_runs > 0 {
            info!(
                checked = ?outcome.checked_platforms,
                promoted = outcome.promoted_runs,
                "tick processed"
            );
        }
        Ok(outcome)
    }

    /// Page through elapsed delayed runs, restart each to pending, and
    /// re-enqueue it. Restarting removes the row from the query's
    /// result set, so every page is read at offset zero.
    async fn promote_delayed_runs(&self) -> Result<usize, EngineError> {
        let mut promoted = 0usize;

        loop {
            let page = self
                .store
                .find_delayed_runs(Utc::now(), self.config.page_size, 0)
                .await?;
            let page_len = page.len();

            for run in page {
                self.store.restart_run(&run.id).await?;
                self.emitter
                    .emit(QueueMessage::ProcessRun {
                        run_id: run.id,
                        stream_id: None,
                    })
                    .await?;
                promoted += 1;
            }

            if (page_len as i64) < self.config.page_size {
                break;
            }
        }

        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{
        AdapterError, CheckScope, PlatformAdapter, RunContext, StreamContext, StreamResult,
        StreamSpec,
    };
    use crate::persistence::{RunRecord, RunState, SqlitePersistence};
    use crate::queue::RecordingEmitter;
    use async_trait::async_trait;
    use chrono::Duration;

    struct TickyAdapter {
        platform: &'static str,
        ticks: i32,
    }

    #[async_trait]
    impl PlatformAdapter for TickyAdapter {
        fn platform(&self) -> &str {
            self.platform
        }

        fn check_scope(&self) -> CheckScope {
            CheckScope::Integrations
        }

        fn ticks_between_checks(&self) -> i32 {
            self.ticks
        }

        async fn generate_streams(
            &self,
            _ctx: &RunContext,
        ) -> Result<Vec<StreamSpec>, AdapterError> {
            Ok(vec![])
        }

        async fn process_stream(
            &self,
            _ctx: &StreamContext,
        ) -> Result<StreamResult, AdapterError> {
            Ok(StreamResult::default())
        }
    }

    async fn setup(adapters: Vec<TickyAdapter>) -> (
        Arc<SqlitePersistence>,
        Arc<RecordingEmitter>,
        TickScheduler,
        SchedulerState,
    ) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::run_sqlite(&pool).await.unwrap();
        let store = Arc::new(SqlitePersistence::new(pool));

        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(Arc::new(adapter));
        }
        let registry = Arc::new(registry);

        let emitter = Arc::new(RecordingEmitter::new());
        let trigger = Arc::new(CheckTrigger::new(
            store.clone(),
            registry.clone(),
            emitter.clone(),
            Config::default(),
        ));
        let state = SchedulerState::new(&registry);
        let scheduler = TickScheduler::new(
            store.clone(),
            registry,
            emitter.clone(),
            trigger,
            Config::default(),
        );
        (store, emitter, scheduler, state)
    }

    fn run(id: &str, integration_id: &str) -> RunRecord {
        RunRecord {
            id: id.to_string(),
            tenant_id: "tenant-1".to_string(),
            integration_id: Some(integration_id.to_string()),
            microservice_id: None,
            onboarding: false,
            state: RunState::Pending.as_str().to_string(),
            delayed_until: None,
            processed_at: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_counter_fires_at_threshold() {
        let (_store, _emitter, scheduler, mut state) = setup(vec![TickyAdapter {
            platform: "github",
            ticks: 3,
        }])
        .await;

        for _ in 0..2 {
            let outcome = scheduler.process_tick(&mut state).await.unwrap();
            assert!(outcome.checked_platforms.is_empty());
        }

        let outcome = scheduler.process_tick(&mut state).await.unwrap();
        assert_eq!(outcome.checked_platforms, vec!["github"]);

        // counter reset, quiet again
        let outcome = scheduler.process_tick(&mut state).await.unwrap();
        assert!(outcome.checked_platforms.is_empty());
    }

    #[tokio::test]
    async fn test_negative_ticks_never_fires() {
        let (_store, _emitter, scheduler, mut state) = setup(vec![TickyAdapter {
            platform: "manual",
            ticks: -1,
        }])
        .await;

        for _ in 0..10 {
            let outcome = scheduler.process_tick(&mut state).await.unwrap();
            assert!(outcome.checked_platforms.is_empty());
        }
    }

    #[tokio::test]
    async fn test_zero_ticks_fires_every_tick() {
        let (_store, _emitter, scheduler, mut state) = setup(vec![TickyAdapter {
            platform: "greedy",
            ticks: 0,
        }])
        .await;

        for _ in 0..3 {
            let outcome = scheduler.process_tick(&mut state).await.unwrap();
            assert_eq!(outcome.checked_platforms, vec!["greedy"]);
        }
    }

    #[tokio::test]
    async fn test_promotes_elapsed_delayed_runs() {
        let (store, emitter, scheduler, mut state) = setup(vec![TickyAdapter {
            platform: "github",
            ticks: 100,
        }])
        .await;

        store.create_run(&run("run-due", "int-1")).await.unwrap();
        store.create_run(&run("run-later", "int-2")).await.unwrap();
        store
            .delay_run("run-due", Utc::now() - Duration::seconds(1))
            .await
            .unwrap();
        store
            .delay_run("run-later", Utc::now() + Duration::hours(1))
            .await
            .unwrap();

        let outcome = scheduler.process_tick(&mut state).await.unwrap();
        assert_eq!(outcome.promoted_runs, 1);

        let promoted = store.find_run("run-due").await.unwrap().unwrap();
        assert_eq!(promoted.state, "pending");
        assert!(promoted.delayed_until.is_none());

        let still_delayed = store.find_run("run-later").await.unwrap().unwrap();
        assert_eq!(still_delayed.state, "delayed");

        assert_eq!(
            emitter.messages(),
            vec![QueueMessage::ProcessRun {
                run_id: "run-due".to_string(),
                stream_id: None,
            }]
        );
    }

    #[tokio::test]
    async fn test_multiple_due_platforms_all_checked() {
        let (_store, _emitter, scheduler, mut state) = setup(vec![
            TickyAdapter {
                platform: "github",
                ticks: 1,
            },
            TickyAdapter {
                platform: "slack",
                ticks: 1,
            },
        ])
        .await;

        let outcome = scheduler.process_tick(&mut state).await.unwrap();
        let mut checked = outcome.checked_platforms.clone();
        checked.sort();
        assert_eq!(checked, vec!["github", "slack"]);
    }
}
