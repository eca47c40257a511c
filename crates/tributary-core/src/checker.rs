// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Check trigger: turns "platform X is due" into pending runs.
//!
//! Scans the platform's owners (integrations, or microservices for
//! maintenance-style adapters), skips owners that already have an
//! active run, and creates + enqueues a pending run for the rest.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{AdapterRegistry, CheckScope, PlatformAdapter};
use crate::config::Config;
use crate::error::EngineError;
use crate::persistence::{Persistence, RunRecord, RunState};
use crate::queue::{QueueEmitter, QueueMessage};

/// What one platform check did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Owners examined.
    pub examined: usize,
    /// Runs created and enqueued.
    pub created: usize,
    /// Owners skipped because a run was already active.
    pub skipped: usize,
}

/// Creates runs for every owner of a platform that is due for a poll.
pub struct CheckTrigger {
    store: Arc<dyn Persistence>,
    registry: Arc<AdapterRegistry>,
    emitter: Arc<dyn QueueEmitter>,
    config: Config,
}

impl CheckTrigger {
    /// New trigger over the given collaborators.
    pub fn new(
        store: Arc<dyn Persistence>,
        registry: Arc<AdapterRegistry>,
        emitter: Arc<dyn QueueEmitter>,
        config: Config,
    ) -> Self {
        Self {
            store,
            registry,
            emitter,
            config,
        }
    }

    /// Run the check for one platform.
    pub async fn check_platform(&self, platform: &str) -> Result<CheckOutcome, EngineError> {
        let adapter = self
            .registry
            .get(platform)
            .ok_or_else(|| EngineError::AdapterNotFound {
                platform: platform.to_string(),
            })?;

        let outcome = match adapter.check_scope() {
            CheckScope::Integrations => self.check_integrations(platform, &adapter).await?,
            CheckScope::Microservices { service_type } => {
                self.check_microservices(&service_type).await?
            }
        };

        info!(
            platform,
            examined = outcome.examined,
            created = outcome.created,
            skipped = outcome.skipped,
            "platform check finished"
        );
        Ok(outcome)
    }

    async fn check_integrations(
        &self,
        platform: &str,
        adapter: &Arc<dyn PlatformAdapter>,
    ) -> Result<CheckOutcome, EngineError> {
        let mut outcome = CheckOutcome::default();
        let mut due = Vec::new();
        let mut offset = 0i64;

        loop {
            // "done" stays in rotation: a finished integration is polled
            // again on the next cycle
            let page = self
                .store
                .find_integrations_by_platform(
                    platform,
                    &["active", "done"],
                    self.config.page_size,
                    offset,
                )
                .await?;
            let page_len = page.len();

            for integration in page {
                outcome.examined += 1;

                // at-most-one-active-run: skip owners already in flight
                if self
                    .store
                    .find_last_active_run_for_integration(&integration.id, None)
                    .await?
                    .is_some()
                {
                    debug!(
                        integration_id = %integration.id,
                        "active run exists, skipping check"
                    );
                    outcome.skipped += 1;
                    continue;
                }
                due.push(integration);
            }

            if (page_len as i64) < self.config.page_size {
                break;
            }
            offset += self.config.page_size;
        }

        // the adapter decides which due integrations go out this cycle
        // and how the fan-out is paced
        let due_count = due.len();
        let plan = adapter
            .trigger_integration_check(due)
            .await
            .map_err(|err| EngineError::CheckFailed {
                platform: platform.to_string(),
                details: err.to_string(),
            })?;
        outcome.skipped += due_count - plan.len();

        for (integration, delay) in plan {
            let run = RunRecord {
                id: Uuid::new_v4().to_string(),
                tenant_id: integration.tenant_id.clone(),
                integration_id: Some(integration.id.clone()),
                microservice_id: None,
                onboarding: false,
                state: RunState::Pending.as_str().to_string(),
                delayed_until: None,
                processed_at: None,
                error: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            self.store.create_run(&run).await?;
            if delay.is_zero() {
                self.enqueue_run(&run.id, outcome.created).await?;
            } else {
                self.emitter
                    .emit_delayed(
                        QueueMessage::ProcessRun {
                            run_id: run.id.clone(),
                            stream_id: None,
                        },
                        delay,
                    )
                    .await?;
            }
            outcome.created += 1;
        }

        Ok(outcome)
    }

    async fn check_microservices(&self, service_type: &str) -> Result<CheckOutcome, EngineError> {
        let mut outcome = CheckOutcome::default();
        let mut offset = 0i64;

        loop {
            let page = self
                .store
                .find_microservices_by_type(service_type, self.config.page_size, offset)
                .await?;
            let page_len = page.len();

            for microservice in page {
                outcome.examined += 1;

                if self
                    .store
                    .find_last_active_run_for_microservice(&microservice.id, None)
                    .await?
                    .is_some()
                {
                    debug!(
                        microservice_id = %microservice.id,
                        "active run exists, skipping check"
                    );
                    outcome.skipped += 1;
                    continue;
                }

                let run = RunRecord {
                    id: Uuid::new_v4().to_string(),
                    tenant_id: microservice.tenant_id.clone(),
                    integration_id: None,
                    microservice_id: Some(microservice.id.clone()),
                    onboarding: false,
                    state: RunState::Pending.as_str().to_string(),
                    delayed_until: None,
                    processed_at: None,
                    error: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                };
                self.store.create_run(&run).await?;
                self.enqueue_run(&run.id, outcome.created).await?;
                outcome.created += 1;
            }

            if (page_len as i64) < self.config.page_size {
                break;
            }
            offset += self.config.page_size;
        }

        Ok(outcome)
    }

    /// Enqueue a freshly created run. Above the jitter threshold the
    /// enqueues are spread into delay buckets so a big fan-out does not
    /// hammer one external API all at once.
    async fn enqueue_run(&self, run_id: &str, created_so_far: usize) -> Result<(), EngineError> {
        let message = QueueMessage::ProcessRun {
            run_id: run_id.to_string(),
            stream_id: None,
        };

        let bucket = if self.config.jitter_threshold > 0 {
            created_so_far as u64 / self.config.jitter_threshold as u64
        } else {
            0
        };

        if bucket == 0 {
            self.emitter.emit(message).await
        } else {
            let delay = std::time::Duration::from_secs(bucket * self.config.jitter_bucket_secs);
            warn!(run_id, ?delay, "large fan-out, delaying run enqueue");
            self.emitter.emit_delayed(message, delay).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{
        AdapterError, PlatformAdapter, RunContext, StreamContext, StreamResult, StreamSpec,
    };
    use crate::persistence::{IntegrationRecord, MicroserviceRecord, SqlitePersistence};
    use crate::queue::RecordingEmitter;
    use async_trait::async_trait;

    struct TestAdapter {
        platform: &'static str,
        scope: CheckScope,
    }

    #[async_trait]
    impl PlatformAdapter for TestAdapter {
        fn platform(&self) -> &str {
            self.platform
        }

        fn check_scope(&self) -> CheckScope {
            self.scope.clone()
        }

        fn ticks_between_checks(&self) -> i32 {
            20
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

    async fn setup(scope: CheckScope) -> (Arc<SqlitePersistence>, Arc<RecordingEmitter>, CheckTrigger)
    {
        setup_with(Arc::new(TestAdapter {
            platform: "github",
            scope,
        }))
        .await
    }

    async fn setup_with(
        adapter: Arc<dyn PlatformAdapter>,
    ) -> (Arc<SqlitePersistence>, Arc<RecordingEmitter>, CheckTrigger) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::run_sqlite(&pool).await.unwrap();
        let store = Arc::new(SqlitePersistence::new(pool));

        let mut registry = AdapterRegistry::new();
        registry.register(adapter);

        let emitter = Arc::new(RecordingEmitter::new());
        let trigger = CheckTrigger::new(
            store.clone(),
            Arc::new(registry),
            emitter.clone(),
            Config::default(),
        );
        (store, emitter, trigger)
    }

    fn integration(id: &str, status: &str) -> IntegrationRecord {
        IntegrationRecord {
            id: id.to_string(),
            tenant_id: "tenant-1".to_string(),
            platform: "github".to_string(),
            status: status.to_string(),
            settings: "{}".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_check_creates_runs_for_active_integrations() {
        let (store, emitter, trigger) = setup(CheckScope::Integrations).await;
        store
            .create_integration(&integration("int-1", "active"))
            .await
            .unwrap();
        store
            .create_integration(&integration("int-2", "active"))
            .await
            .unwrap();
        store
            .create_integration(&integration("int-3", "error"))
            .await
            .unwrap();

        let outcome = trigger.check_platform("github").await.unwrap();
        assert_eq!(outcome.examined, 2);
        assert_eq!(outcome.created, 2);
        assert_eq!(outcome.skipped, 0);

        let messages = emitter.messages();
        assert_eq!(messages.len(), 2);
        assert!(
            messages
                .iter()
                .all(|m| matches!(m, QueueMessage::ProcessRun { .. }))
        );

        // both integrations now have an active pending run
        for id in ["int-1", "int-2"] {
            let run = store
                .find_last_active_run_for_integration(id, None)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(run.state, "pending");
        }
    }

    #[tokio::test]
    async fn test_check_polls_done_integrations_again() {
        let (store, emitter, trigger) = setup(CheckScope::Integrations).await;
        store
            .create_integration(&integration("int-1", "done"))
            .await
            .unwrap();

        let outcome = trigger.check_platform("github").await.unwrap();
        assert_eq!(outcome.examined, 1);
        assert_eq!(outcome.created, 1);
        assert_eq!(emitter.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_check_is_idempotent_per_owner() {
        let (store, emitter, trigger) = setup(CheckScope::Integrations).await;
        store
            .create_integration(&integration("int-1", "active"))
            .await
            .unwrap();

        let first = trigger.check_platform("github").await.unwrap();
        assert_eq!(first.created, 1);

        emitter.clear();
        let second = trigger.check_platform("github").await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped, 1);
        assert!(emitter.messages().is_empty());
    }

    #[tokio::test]
    async fn test_check_microservice_scope() {
        let (store, emitter, trigger) = setup(CheckScope::Microservices {
            service_type: "members_score".to_string(),
        })
        .await;
        store
            .create_microservice(&MicroserviceRecord {
                id: "ms-1".to_string(),
                tenant_id: "tenant-1".to_string(),
                service_type: "members_score".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let outcome = trigger.check_platform("github").await.unwrap();
        assert_eq!(outcome.created, 1);
        assert_eq!(emitter.messages().len(), 1);

        let run = store
            .find_last_active_run_for_microservice("ms-1", None)
            .await
            .unwrap()
            .unwrap();
        assert!(run.integration_id.is_none());
        assert_eq!(run.microservice_id.as_deref(), Some("ms-1"));
    }

    #[tokio::test]
    async fn test_check_unknown_platform() {
        let (_store, _emitter, trigger) = setup(CheckScope::Integrations).await;
        let err = trigger.check_platform("discord").await.unwrap_err();
        assert!(matches!(err, EngineError::AdapterNotFound { .. }));
    }

    #[tokio::test]
    async fn test_jitter_delays_large_fanout() {
        let (store, emitter, trigger) = setup(CheckScope::Integrations).await;
        // threshold in the test config is 50; make 60 integrations
        for i in 0..60 {
            store
                .create_integration(&integration(&format!("int-{i:03}"), "active"))
                .await
                .unwrap();
        }

        let outcome = trigger.check_platform("github").await.unwrap();
        assert_eq!(outcome.created, 60);

        let emitted = emitter.emitted();
        let immediate = emitted.iter().filter(|(_, d)| d.is_none()).count();
        let delayed = emitted.iter().filter(|(_, d)| d.is_some()).count();
        assert_eq!(immediate, 50);
        assert_eq!(delayed, 10);
        for (_, delay) in emitted.iter().filter(|(_, d)| d.is_some()) {
            assert_eq!(*delay, Some(std::time::Duration::from_secs(10)));
        }
    }

    /// Takes at most two integrations per cycle, two minutes apart.
    struct PacedAdapter {
        fail: bool,
    }

    #[async_trait]
    impl PlatformAdapter for PacedAdapter {
        fn platform(&self) -> &str {
            "github"
        }

        fn check_scope(&self) -> CheckScope {
            CheckScope::Integrations
        }

        fn ticks_between_checks(&self) -> i32 {
            20
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

        async fn trigger_integration_check(
            &self,
            integrations: Vec<IntegrationRecord>,
        ) -> Result<Vec<(IntegrationRecord, std::time::Duration)>, AdapterError> {
            if self.fail {
                return Err(AdapterError::Other(anyhow::anyhow!("token expired")));
            }
            Ok(integrations
                .into_iter()
                .take(2)
                .enumerate()
                .map(|(i, integration)| {
                    (integration, std::time::Duration::from_secs(i as u64 * 120))
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_adapter_paces_check_fanout() {
        let (store, emitter, trigger) = setup_with(Arc::new(PacedAdapter { fail: false })).await;
        for i in 0..3 {
            store
                .create_integration(&integration(&format!("int-{i}"), "active"))
                .await
                .unwrap();
        }

        let outcome = trigger.check_platform("github").await.unwrap();
        assert_eq!(outcome.examined, 3);
        assert_eq!(outcome.created, 2);
        // the integration the adapter left out of its plan
        assert_eq!(outcome.skipped, 1);

        let emitted = emitter.emitted();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].1, None);
        assert_eq!(emitted[1].1, Some(std::time::Duration::from_secs(120)));

        // runs exist for the planned integrations only
        assert!(
            store
                .find_last_active_run_for_integration("int-0", None)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            store
                .find_last_active_run_for_integration("int-2", None)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_check_surfaces_adapter_failure() {
        let (store, emitter, trigger) = setup_with(Arc::new(PacedAdapter { fail: true })).await;
        store
            .create_integration(&integration("int-1", "active"))
            .await
            .unwrap();

        let err = trigger.check_platform("github").await.unwrap_err();
        assert!(matches!(err, EngineError::CheckFailed { .. }));
        assert!(emitter.messages().is_empty());
        assert!(
            store
                .find_last_active_run_for_integration("int-1", None)
                .await
                .unwrap()
                .is_none()
        );
    }
}
