// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Run executor: expands a pending run into its streams.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{AdapterError, AdapterRegistry, PlatformAdapter, RunContext};
use crate::config::Config;
use crate::error::{EngineError, ErrorDetail};
use crate::persistence::{Persistence, RunRecord, RunState, StreamRecord, StreamState};
use crate::queue::{QueueEmitter, QueueMessage};

use super::sync_integration_status;

/// Consumes "process run" messages.
pub struct RunExecutor {
    store: Arc<dyn Persistence>,
    registry: Arc<AdapterRegistry>,
    emitter: Arc<dyn QueueEmitter>,
    config: Config,
}

impl RunExecutor {
    /// New executor over the given collaborators.
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

    /// Handle one message. Duplicate deliveries and abandoned units
    /// return Ok; only store-level failures propagate.
    pub async fn handle(&self, run_id: &str, stream_id: Option<&str>) -> Result<(), EngineError> {
        let Some(run) = self.store.find_run(run_id).await? else {
            warn!(run_id, "run not found, discarding message");
            return Ok(());
        };

        // targeted replay bypasses the state guard: the run has usually
        // already settled when an operator replays one of its streams
        if let Some(stream_id) = stream_id {
            return self.replay_stream(&run, stream_id).await;
        }

        // state guard: anything else is a duplicate delivery
        match run.run_state() {
            Some(RunState::Pending) | Some(RunState::Delayed) => {}
            _ => {
                debug!(run_id, state = %run.state, "run not runnable, discarding message");
                return Ok(());
            }
        }

        // a second active run for the same owner yields to the one
        // already in flight
        if let Some(existing) = self.find_colliding_run(&run).await? {
            warn!(
                run_id,
                existing_run_id = %existing.id,
                "owner already has an active run, abandoning"
            );
            let detail = ErrorDetail::new(format!(
                "Run {} is already being processed for this owner!",
                existing.id
            ));
            self.store.mark_run_error(run_id, &detail.to_json()).await?;
            return Ok(());
        }

        let Some((adapter, ctx)) = self.resolve(&run).await? else {
            return Ok(());
        };

        // a run that already has streams is a repaired/promoted run, not
        // a fresh one: re-enqueue the unfinished streams instead of
        // generating a second set
        let existing = self.store.find_streams_for_run(run_id).await?;
        if !existing.is_empty() {
            return self.resume(&run, existing).await;
        }

        self.store.mark_run_processing(run_id).await?;
        sync_integration_status(
            &self.store,
            run.integration_id.as_deref(),
            RunState::Processing,
        )
        .await?;

        let specs = match adapter.generate_streams(&ctx).await {
            Ok(specs) => specs,
            Err(AdapterError::RateLimited { reset_seconds }) => {
                let until = Utc::now()
                    + chrono::Duration::seconds(
                        (reset_seconds + self.config.rate_limit_buffer_secs) as i64,
                    );
                info!(run_id, reset_seconds, "stream generation rate limited, delaying run");
                self.store.delay_run(run_id, until).await?;
                return Ok(());
            }
            Err(err) => {
                warn!(run_id, %err, "stream generation failed");
                let detail = ErrorDetail::wrapping("Error while generating streams!", &err);
                self.store.mark_run_error(run_id, &detail.to_json()).await?;
                sync_integration_status(
                    &self.store,
                    run.integration_id.as_deref(),
                    RunState::Error,
                )
                .await?;
                return Ok(());
            }
        };

        if specs.is_empty() {
            // nothing to fetch; the recompute terminates the run
            let state = self.store.touch_run_state(run_id, self.config.max_retries).await?;
            sync_integration_status(&self.store, run.integration_id.as_deref(), state).await?;
            info!(run_id, %state, "run generated no streams");
            return Ok(());
        }

        let streams: Vec<StreamRecord> = specs
            .into_iter()
            .map(|spec| StreamRecord {
                // time-sortable ids, for inspection only
                id: Uuid::now_v7().to_string(),
                run_id: run.id.clone(),
                tenant_id: run.tenant_id.clone(),
                integration_id: run.integration_id.clone(),
                microservice_id: run.microservice_id.clone(),
                state: StreamState::Pending.as_str().to_string(),
                name: spec.name,
                metadata: spec.metadata.to_string(),
                processed_at: None,
                error: None,
                retries: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .collect();
        self.store.create_streams(&streams).await?;

        // chaining adapters fetch page N+1 from page N, so only the
        // head of the chain is enqueued
        let to_enqueue: &[StreamRecord] = if adapter.chains_streams() {
            &streams[..1]
        } else {
            &streams[..]
        };
        for stream in to_enqueue {
            self.emitter
                .emit(QueueMessage::ProcessStream {
                    stream_id: stream.id.clone(),
                })
                .await?;
        }

        info!(
            run_id,
            streams = streams.len(),
            enqueued = to_enqueue.len(),
            "run expanded into streams"
        );
        Ok(())
    }

    /// Re-enqueue a run's unfinished streams. When none are left the
    /// recompute settles the run.
    async fn resume(
        &self,
        run: &RunRecord,
        streams: Vec<StreamRecord>,
    ) -> Result<(), EngineError> {
        self.store.mark_run_processing(&run.id).await?;
        sync_integration_status(
            &self.store,
            run.integration_id.as_deref(),
            RunState::Processing,
        )
        .await?;

        let mut enqueued = 0usize;
        for stream in &streams {
            let runnable = match stream.stream_state() {
                Some(StreamState::Pending) => true,
                Some(StreamState::Error) => {
                    stream.retries.unwrap_or(0) < self.config.max_retries
                }
                _ => false,
            };
            if runnable {
                self.emitter
                    .emit(QueueMessage::ProcessStream {
                        stream_id: stream.id.clone(),
                    })
                    .await?;
                enqueued += 1;
            }
        }

        if enqueued == 0 {
            let state = self.store.touch_run_state(&run.id, self.config.max_retries).await?;
            sync_integration_status(&self.store, run.integration_id.as_deref(), state).await?;
            info!(run_id = %run.id, %state, "resumed run had no runnable streams");
        } else {
            info!(run_id = %run.id, enqueued, "resumed run, unfinished streams re-enqueued");
        }
        Ok(())
    }

    /// Reset one stream of a run and re-enqueue just that stream; the
    /// recompute settles the run again once it finishes.
    async fn replay_stream(&self, run: &RunRecord, stream_id: &str) -> Result<(), EngineError> {
        let Some(stream) = self.store.find_stream(stream_id).await? else {
            warn!(run_id = %run.id, stream_id, "stream not found, discarding message");
            return Ok(());
        };
        if stream.run_id != run.id {
            warn!(run_id = %run.id, stream_id, "stream belongs to another run, discarding message");
            return Ok(());
        }

        self.store.mark_run_processing(&run.id).await?;
        sync_integration_status(
            &self.store,
            run.integration_id.as_deref(),
            RunState::Processing,
        )
        .await?;
        self.store.reset_stream(stream_id).await?;
        self.emitter
            .emit(QueueMessage::ProcessStream {
                stream_id: stream_id.to_string(),
            })
            .await?;

        info!(run_id = %run.id, stream_id, "single stream re-enqueued");
        Ok(())
    }

    /// Another active run for the same owner, if one exists.
    async fn find_colliding_run(&self, run: &RunRecord) -> Result<Option<RunRecord>, EngineError> {
        if let Some(integration_id) = &run.integration_id {
            return self
                .store
                .find_last_active_run_for_integration(integration_id, Some(&run.id))
                .await;
        }
        if let Some(microservice_id) = &run.microservice_id {
            return self
                .store
                .find_last_active_run_for_microservice(microservice_id, Some(&run.id))
                .await;
        }
        Ok(None)
    }

    /// Resolve the run's owner and adapter. Returns None after marking
    /// the run when the unit must be abandoned.
    async fn resolve(
        &self,
        run: &RunRecord,
    ) -> Result<Option<(Arc<dyn PlatformAdapter>, RunContext)>, EngineError> {
        if let Some(integration_id) = &run.integration_id {
            let Some(integration) = self.store.find_integration(integration_id).await? else {
                warn!(run_id = %run.id, integration_id, "integration gone, abandoning runs");
                self.store
                    .mark_runs_integration_deleted(integration_id)
                    .await?;
                return Ok(None);
            };

            let Some(adapter) = self.registry.get(&integration.platform) else {
                let err = EngineError::AdapterNotFound {
                    platform: integration.platform.clone(),
                };
                warn!(run_id = %run.id, %err, "abandoning run");
                let detail = ErrorDetail::wrapping("Error while resolving adapter!", &err);
                self.store.mark_run_error(&run.id, &detail.to_json()).await?;
                sync_integration_status(&self.store, Some(integration_id), RunState::Error)
                    .await?;
                return Ok(None);
            };

            return Ok(Some((
                adapter,
                RunContext {
                    run: run.clone(),
                    integration: Some(integration),
                    microservice: None,
                },
            )));
        }

        let Some(microservice_id) = &run.microservice_id else {
            // schema forbids this; treat as structural
            let detail = ErrorDetail::new("Run has no owner!");
            self.store.mark_run_error(&run.id, &detail.to_json()).await?;
            return Ok(None);
        };

        let Some(microservice) = self.store.find_microservice(microservice_id).await? else {
            warn!(run_id = %run.id, microservice_id, "microservice gone, abandoning run");
            let detail = ErrorDetail::new("Microservice no longer exists!");
            self.store.mark_run_error(&run.id, &detail.to_json()).await?;
            return Ok(None);
        };

        let Some(adapter) = self.registry.get_for_service_type(&microservice.service_type) else {
            let detail = ErrorDetail::new(format!(
                "No adapter for service type '{}'!",
                microservice.service_type
            ));
            warn!(run_id = %run.id, service_type = %microservice.service_type, "abandoning run");
            self.store.mark_run_error(&run.id, &detail.to_json()).await?;
            return Ok(None);
        };

        Ok(Some((
            adapter,
            RunContext {
                run: run.clone(),
                integration: None,
                microservice: Some(microservice),
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{CheckScope, StreamContext, StreamResult, StreamSpec};
    use crate::persistence::{IntegrationRecord, SqlitePersistence};
    use crate::queue::RecordingEmitter;
    use async_trait::async_trait;
    use std::sync::Mutex;

    enum GenerateBehavior {
        Streams(Vec<StreamSpec>),
        RateLimited(u64),
        Fail(String),
    }

    struct ScriptedAdapter {
        chains: bool,
        behavior: Mutex<Option<GenerateBehavior>>,
    }

    impl ScriptedAdapter {
        fn new(behavior: GenerateBehavior) -> Self {
            Self {
                chains: false,
                behavior: Mutex::new(Some(behavior)),
            }
        }

        fn chaining(behavior: GenerateBehavior) -> Self {
            Self {
                chains: true,
                behavior: Mutex::new(Some(behavior)),
            }
        }
    }

    #[async_trait]
    impl PlatformAdapter for ScriptedAdapter {
        fn platform(&self) -> &str {
            "github"
        }

        fn check_scope(&self) -> CheckScope {
            CheckScope::Integrations
        }

        fn ticks_between_checks(&self) -> i32 {
            20
        }

        fn chains_streams(&self) -> bool {
            self.chains
        }

        async fn generate_streams(
            &self,
            _ctx: &RunContext,
        ) -> Result<Vec<StreamSpec>, AdapterError> {
            match self.behavior.lock().unwrap().take() {
                Some(GenerateBehavior::Streams(specs)) => Ok(specs),
                Some(GenerateBehavior::RateLimited(reset)) => {
                    Err(AdapterError::RateLimited {
                        reset_seconds: reset,
                    })
                }
                Some(GenerateBehavior::Fail(message)) => {
                    Err(AdapterError::Other(anyhow::anyhow!(message)))
                }
                None => Ok(vec![]),
            }
        }

        async fn process_stream(
            &self,
            _ctx: &StreamContext,
        ) -> Result<StreamResult, AdapterError> {
            Ok(StreamResult::default())
        }
    }

    async fn setup(
        adapter: ScriptedAdapter,
    ) -> (Arc<SqlitePersistence>, Arc<RecordingEmitter>, RunExecutor) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::run_sqlite(&pool).await.unwrap();
        let store = Arc::new(SqlitePersistence::new(pool));

        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(adapter));

        let emitter = Arc::new(RecordingEmitter::new());
        let executor = RunExecutor::new(
            store.clone(),
            Arc::new(registry),
            emitter.clone(),
            Config::default(),
        );
        (store, emitter, executor)
    }

    fn integration(id: &str) -> IntegrationRecord {
        IntegrationRecord {
            id: id.to_string(),
            tenant_id: "tenant-1".to_string(),
            platform: "github".to_string(),
            status: "active".to_string(),
            settings: "{}".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn pending_run(id: &str, integration_id: &str) -> RunRecord {
        RunRecord {
            id: id.to_string(),
            tenant_id: "tenant-1".to_string(),
            integration_id: Some(integration_id.to_string()),
            microservice_id: None,
            onboarding: false,
            state: "pending".to_string(),
            delayed_until: None,
            processed_at: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_expands_run_into_streams() {
        let (store, emitter, executor) = setup(ScriptedAdapter::new(GenerateBehavior::Streams(
            vec![
                StreamSpec::new("members"),
                StreamSpec::new("activities"),
                StreamSpec::new("issues"),
            ],
        )))
        .await;
        store.create_integration(&integration("int-1")).await.unwrap();
        store.create_run(&pending_run("run-1", "int-1")).await.unwrap();

        executor.handle("run-1", None).await.unwrap();

        let run = store.find_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.state, "processing");
        assert_eq!(
            store.find_integration("int-1").await.unwrap().unwrap().status,
            "in-progress"
        );

        let streams = store.find_streams_for_run("run-1").await.unwrap();
        assert_eq!(streams.len(), 3);
        assert!(streams.iter().all(|s| s.state == "pending"));

        let messages = emitter.messages();
        assert_eq!(messages.len(), 3);
        assert!(
            messages
                .iter()
                .all(|m| matches!(m, QueueMessage::ProcessStream { .. }))
        );
    }

    #[tokio::test]
    async fn test_chaining_adapter_enqueues_only_first_stream() {
        let (store, emitter, executor) = setup(ScriptedAdapter::chaining(
            GenerateBehavior::Streams(vec![
                StreamSpec::new("page:1"),
                StreamSpec::new("page:2"),
            ]),
        ))
        .await;
        store.create_integration(&integration("int-1")).await.unwrap();
        store.create_run(&pending_run("run-1", "int-1")).await.unwrap();

        executor.handle("run-1", None).await.unwrap();

        assert_eq!(store.find_streams_for_run("run-1").await.unwrap().len(), 2);
        assert_eq!(emitter.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_discarded() {
        let (store, emitter, executor) = setup(ScriptedAdapter::new(GenerateBehavior::Streams(
            vec![StreamSpec::new("members")],
        )))
        .await;
        store.create_integration(&integration("int-1")).await.unwrap();
        store.create_run(&pending_run("run-1", "int-1")).await.unwrap();
        store.mark_run_processing("run-1").await.unwrap();

        executor.handle("run-1", None).await.unwrap();

        // nothing generated, nothing enqueued
        assert!(store.find_streams_for_run("run-1").await.unwrap().is_empty());
        assert!(emitter.messages().is_empty());
    }

    #[tokio::test]
    async fn test_zero_streams_terminates_run() {
        let (store, emitter, executor) =
            setup(ScriptedAdapter::new(GenerateBehavior::Streams(vec![]))).await;
        store.create_integration(&integration("int-1")).await.unwrap();
        store.create_run(&pending_run("run-1", "int-1")).await.unwrap();

        executor.handle("run-1", None).await.unwrap();

        let run = store.find_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.state, "processed");
        assert!(run.processed_at.is_some());
        assert_eq!(
            store.find_integration("int-1").await.unwrap().unwrap().status,
            "done"
        );
        assert!(emitter.messages().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_generation_delays_run() {
        let (store, emitter, executor) =
            setup(ScriptedAdapter::new(GenerateBehavior::RateLimited(120))).await;
        store.create_integration(&integration("int-1")).await.unwrap();
        store.create_run(&pending_run("run-1", "int-1")).await.unwrap();

        let before = Utc::now();
        executor.handle("run-1", None).await.unwrap();

        let run = store.find_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.state, "delayed");
        let until = run.delayed_until.unwrap();
        // reset + 5s buffer
        assert!(until >= before + chrono::Duration::seconds(125));
        assert!(store.find_streams_for_run("run-1").await.unwrap().is_empty());
        assert!(emitter.messages().is_empty());
    }

    #[tokio::test]
    async fn test_generation_failure_marks_run_error() {
        let (store, _emitter, executor) = setup(ScriptedAdapter::new(GenerateBehavior::Fail(
            "remote API exploded".to_string(),
        )))
        .await;
        store.create_integration(&integration("int-1")).await.unwrap();
        store.create_run(&pending_run("run-1", "int-1")).await.unwrap();

        executor.handle("run-1", None).await.unwrap();

        let run = store.find_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.state, "error");
        let detail: ErrorDetail = serde_json::from_str(run.error.as_deref().unwrap()).unwrap();
        assert_eq!(detail.message, "Error while generating streams!");
        assert_eq!(
            detail.original_message.as_deref(),
            Some("remote API exploded")
        );
        assert_eq!(
            store.find_integration("int-1").await.unwrap().unwrap().status,
            "error"
        );
    }

    #[tokio::test]
    async fn test_second_active_run_for_same_owner_is_abandoned() {
        let (store, emitter, executor) = setup(ScriptedAdapter::new(GenerateBehavior::Streams(
            vec![StreamSpec::new("members")],
        )))
        .await;
        store.create_integration(&integration("int-1")).await.unwrap();

        let mut older = pending_run("run-old", "int-1");
        older.created_at = Utc::now() - chrono::Duration::seconds(60);
        store.create_run(&older).await.unwrap();
        store.create_run(&pending_run("run-new", "int-1")).await.unwrap();

        executor.handle("run-new", None).await.unwrap();

        let abandoned = store.find_run("run-new").await.unwrap().unwrap();
        assert_eq!(abandoned.state, "error");
        let detail: ErrorDetail =
            serde_json::from_str(abandoned.error.as_deref().unwrap()).unwrap();
        assert!(detail.message.contains("run-old"));

        // the run already in flight and the integration are untouched
        assert_eq!(
            store.find_run("run-old").await.unwrap().unwrap().state,
            "pending"
        );
        assert_eq!(
            store.find_integration("int-1").await.unwrap().unwrap().status,
            "active"
        );
        assert!(emitter.messages().is_empty());
    }

    #[tokio::test]
    async fn test_targeted_stream_replay_enqueues_only_that_stream() {
        let (store, emitter, executor) = setup(ScriptedAdapter::new(GenerateBehavior::Streams(
            vec![],
        )))
        .await;
        store.create_integration(&integration("int-1")).await.unwrap();
        let mut settled = pending_run("run-1", "int-1");
        settled.state = "error".to_string();
        store.create_run(&settled).await.unwrap();

        let ok = StreamRecord {
            id: "s-ok".to_string(),
            run_id: "run-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            integration_id: Some("int-1".to_string()),
            microservice_id: None,
            state: "processed".to_string(),
            name: "members".to_string(),
            metadata: "{}".to_string(),
            processed_at: Some(Utc::now()),
            error: None,
            retries: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mut bad = ok.clone();
        bad.id = "s-bad".to_string();
        bad.state = "error".to_string();
        bad.retries = Some(5);
        store.create_streams(&[ok, bad]).await.unwrap();

        executor.handle("run-1", Some("s-bad")).await.unwrap();

        let replayed = store.find_stream("s-bad").await.unwrap().unwrap();
        assert_eq!(replayed.state, "pending");
        assert!(replayed.retries.is_none());
        // the sibling keeps its result
        assert_eq!(
            store.find_stream("s-ok").await.unwrap().unwrap().state,
            "processed"
        );

        assert_eq!(
            store.find_run("run-1").await.unwrap().unwrap().state,
            "processing"
        );
        assert_eq!(
            store.find_integration("int-1").await.unwrap().unwrap().status,
            "in-progress"
        );
        assert_eq!(
            emitter.messages(),
            vec![QueueMessage::ProcessStream {
                stream_id: "s-bad".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_missing_integration_abandons_run() {
        let (store, emitter, executor) = setup(ScriptedAdapter::new(GenerateBehavior::Streams(
            vec![StreamSpec::new("members")],
        )))
        .await;
        // no integration row at all
        store.create_run(&pending_run("run-1", "int-gone")).await.unwrap();

        executor.handle("run-1", None).await.unwrap();

        let run = store.find_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.state, "integration-deleted");
        assert!(emitter.messages().is_empty());

        // terminal state fails the guard on re-delivery
        executor.handle("run-1", None).await.unwrap();
        assert_eq!(
            store.find_run("run-1").await.unwrap().unwrap().state,
            "integration-deleted"
        );
    }

    #[tokio::test]
    async fn test_resumed_run_reenqueues_instead_of_regenerating() {
        let (store, emitter, executor) = setup(ScriptedAdapter::new(GenerateBehavior::Streams(
            vec![StreamSpec::new("members")],
        )))
        .await;
        store.create_integration(&integration("int-1")).await.unwrap();
        store.create_run(&pending_run("run-1", "int-1")).await.unwrap();

        // run already expanded; one stream finished, one never picked up
        let open = StreamRecord {
            id: "s-open".to_string(),
            run_id: "run-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            integration_id: Some("int-1".to_string()),
            microservice_id: None,
            state: "pending".to_string(),
            name: "members".to_string(),
            metadata: "{}".to_string(),
            processed_at: None,
            error: None,
            retries: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mut done = open.clone();
        done.id = "s-done".to_string();
        done.state = "processed".to_string();
        store.create_streams(&[open, done]).await.unwrap();

        executor.handle("run-1", None).await.unwrap();

        // no second generation happened
        assert_eq!(store.find_streams_for_run("run-1").await.unwrap().len(), 2);
        assert_eq!(
            emitter.messages(),
            vec![QueueMessage::ProcessStream {
                stream_id: "s-open".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_missing_run_is_discarded() {
        let (_store, emitter, executor) = setup(ScriptedAdapter::new(
            GenerateBehavior::Streams(vec![]),
        ))
        .await;
        executor.handle("run-missing", None).await.unwrap();
        assert!(emitter.messages().is_empty());
    }
}
