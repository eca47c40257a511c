// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Stream executor: fetches one unit of work and writes its results.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{
    ActivitySink, AdapterError, AdapterRegistry, PlatformAdapter, StreamContext, StreamResult,
};
use crate::config::Config;
use crate::error::{EngineError, ErrorDetail};
use crate::persistence::{Persistence, StreamRecord, StreamState};
use crate::queue::{QueueEmitter, QueueMessage};

use super::sync_integration_status;

/// Consumes "process stream" messages.
pub struct StreamExecutor {
    store: Arc<dyn Persistence>,
    registry: Arc<AdapterRegistry>,
    emitter: Arc<dyn QueueEmitter>,
    sink: Arc<dyn ActivitySink>,
    config: Config,
}

impl StreamExecutor {
    /// New executor over the given collaborators.
    pub fn new(
        store: Arc<dyn Persistence>,
        registry: Arc<AdapterRegistry>,
        emitter: Arc<dyn QueueEmitter>,
        sink: Arc<dyn ActivitySink>,
        config: Config,
    ) -> Self {
        Self {
            store,
            registry,
            emitter,
            sink,
            config,
        }
    }

    /// Handle one message. Duplicate deliveries and abandoned units
    /// return Ok; only store-level failures propagate.
    pub async fn handle(&self, stream_id: &str) -> Result<(), EngineError> {
        let Some(stream) = self.store.find_stream(stream_id).await? else {
            warn!(stream_id, "stream not found, discarding message");
            return Ok(());
        };

        // runnable: fresh, or failed with retry budget left
        let runnable = match stream.stream_state() {
            Some(StreamState::Pending) => true,
            Some(StreamState::Error) => stream.retries.unwrap_or(0) < self.config.max_retries,
            _ => false,
        };
        if !runnable {
            debug!(stream_id, state = %stream.state, "stream not runnable, discarding message");
            return Ok(());
        }

        self.store.mark_stream_processing(stream_id).await?;

        let Some((adapter, ctx)) = self.resolve(&stream).await? else {
            // resolve already marked the stream; the run still needs
            // its state recomputed
            let run_state = self
                .store
                .touch_run_state(&stream.run_id, self.config.max_retries)
                .await?;
            sync_integration_status(&self.store, stream.integration_id.as_deref(), run_state)
                .await?;
            return Ok(());
        };

        match adapter.process_stream(&ctx).await {
            Ok(result) => self.finish(&adapter, &stream, result).await,
            Err(AdapterError::RateLimited { reset_seconds }) => {
                // backpressure, not failure: the retry budget is untouched
                info!(stream_id, reset_seconds, "stream rate limited, deferring");
                self.store.reset_stream(stream_id).await?;
                self.emitter
                    .emit_delayed(
                        QueueMessage::ProcessStream {
                            stream_id: stream_id.to_string(),
                        },
                        Duration::from_secs(reset_seconds + self.config.rate_limit_buffer_secs),
                    )
                    .await?;
                Ok(())
            }
            Err(err) => {
                let detail = ErrorDetail::wrapping("Error while processing stream!", &err);
                self.fail(&stream, detail).await
            }
        }
    }

    /// Record a failure and either schedule the retry or settle the run.
    async fn fail(&self, stream: &StreamRecord, detail: ErrorDetail) -> Result<(), EngineError> {
        let retries = self
            .store
            .mark_stream_error(&stream.id, &detail.to_json())
            .await?;

        if retries < self.config.max_retries {
            // exponential backoff keyed to the failure count
            let backoff = self.config.stream_retry_backoff_secs * 2u64.pow((retries - 1) as u32);
            warn!(
                stream_id = %stream.id,
                retries,
                backoff_secs = backoff,
                "stream failed, retry scheduled"
            );
            self.emitter
                .emit_delayed(
                    QueueMessage::ProcessStream {
                        stream_id: stream.id.clone(),
                    },
                    Duration::from_secs(backoff),
                )
                .await?;
        } else {
            warn!(stream_id = %stream.id, retries, "stream failed permanently");
            let run_state = self
                .store
                .touch_run_state(&stream.run_id, self.config.max_retries)
                .await?;
            sync_integration_status(&self.store, stream.integration_id.as_deref(), run_state)
                .await?;
        }
        Ok(())
    }

    /// Persist the adapter's output, chain follow-up streams, and close
    /// the stream.
    async fn finish(
        &self,
        adapter: &Arc<dyn PlatformAdapter>,
        stream: &StreamRecord,
        result: StreamResult,
    ) -> Result<(), EngineError> {
        for operation in result.operations.iter().filter(|op| !op.is_empty()) {
            if let Err(err) = self.sink.execute(&stream.tenant_id, operation).await {
                let detail =
                    ErrorDetail::wrapping("Error while persisting stream results!", err.as_ref());
                return self.fail(stream, detail).await;
            }
        }

        if adapter.chains_streams() && !result.next_streams.is_empty() {
            let next: Vec<StreamRecord> = result
                .next_streams
                .into_iter()
                .map(|spec| StreamRecord {
                    id: Uuid::now_v7().to_string(),
                    run_id: stream.run_id.clone(),
                    tenant_id: stream.tenant_id.clone(),
                    integration_id: stream.integration_id.clone(),
                    microservice_id: stream.microservice_id.clone(),
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
            self.store.create_streams(&next).await?;
            for next_stream in &next {
                self.emitter
                    .emit(QueueMessage::ProcessStream {
                        stream_id: next_stream.id.clone(),
                    })
                    .await?;
            }
        }

        self.store.mark_stream_processed(&stream.id).await?;
        let run_state = self
            .store
            .touch_run_state(&stream.run_id, self.config.max_retries)
            .await?;
        sync_integration_status(&self.store, stream.integration_id.as_deref(), run_state).await?;
        debug!(stream_id = %stream.id, run_id = %stream.run_id, %run_state, "stream processed");
        Ok(())
    }

    /// Resolve the stream's run, owner, and adapter. Returns None after
    /// marking the stream when the unit must be abandoned.
    async fn resolve(
        &self,
        stream: &StreamRecord,
    ) -> Result<Option<(Arc<dyn PlatformAdapter>, StreamContext)>, EngineError> {
        let Some(run) = self.store.find_run(&stream.run_id).await? else {
            let detail = ErrorDetail::new("Run no longer exists!");
            warn!(stream_id = %stream.id, run_id = %stream.run_id, "abandoning stream");
            self.store
                .mark_stream_error(&stream.id, &detail.to_json())
                .await?;
            return Ok(None);
        };

        if let Some(integration_id) = &stream.integration_id {
            let Some(integration) = self.store.find_integration(integration_id).await? else {
                let detail = ErrorDetail::new("Integration no longer exists!");
                warn!(stream_id = %stream.id, integration_id, "abandoning stream");
                self.store
                    .mark_stream_error(&stream.id, &detail.to_json())
                    .await?;
                return Ok(None);
            };

            let Some(adapter) = self.registry.get(&integration.platform) else {
                let detail = ErrorDetail::new(format!(
                    "No adapter for platform '{}'!",
                    integration.platform
                ));
                warn!(stream_id = %stream.id, platform = %integration.platform, "abandoning stream");
                self.store
                    .mark_stream_error(&stream.id, &detail.to_json())
                    .await?;
                return Ok(None);
            };

            return Ok(Some((
                adapter,
                StreamContext {
                    stream: stream.clone(),
                    run,
                    integration: Some(integration),
                },
            )));
        }

        // microservice-owned stream
        let adapter = match &stream.microservice_id {
            Some(microservice_id) => match self.store.find_microservice(microservice_id).await? {
                Some(microservice) => self
                    .registry
                    .get_for_service_type(&microservice.service_type),
                None => None,
            },
            None => None,
        };
        let Some(adapter) = adapter else {
            let detail = ErrorDetail::new("Microservice or its adapter no longer exists!");
            warn!(stream_id = %stream.id, "abandoning stream");
            self.store
                .mark_stream_error(&stream.id, &detail.to_json())
                .await?;
            return Ok(None);
        };

        Ok(Some((
            adapter,
            StreamContext {
                stream: stream.clone(),
                run,
                integration: None,
            },
        )))
    }
}
