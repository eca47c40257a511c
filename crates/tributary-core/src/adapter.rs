// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Platform adapter seam.
//!
//! A [`PlatformAdapter`] is everything the engine knows about one
//! external platform: how often to poll it, how a polling pass fans out
//! into streams, how to process one stream or one webhook payload. The
//! engine owns all state transitions; adapters only talk to the remote
//! API and describe the work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::persistence::{IntegrationRecord, MicroserviceRecord, RunRecord, StreamRecord};

/// What a periodic check for this adapter iterates over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckScope {
    /// Active integrations of the adapter's platform (the normal case).
    Integrations,
    /// Microservices of a service type (cross-tenant maintenance jobs).
    Microservices {
        /// The service type to iterate.
        service_type: String,
    },
}

/// Error returned by adapter operations.
///
/// Rate limits are their own variant because the engine treats them as
/// backpressure, never as failures: the unit of work is deferred and
/// retried without touching its retry budget.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The remote API rate-limited the call; retry after the hint.
    #[error("rate limited by remote API, reset in {reset_seconds}s")]
    RateLimited {
        /// Seconds until the remote quota resets.
        reset_seconds: u64,
    },

    /// Any other adapter failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One unit of fetch work an adapter wants scheduled.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    /// Unit name (endpoint, repository, channel, page, ...).
    pub name: String,
    /// Cursor/parameters the adapter needs to process the unit.
    pub metadata: Value,
}

impl StreamSpec {
    /// Spec with an empty metadata object.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: Value::Object(Default::default()),
        }
    }

    /// Spec with metadata.
    pub fn with_metadata(name: impl Into<String>, metadata: Value) -> Self {
        Self {
            name: name.into(),
            metadata,
        }
    }
}

/// Kind of bulk write an adapter produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkKind {
    /// Upsert activities together with their members.
    UpsertActivitiesWithMembers,
    /// Upsert members only.
    UpsertMembers,
    /// Partial member updates.
    UpdateMembers,
}

/// A batch of domain records to write, executed by the [`ActivitySink`].
#[derive(Debug, Clone)]
pub struct BulkOperation {
    /// What the records are.
    pub kind: BulkKind,
    /// The records, opaque to the engine.
    pub records: Vec<Value>,
}

impl BulkOperation {
    /// Whether the batch has nothing to write.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Outcome of processing one stream.
#[derive(Debug, Clone, Default)]
pub struct StreamResult {
    /// Domain writes to hand to the activity sink.
    pub operations: Vec<BulkOperation>,
    /// Follow-up streams (pagination chains). Only honored for
    /// adapters that chain streams.
    pub next_streams: Vec<StreamSpec>,
}

/// Outcome of processing one webhook payload.
#[derive(Debug, Clone, Default)]
pub struct WebhookResult {
    /// Domain writes to hand to the activity sink.
    pub operations: Vec<BulkOperation>,
}

/// Everything a run executor hands the adapter for stream generation.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The run being executed.
    pub run: RunRecord,
    /// The owning integration, when integration-driven.
    pub integration: Option<IntegrationRecord>,
    /// The owning microservice, when microservice-driven.
    pub microservice: Option<MicroserviceRecord>,
}

/// Everything a stream executor hands the adapter for one fetch unit.
#[derive(Debug, Clone)]
pub struct StreamContext {
    /// The stream being executed.
    pub stream: StreamRecord,
    /// The run the stream belongs to.
    pub run: RunRecord,
    /// The owning integration, when integration-driven.
    pub integration: Option<IntegrationRecord>,
}

/// Everything the webhook executor hands the adapter for one delivery.
#[derive(Debug, Clone)]
pub struct WebhookContext {
    /// The delivery's integration.
    pub integration: IntegrationRecord,
    /// Raw payload JSON as received.
    pub payload: Value,
    /// Whether the adapter may fire outgoing notifications of its own
    /// while processing. Replays and backfills pass false.
    pub fire_downstream_webhooks: bool,
}

/// One external platform's ingestion behavior.
///
/// Implementations are stateless and shared across workers.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Platform key; matches `integrations.platform`.
    fn platform(&self) -> &str;

    /// What a periodic check iterates over.
    fn check_scope(&self) -> CheckScope {
        CheckScope::Integrations
    }

    /// Scheduler ticks between automatic checks. Negative means never
    /// auto-trigger; zero means every tick.
    fn ticks_between_checks(&self) -> i32;

    /// Whether streams chain (each stream may yield the next page). For
    /// chaining adapters the run executor enqueues only the first
    /// generated stream.
    fn chains_streams(&self) -> bool {
        false
    }

    /// Plan the streams for a fresh run.
    async fn generate_streams(&self, ctx: &RunContext) -> Result<Vec<StreamSpec>, AdapterError>;

    /// Fetch and transform one stream.
    async fn process_stream(&self, ctx: &StreamContext) -> Result<StreamResult, AdapterError>;

    /// Transform one webhook payload into bulk operations.
    async fn process_webhook(&self, ctx: &WebhookContext) -> Result<WebhookResult, AdapterError> {
        let _ = ctx;
        Err(AdapterError::Other(anyhow::anyhow!(
            "platform '{}' does not accept webhooks",
            self.platform()
        )))
    }

    /// One-time member-attribute setup, run before the first webhook is
    /// processed for an integration.
    async fn create_member_attributes(
        &self,
        integration: &IntegrationRecord,
    ) -> Result<(), AdapterError> {
        let _ = integration;
        Ok(())
    }

    /// Plan how a check's due integrations are enqueued. Each returned
    /// pair is an integration plus the delay before its run message goes
    /// out; integrations left out of the result are skipped this cycle.
    /// The default checks everything immediately; adapters for chatty
    /// platforms override this to pace the fan-out.
    async fn trigger_integration_check(
        &self,
        integrations: Vec<IntegrationRecord>,
    ) -> Result<Vec<(IntegrationRecord, Duration)>, AdapterError> {
        Ok(integrations
            .into_iter()
            .map(|integration| (integration, Duration::ZERO))
            .collect())
    }
}

/// Registry of adapters keyed by platform.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its platform key. Replaces any
    /// previous adapter for the same platform.
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters
            .insert(adapter.platform().to_string(), adapter);
    }

    /// Look up the adapter for a platform.
    pub fn get(&self, platform: &str) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(platform).cloned()
    }

    /// Look up the adapter whose check scope covers a microservice
    /// service type.
    pub fn get_for_service_type(&self, service_type: &str) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters
            .values()
            .find(|adapter| {
                matches!(
                    adapter.check_scope(),
                    CheckScope::Microservices { service_type: ref st } if st == service_type
                )
            })
            .cloned()
    }

    /// Registered platform keys, sorted for deterministic iteration.
    pub fn platforms(&self) -> Vec<String> {
        let mut platforms: Vec<String> = self.adapters.keys().cloned().collect();
        platforms.sort();
        platforms
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Collaborator that persists the domain records adapters produce.
///
/// Implementations are expected to apply each operation batch
/// transactionally; the engine only sequences the calls.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    /// Execute one non-empty batch for a tenant.
    async fn execute(&self, tenant_id: &str, operation: &BulkOperation)
    -> Result<(), anyhow::Error>;
}

/// Sink that drops everything. Useful for embedding the engine before a
/// real store is wired up, and in tests that only exercise transitions.
pub struct NullActivitySink;

#[async_trait]
impl ActivitySink for NullActivitySink {
    async fn execute(
        &self,
        _tenant_id: &str,
        _operation: &BulkOperation,
    ) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeAdapter {
        platform: String,
    }

    #[async_trait]
    impl PlatformAdapter for FakeAdapter {
        fn platform(&self) -> &str {
            &self.platform
        }

        fn ticks_between_checks(&self) -> i32 {
            20
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

    #[test]
    fn test_registry_lookup() {
        let mut registry = AdapterRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(FakeAdapter {
            platform: "github".to_string(),
        }));
        registry.register(Arc::new(FakeAdapter {
            platform: "slack".to_string(),
        }));

        assert_eq!(registry.len(), 2);
        assert!(registry.get("github").is_some());
        assert!(registry.get("discord").is_none());
        assert_eq!(registry.platforms(), vec!["github", "slack"]);
    }

    #[test]
    fn test_default_check_scope_is_integrations() {
        let adapter = FakeAdapter {
            platform: "github".to_string(),
        };
        assert_eq!(adapter.check_scope(), CheckScope::Integrations);
        assert!(!adapter.chains_streams());
    }

    #[tokio::test]
    async fn test_default_webhook_rejects() {
        let adapter = FakeAdapter {
            platform: "github".to_string(),
        };
        let ctx = WebhookContext {
            integration: IntegrationRecord {
                id: "int-1".to_string(),
                tenant_id: "tenant-1".to_string(),
                platform: "github".to_string(),
                status: "active".to_string(),
                settings: "{}".to_string(),
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
            payload: serde_json::json!({}),
            fire_downstream_webhooks: true,
        };

        let err = adapter.process_webhook(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("does not accept webhooks"));
    }

    #[tokio::test]
    async fn test_default_check_plan_is_everything_now() {
        let adapter = FakeAdapter {
            platform: "github".to_string(),
        };
        let integrations = vec![
            IntegrationRecord {
                id: "int-1".to_string(),
                tenant_id: "tenant-1".to_string(),
                platform: "github".to_string(),
                status: "active".to_string(),
                settings: "{}".to_string(),
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
            IntegrationRecord {
                id: "int-2".to_string(),
                tenant_id: "tenant-2".to_string(),
                platform: "github".to_string(),
                status: "active".to_string(),
                settings: "{}".to_string(),
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
        ];

        let plan = adapter.trigger_integration_check(integrations).await.unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|(_, delay)| delay.is_zero()));
        assert_eq!(plan[0].0.id, "int-1");
        assert_eq!(plan[1].0.id, "int-2");
    }

    #[test]
    fn test_bulk_operation_is_empty() {
        let op = BulkOperation {
            kind: BulkKind::UpsertMembers,
            records: vec![],
        };
        assert!(op.is_empty());

        let op = BulkOperation {
            kind: BulkKind::UpsertMembers,
            records: vec![serde_json::json!({"username": "octocat"})],
        };
        assert!(!op.is_empty());
    }
}
