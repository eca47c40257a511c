// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Persistence interfaces and backends for tributary-core.
//!
//! This module defines the store abstraction over runs, streams, and
//! webhooks plus the backend implementations.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::EngineError;

/// Run states. A run owns one polling pass over an integration (or a
/// microservice job) and aggregates the terminal states of its streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Created, waiting for a run executor.
    Pending,
    /// A run executor picked it up.
    Processing,
    /// Deferred until `delayed_until` (rate limit or stuck repair).
    Delayed,
    /// Terminal success.
    Processed,
    /// Terminal failure (at least one stream exhausted its retries).
    Error,
    /// Terminal: the owning integration no longer exists.
    IntegrationDeleted,
}

impl RunState {
    /// The string stored in the `state` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Delayed => "delayed",
            Self::Processed => "processed",
            Self::Error => "error",
            Self::IntegrationDeleted => "integration-deleted",
        }
    }

    /// Parse a stored state string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "delayed" => Some(Self::Delayed),
            "processed" => Some(Self::Processed),
            "error" => Some(Self::Error),
            "integration-deleted" => Some(Self::IntegrationDeleted),
            _ => None,
        }
    }

    /// Whether this state is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Error | Self::IntegrationDeleted)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream states. A stream is one independently-retryable unit of fetch
/// work within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, waiting for a stream executor.
    Pending,
    /// A stream executor picked it up.
    Processing,
    /// Terminal success.
    Processed,
    /// Failed; terminal once `retries` reaches the configured maximum.
    Error,
}

impl StreamState {
    /// The string stored in the `state` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Error => "error",
        }
    }

    /// Parse a stored state string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "processed" => Some(Self::Processed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Webhook states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookState {
    /// Stored, waiting for the webhook executor.
    Pending,
    /// Terminal success.
    Processed,
    /// Terminal failure; replayable via `reset_webhook`.
    Error,
}

impl WebhookState {
    /// The string stored in the `state` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Error => "error",
        }
    }

    /// Parse a stored state string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processed" => Some(Self::Processed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for WebhookState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    /// Unique identifier for the run.
    pub id: String,
    /// Tenant identifier for multi-tenancy isolation.
    pub tenant_id: String,
    /// Owning integration (exclusive with `microservice_id`).
    pub integration_id: Option<String>,
    /// Owning microservice (exclusive with `integration_id`).
    pub microservice_id: Option<String>,
    /// Whether this run is the integration's first (historical backfill).
    pub onboarding: bool,
    /// Current state (pending, processing, delayed, processed, error,
    /// integration-deleted).
    pub state: String,
    /// When a delayed run becomes eligible again.
    pub delayed_until: Option<DateTime<Utc>>,
    /// When the run reached a terminal-or-exhausted stream set.
    pub processed_at: Option<DateTime<Utc>>,
    /// Structured error JSON from the last failure.
    pub error: Option<String>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// Last modification time; the auditor's staleness signal.
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// Typed view of the stored state, if recognized.
    pub fn run_state(&self) -> Option<RunState> {
        RunState::parse(&self.state)
    }
}

/// Stream record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StreamRecord {
    /// Unique identifier for the stream.
    pub id: String,
    /// Run this stream belongs to.
    pub run_id: String,
    /// Tenant identifier for multi-tenancy isolation.
    pub tenant_id: String,
    /// Owning integration, denormalized from the run.
    pub integration_id: Option<String>,
    /// Owning microservice, denormalized from the run.
    pub microservice_id: Option<String>,
    /// Current state (pending, processing, processed, error).
    pub state: String,
    /// Adapter-defined unit name (endpoint, page, channel, ...).
    pub name: String,
    /// Adapter-defined cursor/parameters as JSON.
    pub metadata: String,
    /// When the stream last reached processed or error.
    pub processed_at: Option<DateTime<Utc>>,
    /// Structured error JSON from the last failure.
    pub error: Option<String>,
    /// Failure count; NULL until the first `mark_error`.
    pub retries: Option<i32>,
    /// When the stream was created.
    pub created_at: DateTime<Utc>,
    /// Last modification time; the auditor's staleness signal.
    pub updated_at: DateTime<Utc>,
}

impl StreamRecord {
    /// Typed view of the stored state, if recognized.
    pub fn stream_state(&self) -> Option<StreamState> {
        StreamState::parse(&self.state)
    }
}

/// Incoming webhook record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookRecord {
    /// Unique identifier for the webhook.
    pub id: String,
    /// Tenant identifier for multi-tenancy isolation.
    pub tenant_id: String,
    /// Integration the delivery belongs to.
    pub integration_id: String,
    /// Platform that delivered the payload.
    pub platform: String,
    /// Current state (pending, processed, error).
    pub state: String,
    /// Raw payload JSON, stored verbatim at receipt.
    pub payload: String,
    /// When processing last finished.
    pub processed_at: Option<DateTime<Utc>>,
    /// Structured error JSON from the last failure.
    pub error: Option<String>,
    /// When the delivery was received.
    pub created_at: DateTime<Utc>,
}

impl WebhookRecord {
    /// Typed view of the stored state, if recognized.
    pub fn webhook_state(&self) -> Option<WebhookState> {
        WebhookState::parse(&self.state)
    }
}

/// Lean integration record. The engine only reads what it needs to
/// schedule checks and resolve adapters; the full integration CRUD
/// surface lives outside this crate.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IntegrationRecord {
    /// Unique identifier for the integration.
    pub id: String,
    /// Tenant identifier for multi-tenancy isolation.
    pub tenant_id: String,
    /// Platform key used to resolve the adapter.
    pub platform: String,
    /// Lifecycle status (active, in-progress, error, ...).
    pub status: String,
    /// Platform-specific settings JSON.
    pub settings: String,
    /// When the integration was created.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// Lean microservice record, the second kind of run owner.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MicroserviceRecord {
    /// Unique identifier for the microservice.
    pub id: String,
    /// Tenant identifier for multi-tenancy isolation.
    pub tenant_id: String,
    /// Service type key used to resolve the adapter.
    pub service_type: String,
    /// When the microservice was created.
    pub created_at: DateTime<Utc>,
}

/// Compute the run state implied by a run's streams.
///
/// Returns `None` when the streams do not determine a new state (some
/// stream is still pending/processing, or every failure still has
/// retries left); the run keeps its current state. One exhausted stream
/// settles the run as `Error` even when a sibling failure still has
/// retry budget. A run with zero streams is `Processed`.
///
/// This is the single source of truth for run completion; the backends'
/// `touch_run_state` SQL implements the same rules in one statement.
pub fn run_state_from_streams(streams: &[StreamRecord], max_retries: i32) -> Option<RunState> {
    let mut exhausted = 0usize;
    let mut retryable = 0usize;
    let mut open = 0usize;

    for stream in streams {
        match StreamState::parse(&stream.state) {
            Some(StreamState::Processed) => {}
            Some(StreamState::Error) => {
                if stream.retries.unwrap_or(0) >= max_retries {
                    exhausted += 1;
                } else {
                    retryable += 1;
                }
            }
            _ => open += 1,
        }
    }

    if open > 0 {
        return None;
    }
    if exhausted > 0 {
        return Some(RunState::Error);
    }
    if retryable > 0 {
        // All streams look terminal but retries are still owed.
        return None;
    }
    Some(RunState::Processed)
}

/// Persistence interface used by the scheduler, executors, and auditor.
///
/// Every single-row mutation asserts exactly one affected row and
/// returns a fatal [`EngineError::RowCountMismatch`] otherwise; that
/// assertion is the guard against double-processing and lost updates.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Runs
    // ========================================================================

    async fn create_run(&self, run: &RunRecord) -> Result<(), EngineError>;

    async fn find_run(&self, run_id: &str) -> Result<Option<RunRecord>, EngineError>;

    /// Most recent non-terminal run for an integration, if any,
    /// optionally ignoring one run id (collision checks). Backs the
    /// at-most-one-active-run check.
    async fn find_last_active_run_for_integration(
        &self,
        integration_id: &str,
        ignore_run_id: Option<&str>,
    ) -> Result<Option<RunRecord>, EngineError>;

    /// Most recent non-terminal run for a microservice, if any,
    /// optionally ignoring one run id.
    async fn find_last_active_run_for_microservice(
        &self,
        microservice_id: &str,
        ignore_run_id: Option<&str>,
    ) -> Result<Option<RunRecord>, EngineError>;

    /// Most recent run for an integration regardless of state.
    async fn find_last_run_for_integration(
        &self,
        integration_id: &str,
    ) -> Result<Option<RunRecord>, EngineError>;

    async fn mark_run_processing(&self, run_id: &str) -> Result<(), EngineError>;

    async fn mark_run_error(&self, run_id: &str, error_json: &str) -> Result<(), EngineError>;

    /// Move the run to `delayed` until the given time.
    async fn delay_run(&self, run_id: &str, until: DateTime<Utc>) -> Result<(), EngineError>;

    /// Move the run back to `pending`, clearing error, processed_at,
    /// and delayed_until.
    async fn restart_run(&self, run_id: &str) -> Result<(), EngineError>;

    /// Recompute the run's state from its streams in one atomic
    /// statement and return the resulting state. See
    /// [`run_state_from_streams`] for the rules.
    async fn touch_run_state(&self, run_id: &str, max_retries: i32)
    -> Result<RunState, EngineError>;

    /// Mark a run's state terminal because its integration was deleted.
    /// Returns the number of runs updated (multi-row, no assertion).
    async fn mark_runs_integration_deleted(
        &self,
        integration_id: &str,
    ) -> Result<u64, EngineError>;

    /// Page of `delayed` runs whose delay has elapsed.
    async fn find_delayed_runs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunRecord>, EngineError>;

    /// Page of runs in the given states with `updated_at` older than
    /// the cutoff, oldest first. The auditor's scan.
    async fn find_stale_runs(
        &self,
        states: &[&str],
        updated_before: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunRecord>, EngineError>;

    /// Delete `processed` runs (and their streams) whose processed_at
    /// predates the cutoff. Returns the number of runs deleted.
    async fn cleanup_runs_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, EngineError>;

    // ========================================================================
    // Streams
    // ========================================================================

    /// Insert a batch of streams in one statement.
    async fn create_streams(&self, streams: &[StreamRecord]) -> Result<(), EngineError>;

    async fn find_stream(&self, stream_id: &str) -> Result<Option<StreamRecord>, EngineError>;

    async fn find_streams_for_run(&self, run_id: &str) -> Result<Vec<StreamRecord>, EngineError>;

    async fn mark_stream_processing(&self, stream_id: &str) -> Result<(), EngineError>;

    async fn mark_stream_processed(&self, stream_id: &str) -> Result<(), EngineError>;

    /// Mark the stream failed, bumping `retries`. Returns the new
    /// retry count.
    async fn mark_stream_error(
        &self,
        stream_id: &str,
        error_json: &str,
    ) -> Result<i32, EngineError>;

    /// Move the stream back to `pending`, clearing retries, error, and
    /// processed_at. Used by rate-limit deferral and replays.
    async fn reset_stream(&self, stream_id: &str) -> Result<(), EngineError>;

    /// Reset all `processing` streams of a run to `pending` (crash
    /// recovery). Returns the number reset (multi-row, no assertion).
    async fn reset_processing_streams_of_run(&self, run_id: &str) -> Result<u64, EngineError>;

    // ========================================================================
    // Webhooks
    // ========================================================================

    async fn create_webhook(&self, webhook: &WebhookRecord) -> Result<(), EngineError>;

    async fn find_webhook(&self, webhook_id: &str) -> Result<Option<WebhookRecord>, EngineError>;

    async fn mark_webhook_processed(&self, webhook_id: &str) -> Result<(), EngineError>;

    async fn mark_webhook_error(
        &self,
        webhook_id: &str,
        error_json: &str,
    ) -> Result<(), EngineError>;

    /// Move the webhook back to `pending`, clearing error and
    /// processed_at. Used by forced replays.
    async fn reset_webhook(&self, webhook_id: &str) -> Result<(), EngineError>;

    /// Page of `pending` webhooks created before the cutoff, oldest
    /// first. The auditor's scan.
    async fn find_stale_pending_webhooks(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookRecord>, EngineError>;

    /// Delete `processed` webhooks whose processed_at predates the
    /// cutoff. Returns the number deleted.
    async fn cleanup_webhooks_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, EngineError>;

    /// Delete webhooks whose integration no longer exists. Returns the
    /// number deleted.
    async fn delete_orphaned_webhooks(&self) -> Result<u64, EngineError>;

    // ========================================================================
    // Integrations / microservices (lean collaborator reads)
    // ========================================================================

    async fn create_integration(&self, integration: &IntegrationRecord)
    -> Result<(), EngineError>;

    async fn find_integration(
        &self,
        integration_id: &str,
    ) -> Result<Option<IntegrationRecord>, EngineError>;

    /// Page of integrations on a platform in the given statuses,
    /// ordered by id for stable pagination.
    async fn find_integrations_by_platform(
        &self,
        platform: &str,
        statuses: &[&str],
        limit: i64,
        offset: i64,
    ) -> Result<Vec<IntegrationRecord>, EngineError>;

    async fn update_integration_status(
        &self,
        integration_id: &str,
        status: &str,
    ) -> Result<(), EngineError>;

    /// Replace the integration's settings JSON.
    async fn update_integration_settings(
        &self,
        integration_id: &str,
        settings_json: &str,
    ) -> Result<(), EngineError>;

    async fn create_microservice(
        &self,
        microservice: &MicroserviceRecord,
    ) -> Result<(), EngineError>;

    async fn find_microservice(
        &self,
        microservice_id: &str,
    ) -> Result<Option<MicroserviceRecord>, EngineError>;

    /// Page of microservices of a service type, ordered by id.
    async fn find_microservices_by_type(
        &self,
        service_type: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MicroserviceRecord>, EngineError>;

    // ========================================================================
    // Health
    // ========================================================================

    async fn health_check_db(&self) -> Result<bool, EngineError>;
}
