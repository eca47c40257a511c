// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL-backed persistence implementation.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgQueryResult;

use crate::error::EngineError;

use super::{
    IntegrationRecord, MicroserviceRecord, Persistence, RunRecord, RunState, StreamRecord,
    WebhookRecord,
};

/// PostgreSQL-backed persistence provider.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence provider.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn expect_one(operation: &'static str, result: &PgQueryResult) -> Result<(), EngineError> {
    let actual = result.rows_affected();
    if actual != 1 {
        return Err(EngineError::RowCountMismatch {
            operation,
            expected: 1,
            actual,
        });
    }
    Ok(())
}

/// `$start..$start+count` placeholder list for dynamic IN clauses.
fn placeholders(start: usize, count: usize) -> String {
    (0..count)
        .map(|i| format!("${}", start + i))
        .collect::<Vec<_>>()
        .join(", ")
}

const RUN_COLUMNS: &str = "id, tenant_id, integration_id, microservice_id, onboarding, state, \
                           delayed_until, processed_at, error, created_at, updated_at";

const STREAM_COLUMNS: &str = "id, run_id, tenant_id, integration_id, microservice_id, state, \
                              name, metadata, processed_at, error, retries, created_at, updated_at";

const WEBHOOK_COLUMNS: &str =
    "id, tenant_id, integration_id, platform, state, payload, processed_at, error, created_at";

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn create_run(&self, run: &RunRecord) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO integration_runs
                (id, tenant_id, integration_id, microservice_id, onboarding, state,
                 delayed_until, processed_at, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&run.id)
        .bind(&run.tenant_id)
        .bind(&run.integration_id)
        .bind(&run.microservice_id)
        .bind(run.onboarding)
        .bind(&run.state)
        .bind(run.delayed_until)
        .bind(run.processed_at)
        .bind(&run.error)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_run(&self, run_id: &str) -> Result<Option<RunRecord>, EngineError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM integration_runs WHERE id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_last_active_run_for_integration(
        &self,
        integration_id: &str,
        ignore_run_id: Option<&str>,
    ) -> Result<Option<RunRecord>, EngineError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM integration_runs
            WHERE integration_id = $1 AND state IN ('pending', 'processing', 'delayed')
              AND ($2::text IS NULL OR id <> $2)
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(integration_id)
        .bind(ignore_run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_last_active_run_for_microservice(
        &self,
        microservice_id: &str,
        ignore_run_id: Option<&str>,
    ) -> Result<Option<RunRecord>, EngineError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM integration_runs
            WHERE microservice_id = $1 AND state IN ('pending', 'processing', 'delayed')
              AND ($2::text IS NULL OR id <> $2)
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(microservice_id)
        .bind(ignore_run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_last_run_for_integration(
        &self,
        integration_id: &str,
    ) -> Result<Option<RunRecord>, EngineError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM integration_runs
            WHERE integration_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(integration_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn mark_run_processing(&self, run_id: &str) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE integration_runs
            SET state = 'processing', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        expect_one("mark_run_processing", &result)
    }

    async fn mark_run_error(&self, run_id: &str, error_json: &str) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE integration_runs
            SET state = 'error', processed_at = NOW(), error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(error_json)
        .execute(&self.pool)
        .await?;

        expect_one("mark_run_error", &result)
    }

    async fn delay_run(&self, run_id: &str, until: DateTime<Utc>) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE integration_runs
            SET state = 'delayed', delayed_until = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(until)
        .execute(&self.pool)
        .await?;

        expect_one("delay_run", &result)
    }

    async fn restart_run(&self, run_id: &str) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE integration_runs
            SET state = 'pending', delayed_until = NULL, processed_at = NULL,
                error = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        expect_one("restart_run", &result)
    }

    async fn touch_run_state(
        &self,
        run_id: &str,
        max_retries: i32,
    ) -> Result<RunState, EngineError> {
        // Single-statement recompute; mirrors run_state_from_streams.
        // The error branch is checked first so an exhausted stream always
        // yields a terminal 'error', never a false 'processed'. The
        // processed_at condition is the union of both terminal branches
        // (all streams settled, and no retries owed unless something is
        // exhausted) so that every terminal run carries a processed_at;
        // an already-set value is kept, a non-terminal recompute leaves
        // the column alone.
        let states: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE integration_runs
            SET processed_at = CASE
                    WHEN (SELECT (count(s.id) =
                                  (count(s.id) FILTER (WHERE s.state = 'processed') +
                                   count(s.id) FILTER (WHERE s.state = 'error'))) AND
                                 (count(s.id) FILTER (WHERE s.state = 'error'
                                                        AND COALESCE(s.retries, 0) >= $2) > 0 OR
                                  count(s.id) FILTER (WHERE s.state = 'error'
                                                        AND COALESCE(s.retries, 0) < $2) = 0)
                          FROM integration_streams s
                          WHERE s.run_id = $1) THEN COALESCE(processed_at, NOW())
                    ELSE processed_at
                END,
                state = CASE
                    WHEN (SELECT (count(s.id) =
                                  (count(s.id) FILTER (WHERE s.state = 'processed') +
                                   count(s.id) FILTER (WHERE s.state = 'error'))) AND
                                 count(s.id) FILTER (WHERE s.state = 'error'
                                                       AND COALESCE(s.retries, 0) >= $2) > 0
                          FROM integration_streams s
                          WHERE s.run_id = $1) THEN 'error'
                    WHEN (SELECT (count(s.id) =
                                  (count(s.id) FILTER (WHERE s.state = 'processed') +
                                   count(s.id) FILTER (WHERE s.state = 'error'))) AND
                                 count(s.id) FILTER (WHERE s.state = 'error'
                                                       AND COALESCE(s.retries, 0) < $2) = 0
                          FROM integration_streams s
                          WHERE s.run_id = $1) THEN 'processed'
                    ELSE state
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING state
            "#,
        )
        .bind(run_id)
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;

        if states.len() != 1 {
            return Err(EngineError::RowCountMismatch {
                operation: "touch_run_state",
                expected: 1,
                actual: states.len() as u64,
            });
        }

        RunState::parse(&states[0]).ok_or_else(|| EngineError::DatabaseError {
            operation: "touch_run_state".to_string(),
            details: format!("unknown run state '{}'", states[0]),
        })
    }

    async fn mark_runs_integration_deleted(
        &self,
        integration_id: &str,
    ) -> Result<u64, EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE integration_runs
            SET state = 'integration-deleted', updated_at = NOW()
            WHERE integration_id = $1 AND state IN ('pending', 'processing', 'delayed')
            "#,
        )
        .bind(integration_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn find_delayed_runs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunRecord>, EngineError> {
        let records = sqlx::query_as::<_, RunRecord>(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM integration_runs
            WHERE state = 'delayed' AND delayed_until <= $1
            ORDER BY delayed_until ASC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(now)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn find_stale_runs(
        &self,
        states: &[&str],
        updated_before: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunRecord>, EngineError> {
        if states.is_empty() {
            return Ok(vec![]);
        }

        let next = states.len() + 1;
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS} FROM integration_runs
            WHERE state IN ({}) AND updated_at < ${}
            ORDER BY updated_at ASC
            LIMIT ${} OFFSET ${}
            "#,
            placeholders(1, states.len()),
            next,
            next + 1,
            next + 2,
        );

        let mut query = sqlx::query_as::<_, RunRecord>(&sql);
        for state in states {
            query = query.bind(*state);
        }
        let records = query
            .bind(updated_before)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn cleanup_runs_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, EngineError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM integration_streams
            WHERE run_id IN (SELECT id FROM integration_runs
                             WHERE state = 'processed' AND processed_at < $1)
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            DELETE FROM integration_runs
            WHERE state = 'processed' AND processed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn create_streams(&self, streams: &[StreamRecord]) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        for stream in streams {
            sqlx::query(
                r#"
                INSERT INTO integration_streams
                    (id, run_id, tenant_id, integration_id, microservice_id, state,
                     name, metadata, processed_at, error, retries, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(&stream.id)
            .bind(&stream.run_id)
            .bind(&stream.tenant_id)
            .bind(&stream.integration_id)
            .bind(&stream.microservice_id)
            .bind(&stream.state)
            .bind(&stream.name)
            .bind(&stream.metadata)
            .bind(stream.processed_at)
            .bind(&stream.error)
            .bind(stream.retries)
            .bind(stream.created_at)
            .bind(stream.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn find_stream(&self, stream_id: &str) -> Result<Option<StreamRecord>, EngineError> {
        let record = sqlx::query_as::<_, StreamRecord>(&format!(
            "SELECT {STREAM_COLUMNS} FROM integration_streams WHERE id = $1"
        ))
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_streams_for_run(&self, run_id: &str) -> Result<Vec<StreamRecord>, EngineError> {
        let records = sqlx::query_as::<_, StreamRecord>(&format!(
            r#"
            SELECT {STREAM_COLUMNS} FROM integration_streams
            WHERE run_id = $1
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn mark_stream_processing(&self, stream_id: &str) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE integration_streams
            SET state = 'processing', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(stream_id)
        .execute(&self.pool)
        .await?;

        expect_one("mark_stream_processing", &result)
    }

    async fn mark_stream_processed(&self, stream_id: &str) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE integration_streams
            SET state = 'processed', processed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(stream_id)
        .execute(&self.pool)
        .await?;

        expect_one("mark_stream_processed", &result)
    }

    async fn mark_stream_error(
        &self,
        stream_id: &str,
        error_json: &str,
    ) -> Result<i32, EngineError> {
        let retries: Vec<i32> = sqlx::query_scalar(
            r#"
            UPDATE integration_streams
            SET state = 'error', processed_at = NOW(), error = $2,
                retries = COALESCE(retries, 0) + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING retries
            "#,
        )
        .bind(stream_id)
        .bind(error_json)
        .fetch_all(&self.pool)
        .await?;

        if retries.len() != 1 {
            return Err(EngineError::RowCountMismatch {
                operation: "mark_stream_error",
                expected: 1,
                actual: retries.len() as u64,
            });
        }

        Ok(retries[0])
    }

    async fn reset_stream(&self, stream_id: &str) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE integration_streams
            SET state = 'pending', error = NULL, processed_at = NULL,
                retries = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(stream_id)
        .execute(&self.pool)
        .await?;

        expect_one("reset_stream", &result)
    }

    async fn reset_processing_streams_of_run(&self, run_id: &str) -> Result<u64, EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE integration_streams
            SET state = 'pending', updated_at = NOW()
            WHERE run_id = $1 AND state = 'processing'
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn create_webhook(&self, webhook: &WebhookRecord) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO incoming_webhooks
                (id, tenant_id, integration_id, platform, state, payload,
                 processed_at, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&webhook.id)
        .bind(&webhook.tenant_id)
        .bind(&webhook.integration_id)
        .bind(&webhook.platform)
        .bind(&webhook.state)
        .bind(&webhook.payload)
        .bind(webhook.processed_at)
        .bind(&webhook.error)
        .bind(webhook.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_webhook(&self, webhook_id: &str) -> Result<Option<WebhookRecord>, EngineError> {
        let record = sqlx::query_as::<_, WebhookRecord>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM incoming_webhooks WHERE id = $1"
        ))
        .bind(webhook_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn mark_webhook_processed(&self, webhook_id: &str) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE incoming_webhooks
            SET state = 'processed', processed_at = NOW(), error = NULL
            WHERE id = $1
            "#,
        )
        .bind(webhook_id)
        .execute(&self.pool)
        .await?;

        expect_one("mark_webhook_processed", &result)
    }

    async fn mark_webhook_error(
        &self,
        webhook_id: &str,
        error_json: &str,
    ) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE incoming_webhooks
            SET state = 'error', processed_at = NOW(), error = $2
            WHERE id = $1
            "#,
        )
        .bind(webhook_id)
        .bind(error_json)
        .execute(&self.pool)
        .await?;

        expect_one("mark_webhook_error", &result)
    }

    async fn reset_webhook(&self, webhook_id: &str) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE incoming_webhooks
            SET state = 'pending', processed_at = NULL, error = NULL
            WHERE id = $1
            "#,
        )
        .bind(webhook_id)
        .execute(&self.pool)
        .await?;

        expect_one("reset_webhook", &result)
    }

    async fn find_stale_pending_webhooks(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WebhookRecord>, EngineError> {
        let records = sqlx::query_as::<_, WebhookRecord>(&format!(
            r#"
            SELECT {WEBHOOK_COLUMNS} FROM incoming_webhooks
            WHERE state = 'pending' AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(created_before)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn cleanup_webhooks_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, EngineError> {
        let result = sqlx::query(
            r#"
            DELETE FROM incoming_webhooks
            WHERE state = 'processed' AND processed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_orphaned_webhooks(&self) -> Result<u64, EngineError> {
        let result = sqlx::query(
            r#"
            DELETE FROM incoming_webhooks
            WHERE integration_id NOT IN (SELECT id FROM integrations)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn create_integration(
        &self,
        integration: &IntegrationRecord,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO integrations (id, tenant_id, platform, status, settings, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&integration.id)
        .bind(&integration.tenant_id)
        .bind(&integration.platform)
        .bind(&integration.status)
        .bind(&integration.settings)
        .bind(integration.created_at)
        .bind(integration.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_integration(
        &self,
        integration_id: &str,
    ) -> Result<Option<IntegrationRecord>, EngineError> {
        let record = sqlx::query_as::<_, IntegrationRecord>(
            r#"
            SELECT id, tenant_id, platform, status, settings, created_at, updated_at
            FROM integrations
            WHERE id = $1
            "#,
        )
        .bind(integration_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_integrations_by_platform(
        &self,
        platform: &str,
        statuses: &[&str],
        limit: i64,
        offset: i64,
    ) -> Result<Vec<IntegrationRecord>, EngineError> {
        if statuses.is_empty() {
            return Ok(vec![]);
        }

        let next = statuses.len() + 2;
        let sql = format!(
            r#"
            SELECT id, tenant_id, platform, status, settings, created_at, updated_at
            FROM integrations
            WHERE platform = $1 AND status IN ({})
            ORDER BY id ASC
            LIMIT ${} OFFSET ${}
            "#,
            placeholders(2, statuses.len()),
            next,
            next + 1,
        );

        let mut query = sqlx::query_as::<_, IntegrationRecord>(&sql).bind(platform);
        for status in statuses {
            query = query.bind(*status);
        }
        let records = query
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn update_integration_status(
        &self,
        integration_id: &str,
        status: &str,
    ) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE integrations
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(integration_id)
        .bind(status)
        .execute(&self.pool)
        .await?;

        expect_one("update_integration_status", &result)
    }

    async fn update_integration_settings(
        &self,
        integration_id: &str,
        settings_json: &str,
    ) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE integrations
            SET settings = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(integration_id)
        .bind(settings_json)
        .execute(&self.pool)
        .await?;

        expect_one("update_integration_settings", &result)
    }

    async fn create_microservice(
        &self,
        microservice: &MicroserviceRecord,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO microservices (id, tenant_id, service_type, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&microservice.id)
        .bind(&microservice.tenant_id)
        .bind(&microservice.service_type)
        .bind(microservice.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_microservice(
        &self,
        microservice_id: &str,
    ) -> Result<Option<MicroserviceRecord>, EngineError> {
        let record = sqlx::query_as::<_, MicroserviceRecord>(
            r#"
            SELECT id, tenant_id, service_type, created_at
            FROM microservices
            WHERE id = $1
            "#,
        )
        .bind(microservice_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_microservices_by_type(
        &self,
        service_type: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MicroserviceRecord>, EngineError> {
        let records = sqlx::query_as::<_, MicroserviceRecord>(
            r#"
            SELECT id, tenant_id, service_type, created_at
            FROM microservices
            WHERE service_type = $1
            ORDER BY id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(service_type)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn health_check_db(&self) -> Result<bool, EngineError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(true)
    }
}
