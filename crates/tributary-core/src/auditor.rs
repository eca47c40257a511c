// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Stuck-state auditor.
//!
//! Periodic sweep that finds work the pipeline lost (crashed workers,
//! dropped messages, wedged integrations) and pushes it back in. Every
//! repair goes through the normal delayed-run promotion path so the
//! re-enqueue survives a crash mid-sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use crate::adapter::AdapterRegistry;
use crate::config::Config;
use crate::error::EngineError;
use crate::persistence::{Persistence, RunRecord, RunState, StreamState};
use crate::queue::{QueueEmitter, QueueMessage};

/// Delay applied to repaired runs. Long enough to outlive whatever
/// in-flight message might still touch the row, short enough that the
/// next scheduler tick picks it up.
const STUCK_REQUEUE_DELAY_SECS: i64 = 5;

/// What one audit sweep repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Wedged integrations restarted.
    pub restarted_integrations: usize,
    /// Stale runs re-queued.
    pub requeued_runs: usize,
    /// Runs settled into a terminal state by the sweep.
    pub settled_runs: usize,
    /// Runs flagged for an operator because no automatic repair applies.
    pub flagged_runs: usize,
    /// Stale pending webhooks re-enqueued.
    pub requeued_webhooks: usize,
}

/// Detects and repairs stuck runs, streams, and webhooks.
pub struct StuckAuditor {
    store: Arc<dyn Persistence>,
    registry: Arc<AdapterRegistry>,
    emitter: Arc<dyn QueueEmitter>,
    config: Config,
    sweeping: AtomicBool,
}

impl StuckAuditor {
    /// New auditor over the given collaborators.
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
            sweeping: AtomicBool::new(false),
        }
    }

    /// Run one full sweep. A sweep already in progress makes this a
    /// no-op; sweeps never overlap.
    pub async fn sweep(&self) -> Result<SweepReport, EngineError> {
        if self.sweeping.swap(true, Ordering::SeqCst) {
            warn!("audit sweep already in progress, skipping");
            return Ok(SweepReport::default());
        }

        let result = self.sweep_inner().await;
        self.sweeping.store(false, Ordering::SeqCst);
        result
    }

    async fn sweep_inner(&self) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();

        // sub-sweeps are isolated: one failing leaves the others done
        let (integrations, runs, webhooks) = tokio::join!(
            self.sweep_integrations(),
            self.sweep_runs(),
            self.sweep_webhooks(),
        );

        match integrations {
            Ok(restarted) => report.restarted_integrations = restarted,
            Err(err) => error!(%err, "integration sweep failed"),
        }
        match runs {
            Ok((requeued, settled, flagged)) => {
                report.requeued_runs = requeued;
                report.settled_runs = settled;
                report.flagged_runs = flagged;
            }
            Err(err) => error!(%err, "run sweep failed"),
        }
        match webhooks {
            Ok(requeued) => report.requeued_webhooks = requeued,
            Err(err) => error!(%err, "webhook sweep failed"),
        }

        if report != SweepReport::default() {
            info!(
                restarted_integrations = report.restarted_integrations,
                requeued_runs = report.requeued_runs,
                settled_runs = report.settled_runs,
                flagged_runs = report.flagged_runs,
                requeued_webhooks = report.requeued_webhooks,
                "audit sweep repaired stuck work"
            );
        }
        Ok(report)
    }

    /// Integrations stuck "in-progress" whose last run ended in a
    /// terminal state without producing any streams. That shape means
    /// stream generation died before its first insert; restart the run.
    async fn sweep_integrations(&self) -> Result<usize, EngineError> {
        let mut restarted = 0usize;

        for platform in self.registry.platforms() {
            let mut offset = 0i64;
            loop {
                let page = self
                    .store
                    .find_integrations_by_platform(
                        &platform,
                        &["in-progress"],
                        self.config.page_size,
                        offset,
                    )
                    .await?;
                let page_len = page.len();

                for integration in page {
                    let Some(run) = self
                        .store
                        .find_last_run_for_integration(&integration.id)
                        .await?
                    else {
                        continue;
                    };
                    let terminal = matches!(
                        run.run_state(),
                        Some(RunState::Processed)
                            | Some(RunState::Error)
                            | Some(RunState::IntegrationDeleted)
                    );
                    if !terminal {
                        continue;
                    }
                    if !self.store.find_streams_for_run(&run.id).await?.is_empty() {
                        continue;
                    }

                    warn!(
                        integration_id = %integration.id,
                        run_id = %run.id,
                        "integration wedged in-progress, restarting last run"
                    );
                    self.requeue_run(&run.id).await?;
                    restarted += 1;
                }

                if (page_len as i64) < self.config.page_size {
                    break;
                }
                offset += self.config.page_size;
            }
        }

        Ok(restarted)
    }

    /// Runs sitting in pending/processing past the stuck threshold.
    /// Repairing a run removes it from the scan, so every page is read
    /// at offset zero.
    async fn sweep_runs(&self) -> Result<(usize, usize, usize), EngineError> {
        let cutoff = Utc::now() - Duration::hours(self.config.stuck_threshold_hours);
        let mut requeued = 0usize;
        let mut settled = 0usize;
        let mut flagged = 0usize;

        loop {
            let page = self
                .store
                .find_stale_runs(
                    &["pending", "processing"],
                    cutoff,
                    self.config.page_size,
                    0,
                )
                .await?;
            let page_len = page.len();
            if page_len == 0 {
                break;
            }

            for run in page {
                match self.repair_run(&run).await? {
                    RunRepair::Requeued => requeued += 1,
                    RunRepair::Settled => settled += 1,
                    RunRepair::Flagged => flagged += 1,
                }
            }

            if (page_len as i64) < self.config.page_size {
                break;
            }
        }

        Ok((requeued, settled, flagged))
    }

    async fn repair_run(&self, run: &RunRecord) -> Result<RunRepair, EngineError> {
        let streams = self.store.find_streams_for_run(&run.id).await?;

        let has_processing = streams
            .iter()
            .any(|s| s.stream_state() == Some(StreamState::Processing));
        let has_pending = streams
            .iter()
            .any(|s| s.stream_state() == Some(StreamState::Pending));
        let has_retryable_error = streams.iter().any(|s| {
            s.stream_state() == Some(StreamState::Error)
                && s.retries.unwrap_or(0) < self.config.max_retries
        });

        if has_processing {
            // worker died mid-stream; hand the streams back first
            let reset = self.store.reset_processing_streams_of_run(&run.id).await?;
            warn!(run_id = %run.id, reset, "stale run with processing streams, re-queueing");
            self.requeue_run(&run.id).await?;
            return Ok(RunRepair::Requeued);
        }
        if has_pending || has_retryable_error {
            warn!(run_id = %run.id, "stale run with unfinished streams, re-queueing");
            self.requeue_run(&run.id).await?;
            return Ok(RunRepair::Requeued);
        }

        // every stream is terminal; the completion recompute was lost
        let state = self
            .store
            .touch_run_state(&run.id, self.config.max_retries)
            .await?;
        if matches!(state, RunState::Processed | RunState::Error) {
            crate::executor::sync_integration_status(
                &self.store,
                run.integration_id.as_deref(),
                state,
            )
            .await?;
            info!(run_id = %run.id, %state, "stale run settled");
            Ok(RunRepair::Settled)
        } else {
            // no automatic repair applies; an operator has to look
            error!(run_id = %run.id, %state, "stale run requires manual intervention");
            Ok(RunRepair::Flagged)
        }
    }

    /// Delay the run briefly; the scheduler's promotion pass restarts
    /// and re-enqueues it durably.
    async fn requeue_run(&self, run_id: &str) -> Result<(), EngineError> {
        self.store
            .delay_run(run_id, Utc::now() + Duration::seconds(STUCK_REQUEUE_DELAY_SECS))
            .await?;
        Ok(())
    }

    /// Pending webhooks older than the stuck threshold get their
    /// message re-emitted. Re-enqueueing leaves the row pending, so
    /// this scan has to advance its offset.
    async fn sweep_webhooks(&self) -> Result<usize, EngineError> {
        let cutoff = Utc::now() - Duration::hours(self.config.stuck_threshold_hours);
        let mut requeued = 0usize;
        let mut offset = 0i64;

        loop {
            let page = self
                .store
                .find_stale_pending_webhooks(cutoff, self.config.webhook_page_size, offset)
                .await?;
            let page_len = page.len();

            for webhook in page {
                warn!(webhook_id = %webhook.id, "stale pending webhook, re-enqueueing");
                self.emitter
                    .emit(QueueMessage::ProcessWebhook {
                        tenant_id: webhook.tenant_id,
                        webhook_id: webhook.id,
                        force: false,
                        fire_downstream_webhooks: true,
                    })
                    .await?;
                requeued += 1;
            }

            if (page_len as i64) < self.config.webhook_page_size {
                break;
            }
            offset += self.config.webhook_page_size;
        }

        Ok(requeued)
    }
}

enum RunRepair {
    Requeued,
    Settled,
    Flagged,
}
