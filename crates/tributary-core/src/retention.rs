// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Retention: removes terminal rows past the retention window.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::info;

use crate::config::Config;
use crate::error::EngineError;
use crate::persistence::Persistence;

/// What one retention pass deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Terminal runs deleted, streams included.
    pub runs: u64,
    /// Processed webhooks deleted.
    pub webhooks: u64,
    /// Webhooks deleted because their integration is gone.
    pub orphaned_webhooks: u64,
}

/// Deletes terminal runs (with their streams) and processed webhooks
/// whose completion predates the retention window, plus webhooks whose
/// integration no longer exists.
pub struct RetentionSweeper {
    store: Arc<dyn Persistence>,
    config: Config,
}

impl RetentionSweeper {
    /// New sweeper over the store.
    pub fn new(store: Arc<dyn Persistence>, config: Config) -> Self {
        Self { store, config }
    }

    /// Run one retention pass.
    pub async fn sweep(&self) -> Result<RetentionReport, EngineError> {
        let cutoff = Utc::now() - Duration::days(self.config.retention_days);

        let report = RetentionReport {
            runs: self.store.cleanup_runs_older_than(cutoff).await?,
            webhooks: self.store.cleanup_webhooks_older_than(cutoff).await?,
            orphaned_webhooks: self.store.delete_orphaned_webhooks().await?,
        };

        if report != RetentionReport::default() {
            info!(
                runs = report.runs,
                webhooks = report.webhooks,
                orphaned_webhooks = report.orphaned_webhooks,
                %cutoff,
                "retention pass deleted expired rows"
            );
        }
        Ok(report)
    }
}
