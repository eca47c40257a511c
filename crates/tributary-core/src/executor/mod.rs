// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Queue consumers: one executor per message kind.
//!
//! Every executor starts with a state guard (discard if the row is not
//! in an expected state), which is what makes at-least-once delivery
//! safe. Executors hold no cross-row locks; all safety comes from the
//! store's atomic single-row transitions.

pub mod run;
pub mod stream;
pub mod webhook;

pub use self::run::RunExecutor;
pub use self::stream::StreamExecutor;
pub use self::webhook::{WebhookExecutor, receive_webhook};

use std::sync::Arc;

use tracing::warn;

use crate::error::EngineError;
use crate::persistence::{Persistence, RunState};

/// Mirror a run state transition onto the owning integration's status:
/// in-progress while the run works, done/error when it settles.
/// Microservice-owned runs pass `None` and are a no-op.
pub(crate) async fn sync_integration_status(
    store: &Arc<dyn Persistence>,
    integration_id: Option<&str>,
    run_state: RunState,
) -> Result<(), EngineError> {
    let Some(integration_id) = integration_id else {
        return Ok(());
    };
    let status = match run_state {
        RunState::Processing => "in-progress",
        RunState::Processed => "done",
        RunState::Error => "error",
        _ => return Ok(()),
    };

    match store.update_integration_status(integration_id, status).await {
        Ok(()) => Ok(()),
        Err(EngineError::RowCountMismatch { .. }) => {
            // integration row vanished mid-run
            warn!(integration_id, status, "integration gone, status not updated");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
