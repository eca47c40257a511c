// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Queue message contracts and emitters.
//!
//! The engine assumes at-least-once delivery on three logical queues
//! (runs, streams, webhooks). [`QueueEmitter`] is the seam to an
//! external queue system; [`TokioQueue`] is the in-process
//! implementation used by the bundled worker and by tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::EngineError;

/// A message on one of the three executor queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueMessage {
    /// Execute a run: generate and enqueue its streams.
    ProcessRun {
        /// The run to execute.
        run_id: String,
        /// Replay only this stream instead of the whole run.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
    },
    /// Execute one stream.
    ProcessStream {
        /// The stream to execute.
        stream_id: String,
    },
    /// Execute one webhook.
    ProcessWebhook {
        /// Tenant the delivery belongs to.
        tenant_id: String,
        /// The webhook to execute.
        webhook_id: String,
        /// Bypass the pending-state guard (manual replay).
        force: bool,
        /// Whether outgoing notifications may fire while processing.
        #[serde(default = "default_true")]
        fire_downstream_webhooks: bool,
    },
}

fn default_true() -> bool {
    true
}

/// Emits messages onto the executor queues.
///
/// Delivery is at-least-once; consumers must tolerate duplicates.
#[async_trait]
pub trait QueueEmitter: Send + Sync {
    /// Emit a message for immediate delivery.
    async fn emit(&self, message: QueueMessage) -> Result<(), EngineError>;

    /// Emit a message that becomes visible after the delay.
    async fn emit_delayed(
        &self,
        message: QueueMessage,
        delay: Duration,
    ) -> Result<(), EngineError>;

    /// Queue health probe, polled by the scheduler every tick.
    async fn health_check(&self) -> Result<bool, EngineError> {
        Ok(true)
    }
}

/// Receiving halves of the three in-process queues.
pub struct QueueReceivers {
    /// "process run" messages.
    pub runs: mpsc::UnboundedReceiver<QueueMessage>,
    /// "process stream" messages.
    pub streams: mpsc::UnboundedReceiver<QueueMessage>,
    /// "process webhook" messages.
    pub webhooks: mpsc::UnboundedReceiver<QueueMessage>,
}

/// In-process queue backed by tokio channels.
///
/// Routes each message to its queue by variant. Delayed emission is a
/// spawned timer; a lost timer task is acceptable because the auditor
/// re-enqueues stuck work.
#[derive(Clone)]
pub struct TokioQueue {
    run_tx: mpsc::UnboundedSender<QueueMessage>,
    stream_tx: mpsc::UnboundedSender<QueueMessage>,
    webhook_tx: mpsc::UnboundedSender<QueueMessage>,
}

impl TokioQueue {
    /// Create the queue and its receiving halves.
    pub fn new() -> (Self, QueueReceivers) {
        let (run_tx, runs) = mpsc::unbounded_channel();
        let (stream_tx, streams) = mpsc::unbounded_channel();
        let (webhook_tx, webhooks) = mpsc::unbounded_channel();

        (
            Self {
                run_tx,
                stream_tx,
                webhook_tx,
            },
            QueueReceivers {
                runs,
                streams,
                webhooks,
            },
        )
    }

    fn sender(&self, message: &QueueMessage) -> &mpsc::UnboundedSender<QueueMessage> {
        match message {
            QueueMessage::ProcessRun { .. } => &self.run_tx,
            QueueMessage::ProcessStream { .. } => &self.stream_tx,
            QueueMessage::ProcessWebhook { .. } => &self.webhook_tx,
        }
    }
}

#[async_trait]
impl QueueEmitter for TokioQueue {
    async fn emit(&self, message: QueueMessage) -> Result<(), EngineError> {
        debug!(?message, "emitting queue message");
        if self.sender(&message).send(message).is_err() {
            warn!("queue receiver dropped, message discarded");
        }
        Ok(())
    }

    async fn emit_delayed(
        &self,
        message: QueueMessage,
        delay: Duration,
    ) -> Result<(), EngineError> {
        debug!(?message, ?delay, "emitting delayed queue message");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if queue.sender(&message).send(message).is_err() {
                warn!("queue receiver dropped, delayed message discarded");
            }
        });
        Ok(())
    }
}

/// Emitter that records instead of delivering. Test double for
/// everything that emits.
#[derive(Default)]
pub struct RecordingEmitter {
    emitted: Mutex<Vec<(QueueMessage, Option<Duration>)>>,
}

impl RecordingEmitter {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded messages with their delays, in emission order.
    pub fn emitted(&self) -> Vec<(QueueMessage, Option<Duration>)> {
        self.emitted.lock().expect("emitter lock poisoned").clone()
    }

    /// Recorded messages without delay information.
    pub fn messages(&self) -> Vec<QueueMessage> {
        self.emitted()
            .into_iter()
            .map(|(message, _)| message)
            .collect()
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.emitted.lock().expect("emitter lock poisoned").clear();
    }
}

#[async_trait]
impl QueueEmitter for RecordingEmitter {
    async fn emit(&self, message: QueueMessage) -> Result<(), EngineError> {
        self.emitted
            .lock()
            .expect("emitter lock poisoned")
            .push((message, None));
        Ok(())
    }

    async fn emit_delayed(
        &self,
        message: QueueMessage,
        delay: Duration,
    ) -> Result<(), EngineError> {
        self.emitted
            .lock()
            .expect("emitter lock poisoned")
            .push((message, Some(delay)));
        Ok(())
    }
}
