// Copyright (C) 2026 Tributary Contributors
// SPDX-License-Identifier: Apache-2.0

//! Webhook executor: processes one stored delivery.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::adapter::{
    ActivitySink, AdapterError, AdapterRegistry, PlatformAdapter, WebhookContext,
};
use crate::config::Config;
use crate::error::{EngineError, ErrorDetail};
use crate::persistence::{IntegrationRecord, Persistence, WebhookRecord, WebhookState};
use crate::queue::{QueueEmitter, QueueMessage};

/// Settings flag requesting one-time member-attribute setup before the
/// next webhook is processed.
const MEMBER_ATTRIBUTES_FLAG: &str = "updateMemberAttributes";

/// Consumes "process webhook" messages.
pub struct WebhookExecutor {
    store: Arc<dyn Persistence>,
    registry: Arc<AdapterRegistry>,
    emitter: Arc<dyn QueueEmitter>,
    sink: Arc<dyn ActivitySink>,
    config: Config,
}

impl WebhookExecutor {
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

    /// Handle one message. `force` bypasses the pending-state guard so
    /// operators can replay processed or failed deliveries;
    /// `fire_downstream_webhooks` is handed through to the adapter,
    /// false during replays that must not re-notify.
    pub async fn handle(
        &self,
        webhook_id: &str,
        force: bool,
        fire_downstream_webhooks: bool,
    ) -> Result<(), EngineError> {
        let Some(webhook) = self.store.find_webhook(webhook_id).await? else {
            warn!(webhook_id, "webhook not found, discarding message");
            return Ok(());
        };

        if !force && webhook.webhook_state() != Some(WebhookState::Pending) {
            debug!(webhook_id, state = %webhook.state, "webhook not pending, discarding message");
            return Ok(());
        }

        let Some(integration) = self.store.find_integration(&webhook.integration_id).await?
        else {
            let detail = ErrorDetail::new("Integration no longer exists!");
            warn!(webhook_id, integration_id = %webhook.integration_id, "abandoning webhook");
            self.store
                .mark_webhook_error(webhook_id, &detail.to_json())
                .await?;
            return Ok(());
        };

        let Some(adapter) = self.registry.get(&integration.platform) else {
            let detail = ErrorDetail::new(format!(
                "No adapter for platform '{}'!",
                integration.platform
            ));
            warn!(webhook_id, platform = %integration.platform, "abandoning webhook");
            self.store
                .mark_webhook_error(webhook_id, &detail.to_json())
                .await?;
            return Ok(());
        };

        let integration = self
            .run_member_attributes_setup(&adapter, integration)
            .await?;

        let payload: Value = match serde_json::from_str(&webhook.payload) {
            Ok(payload) => payload,
            Err(err) => {
                let detail = ErrorDetail::wrapping("Webhook payload is not valid JSON!", &err);
                warn!(webhook_id, "abandoning webhook with malformed payload");
                self.store
                    .mark_webhook_error(webhook_id, &detail.to_json())
                    .await?;
                return Ok(());
            }
        };

        let ctx = WebhookContext {
            integration,
            payload,
            fire_downstream_webhooks,
        };
        match adapter.process_webhook(&ctx).await {
            Ok(result) => {
                for operation in result.operations.iter().filter(|op| !op.is_empty()) {
                    if let Err(err) = self.sink.execute(&webhook.tenant_id, operation).await {
                        let detail = ErrorDetail::wrapping(
                            "Error while persisting webhook results!",
                            err.as_ref(),
                        );
                        self.store
                            .mark_webhook_error(webhook_id, &detail.to_json())
                            .await?;
                        return Ok(());
                    }
                }
                self.store.mark_webhook_processed(webhook_id).await?;
                debug!(webhook_id, "webhook processed");
                Ok(())
            }
            Err(AdapterError::RateLimited { reset_seconds }) => {
                // delivery stays pending; only the message is deferred
                info!(webhook_id, reset_seconds, "webhook rate limited, deferring");
                self.emitter
                    .emit_delayed(
                        QueueMessage::ProcessWebhook {
                            tenant_id: webhook.tenant_id.clone(),
                            webhook_id: webhook_id.to_string(),
                            force,
                            fire_downstream_webhooks,
                        },
                        Duration::from_secs(reset_seconds + self.config.rate_limit_buffer_secs),
                    )
                    .await?;
                Ok(())
            }
            Err(err) => {
                let detail = ErrorDetail::wrapping("Error while processing webhook!", &err);
                warn!(webhook_id, %err, "webhook processing failed");
                self.store
                    .mark_webhook_error(webhook_id, &detail.to_json())
                    .await?;
                Ok(())
            }
        }
    }

    /// One-shot member-attribute setup. When the integration's settings
    /// carry the flag, run the adapter hook and clear the flag so it
    /// never runs twice. Returns the (possibly refreshed) integration.
    async fn run_member_attributes_setup(
        &self,
        adapter: &Arc<dyn PlatformAdapter>,
        integration: IntegrationRecord,
    ) -> Result<IntegrationRecord, EngineError> {
        let mut settings: Value =
            serde_json::from_str(&integration.settings).unwrap_or_else(|_| Value::Object(Default::default()));
        if settings.get(MEMBER_ATTRIBUTES_FLAG).and_then(Value::as_bool) != Some(true) {
            return Ok(integration);
        }

        if let Err(err) = adapter.create_member_attributes(&integration).await {
            // leave the flag set; the next delivery tries again
            warn!(
                integration_id = %integration.id,
                %err,
                "member attribute setup failed, will retry on next webhook"
            );
            return Ok(integration);
        }

        settings[MEMBER_ATTRIBUTES_FLAG] = Value::Bool(false);
        let settings_json = settings.to_string();
        self.store
            .update_integration_settings(&integration.id, &settings_json)
            .await?;
        info!(integration_id = %integration.id, "member attributes created");

        Ok(IntegrationRecord {
            settings: settings_json,
            ..integration
        })
    }
}

/// Store a fresh delivery and enqueue it for processing. This is the
/// ingress seam an HTTP layer calls with a validated payload.
pub async fn receive_webhook(
    store: &Arc<dyn Persistence>,
    emitter: &Arc<dyn QueueEmitter>,
    integration_id: &str,
    payload: &Value,
) -> Result<String, EngineError> {
    let Some(integration) = store.find_integration(integration_id).await? else {
        return Err(EngineError::IntegrationNotFound {
            integration_id: integration_id.to_string(),
        });
    };

    let webhook = WebhookRecord {
        id: uuid::Uuid::new_v4().to_string(),
        tenant_id: integration.tenant_id.clone(),
        integration_id: integration.id.clone(),
        platform: integration.platform.clone(),
        state: WebhookState::Pending.as_str().to_string(),
        payload: payload.to_string(),
        processed_at: None,
        error: None,
        created_at: chrono::Utc::now(),
    };
    store.create_webhook(&webhook).await?;

    emitter
        .emit(QueueMessage::ProcessWebhook {
            tenant_id: webhook.tenant_id.clone(),
            webhook_id: webhook.id.clone(),
            force: false,
            fire_downstream_webhooks: true,
        })
        .await?;

    info!(
        webhook_id = %webhook.id,
        integration_id,
        platform = %integration.platform,
        "webhook accepted"
    );
    Ok(webhook.id)
}
