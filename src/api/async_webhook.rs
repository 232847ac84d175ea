use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::spawn;
use tracing::{error, info};
use uuid::Uuid;

use crate::metering::reconciler::ReconcileOutcome;
use crate::metering::usage::{CallbackOutcome, TranscriptionCallback, UsageService};

/// Webhook response - return 202 Accepted immediately
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookAcceptedResponse {
    pub status: String,
    pub message: String,
    pub webhook_id: String,
}

/// Settles transcription callbacks off the request path. Anything that fails
/// here is picked up again by the recovery sweep.
pub struct AsyncWebhookProcessor {
    usage: Arc<UsageService>,
}

impl AsyncWebhookProcessor {
    pub fn new(usage: Arc<UsageService>) -> Self {
        Self { usage }
    }

    /// Accept webhook and return 202 immediately
    pub fn process_transcription_async(&self, callback: TranscriptionCallback) -> WebhookAcceptedResponse {
        let usage = self.usage.clone();
        let webhook_id = Uuid::new_v4().to_string();
        let task_id = webhook_id.clone();

        spawn(async move {
            let provider_job_id = callback.job_id.clone();
            match usage.handle_transcription_callback(callback).await {
                Ok(CallbackOutcome::Reconciled(ReconcileOutcome::Reconciled { job, refunded, .. })) => {
                    info!(webhook_id = %task_id, job_id = %job.id, status = ?job.status, refunded, "✓ Transcription webhook settled")
                }
                Ok(CallbackOutcome::Reconciled(ReconcileOutcome::AlreadyReconciled { job })) => {
                    info!(webhook_id = %task_id, job_id = %job.id, "duplicate transcription webhook")
                }
                Ok(CallbackOutcome::Ignored { status }) => {
                    info!(webhook_id = %task_id, %provider_job_id, %status, "transcription webhook ignored")
                }
                Err(e) => {
                    error!(webhook_id = %task_id, %provider_job_id, "Webhook processing error: {}", e)
                }
            }
        });

        WebhookAcceptedResponse {
            status: "accepted".to_string(),
            message: "Webhook received and queued for processing".to_string(),
            webhook_id,
        }
    }
}
