use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::traits::*;
use crate::error::{AppError, AppResult, CreditError};

/// Header AssemblyAI echoes back on every webhook delivery
pub const WEBHOOK_AUTH_HEADER: &str = "x-transcription-webhook-secret";

#[derive(Debug, Serialize)]
struct SubmitBody<'a> {
    audio_url: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    sentiment_analysis: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook_auth_header_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook_auth_header_value: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

/// AssemblyAI speech-to-text over its v2 REST API
pub struct AssemblyAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    webhook_secret: Option<String>,
}

impl AssemblyAiClient {
    pub fn new(client: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            webhook_secret: None,
        }
    }

    /// Secret sent back in [`WEBHOOK_AUTH_HEADER`] with each callback
    pub fn with_webhook_secret(mut self, secret: &str) -> Self {
        self.webhook_secret = Some(secret.to_string()).filter(|s| !s.is_empty());
        self
    }

    fn submit_body<'a>(&'a self, request: &'a TranscriptionRequest) -> SubmitBody<'a> {
        let webhook_url = request.callback_url.as_deref();
        let secret = webhook_url.and(self.webhook_secret.as_deref());
        SubmitBody {
            audio_url: &request.media_url,
            sentiment_analysis: request.options.sentiment_analysis,
            webhook_url,
            webhook_auth_header_name: secret.map(|_| WEBHOOK_AUTH_HEADER),
            webhook_auth_header_value: secret,
        }
    }

    async fn checked(response: reqwest::Response) -> AppResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CreditError::ProviderUnavailable(format!("assemblyai returned {}: {}", status, body)).into())
    }
}

/// Map a transcript resource to our job state
pub fn transcript_state(transcript: Value) -> ProviderJobState {
    match transcript.get("status").and_then(|s| s.as_str()) {
        Some("completed") => ProviderJobState::Completed(ProviderResult {
            duration_secs: transcript.get("audio_duration").and_then(|d| d.as_f64()),
            enrichments: enrichments_in(&transcript),
            payload: transcript,
        }),
        Some("error") => ProviderJobState::Failed(
            transcript
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("transcription failed")
                .to_string(),
        ),
        _ => ProviderJobState::Pending,
    }
}

/// Shared-secret check for inbound transcription callbacks
pub struct CallbackAuth {
    secret: String,
}

impl CallbackAuth {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
        }
    }

    pub fn verify(&self, presented: Option<&str>) -> AppResult<()> {
        if self.secret.is_empty() {
            warn!("transcription webhook secret is not configured");
            return Err(AppError::Unauthorized);
        }
        let Some(presented) = presented else {
            warn!("transcription webhook without auth header");
            return Err(AppError::Unauthorized);
        };

        // Compare digests, not the raw secret
        if Sha256::digest(presented.as_bytes()) != Sha256::digest(self.secret.as_bytes()) {
            warn!("transcription webhook auth header mismatch");
            return Err(AppError::Unauthorized);
        }
        Ok(())
    }
}

#[async_trait]
impl TranscriptionProvider for AssemblyAiClient {
    fn name(&self) -> &'static str {
        "assemblyai"
    }

    async fn submit(&self, request: &TranscriptionRequest) -> AppResult<String> {
        let body = self.submit_body(request);

        let response = self
            .client
            .post(format!("{}/v2/transcript", self.base_url))
            .header("authorization", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let submitted: SubmitResponse = Self::checked(response).await?.json().await?;

        debug!(transcript_id = %submitted.id, "assemblyai transcript created");
        Ok(submitted.id)
    }

    async fn fetch(&self, provider_job_id: &str) -> AppResult<ProviderJobState> {
        let response = self
            .client
            .get(format!("{}/v2/transcript/{}", self.base_url, provider_job_id))
            .header("authorization", &self.api_key)
            .send()
            .await?;
        let transcript: Value = Self::checked(response).await?.json().await?;
        Ok(transcript_state(transcript))
    }
}
