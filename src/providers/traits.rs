use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::metering::pricing::SENTIMENT_ANALYSIS;

/// Extras a caller can ask the transcription provider for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionOptions {
    #[serde(default)]
    pub sentiment_analysis: bool,
}

impl TranscriptionOptions {
    /// Surcharge keys implied by these options
    pub fn surcharges(&self) -> Vec<String> {
        let mut surcharges = Vec::new();
        if self.sentiment_analysis {
            surcharges.push(SENTIMENT_ANALYSIS.to_string());
        }
        surcharges
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionRequest {
    pub media_url: String,
    pub options: TranscriptionOptions,
    /// Where the provider should POST completion, if it supports callbacks
    pub callback_url: Option<String>,
}

/// Best-effort result of a finished provider job
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResult {
    /// Media length, when the provider reports it
    pub duration_secs: Option<f64>,
    /// Enrichments actually delivered, as surcharge keys
    pub enrichments: Vec<String>,
    pub payload: serde_json::Value,
}

/// Provider-side view of a job
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderJobState {
    Pending,
    Completed(ProviderResult),
    Failed(String),
}

impl ProviderJobState {
    pub fn is_pending(&self) -> bool {
        matches!(self, ProviderJobState::Pending)
    }
}

/// Speech-to-text vendor
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Submit media and return the provider's job id
    async fn submit(&self, request: &TranscriptionRequest) -> AppResult<String>;

    async fn fetch(&self, provider_job_id: &str) -> AppResult<ProviderJobState>;
}

/// Content-scraping vendor
#[async_trait]
pub trait ScrapeProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start a run and return the provider's run id
    async fn start_run(&self, input: &serde_json::Value) -> AppResult<String>;

    async fn run_state(&self, run_id: &str) -> AppResult<ProviderJobState>;
}

/// Enrichment keys present in a transcript payload
pub fn enrichments_in(payload: &serde_json::Value) -> Vec<String> {
    let mut found = Vec::new();
    let has_sentiment = payload
        .get("sentiment_analysis_results")
        .and_then(|v| v.as_array())
        .is_some_and(|results| !results.is_empty());
    if has_sentiment {
        found.push(SENTIMENT_ANALYSIS.to_string());
    }
    found
}
