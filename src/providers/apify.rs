use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::traits::*;
use crate::error::{AppResult, CreditError};

#[derive(Debug, Deserialize)]
struct RunEnvelope {
    data: RunData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunData {
    id: String,
    status: String,
    default_dataset_id: Option<String>,
}

/// Apify actor runs over the v2 REST API
pub struct ApifyClient {
    client: Client,
    base_url: String,
    token: String,
    actor_id: String,
}

impl ApifyClient {
    pub fn new(client: Client, base_url: &str, token: &str, actor_id: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            actor_id: actor_id.to_string(),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: String) -> AppResult<T> {
        let response = self
            .client
            .get(url)
            .query(&[("token", self.token.as_str())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CreditError::ProviderUnavailable(format!("apify returned {}", status)).into());
        }
        Ok(response.json().await?)
    }

    async fn dataset_items(&self, dataset_id: &str) -> AppResult<Value> {
        self.get_json(format!("{}/v2/datasets/{}/items", self.base_url, dataset_id))
            .await
    }
}

enum RunPhase {
    Running,
    Succeeded,
    Failed,
}

fn run_phase(status: &str) -> RunPhase {
    match status {
        "SUCCEEDED" => RunPhase::Succeeded,
        "FAILED" | "ABORTED" | "TIMED-OUT" | "TIMED_OUT" => RunPhase::Failed,
        // READY, RUNNING, ABORTING, TIMING-OUT
        _ => RunPhase::Running,
    }
}

#[async_trait]
impl ScrapeProvider for ApifyClient {
    fn name(&self) -> &'static str {
        "apify"
    }

    async fn start_run(&self, input: &Value) -> AppResult<String> {
        let response = self
            .client
            .post(format!("{}/v2/acts/{}/runs", self.base_url, self.actor_id))
            .query(&[("token", self.token.as_str())])
            .json(input)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CreditError::ProviderUnavailable(format!("apify returned {}", status)).into());
        }

        let run: RunEnvelope = response.json().await?;
        debug!(run_id = %run.data.id, actor = %self.actor_id, "apify run started");
        Ok(run.data.id)
    }

    async fn run_state(&self, run_id: &str) -> AppResult<ProviderJobState> {
        let run: RunEnvelope = self
            .get_json(format!("{}/v2/actor-runs/{}", self.base_url, run_id))
            .await?;

        match run_phase(&run.data.status) {
            RunPhase::Running => Ok(ProviderJobState::Pending),
            RunPhase::Failed => Ok(ProviderJobState::Failed(format!("apify run {}", run.data.status))),
            RunPhase::Succeeded => {
                let payload = match run.data.default_dataset_id.as_deref() {
                    Some(dataset_id) => match self.dataset_items(dataset_id).await {
                        Ok(items) => items,
                        Err(e) => {
                            warn!(%run_id, error = %e, "dataset fetch failed, returning its id");
                            json!({ "dataset_id": dataset_id })
                        }
                    },
                    None => json!({ "run_id": run.data.id }),
                };
                Ok(ProviderJobState::Completed(ProviderResult {
                    duration_secs: None,
                    enrichments: Vec::new(),
                    payload,
                }))
            }
        }
    }
}
