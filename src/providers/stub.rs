//! Scriptable providers for tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use super::traits::*;
use crate::error::{AppResult, CreditError};

pub fn completed(duration_secs: Option<f64>, enrichments: Vec<String>) -> ProviderJobState {
    ProviderJobState::Completed(ProviderResult {
        duration_secs,
        enrichments,
        payload: json!({ "text": "hello world" }),
    })
}

#[derive(Default)]
pub struct StubTranscription {
    next_id: AtomicU32,
    fail_submit: AtomicBool,
    states: Mutex<HashMap<String, ProviderJobState>>,
    unreachable: Mutex<HashSet<String>>,
    pub submitted: Mutex<Vec<TranscriptionRequest>>,
}

impl StubTranscription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let stub = Self::default();
        stub.fail_submit.store(true, Ordering::SeqCst);
        stub
    }

    pub fn set_state(&self, provider_job_id: &str, state: ProviderJobState) {
        self.states.lock().insert(provider_job_id.to_string(), state);
    }

    pub fn set_unreachable(&self, provider_job_id: &str) {
        self.unreachable.lock().insert(provider_job_id.to_string());
    }
}

#[async_trait]
impl TranscriptionProvider for StubTranscription {
    fn name(&self) -> &'static str {
        "stub-transcription"
    }

    async fn submit(&self, request: &TranscriptionRequest) -> AppResult<String> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(CreditError::ProviderUnavailable("stub submit failure".into()).into());
        }
        self.submitted.lock().push(request.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("tr-{}", n))
    }

    async fn fetch(&self, provider_job_id: &str) -> AppResult<ProviderJobState> {
        if self.unreachable.lock().contains(provider_job_id) {
            return Err(CreditError::ProviderUnavailable("stub unreachable".into()).into());
        }
        Ok(self
            .states
            .lock()
            .get(provider_job_id)
            .cloned()
            .unwrap_or(ProviderJobState::Pending))
    }
}

/// Replays a script of run states; the last one repeats
#[derive(Default)]
pub struct StubScraper {
    next_id: AtomicU32,
    fail_start: AtomicBool,
    script: Mutex<VecDeque<ProviderJobState>>,
    pub polls: AtomicU32,
}

impl StubScraper {
    pub fn new(script: Vec<ProviderJobState>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        let stub = Self::default();
        stub.fail_start.store(true, Ordering::SeqCst);
        stub
    }
}

#[async_trait]
impl ScrapeProvider for StubScraper {
    fn name(&self) -> &'static str {
        "stub-scraper"
    }

    async fn start_run(&self, _input: &serde_json::Value) -> AppResult<String> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(CreditError::ProviderUnavailable("stub start failure".into()).into());
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("run-{}", n))
    }

    async fn run_state(&self, _run_id: &str) -> AppResult<ProviderJobState> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock();
        let state = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        Ok(state.unwrap_or(ProviderJobState::Pending))
    }
}
