use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::pricing::BillableOperation;
use super::reconciler::{JobOutcome, ReconcileOutcome, Reconciler};
use super::spend_gate::{ChargeReceipt, SpendGate};
use crate::error::{AppError, AppResult, CreditError};
use crate::ledger::models::*;
use crate::ledger::store::CreditStore;
use crate::providers::poll::PollPolicy;
use crate::providers::traits::*;

/// Completion notice posted by the transcription provider
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionCallback {
    /// Provider job id; our own job id is accepted too
    #[serde(alias = "transcript_id")]
    pub job_id: String,
    pub status: String,
    pub duration: Option<f64>,
    pub result_payload: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum CallbackOutcome {
    Reconciled(ReconcileOutcome),
    /// Non-terminal status, nothing to settle yet
    Ignored { status: String },
}

/// Billable actions: pre-charge, run the external work, reconcile.
pub struct UsageService {
    store: Arc<dyn CreditStore>,
    gate: Arc<SpendGate>,
    reconciler: Arc<Reconciler>,
    transcription: Arc<dyn TranscriptionProvider>,
    scraper: Arc<dyn ScrapeProvider>,
    poll_policy: PollPolicy,
    callback_url: Option<String>,
}

impl UsageService {
    pub fn new(
        store: Arc<dyn CreditStore>,
        gate: Arc<SpendGate>,
        reconciler: Arc<Reconciler>,
        transcription: Arc<dyn TranscriptionProvider>,
        scraper: Arc<dyn ScrapeProvider>,
        poll_policy: PollPolicy,
        callback_url: Option<String>,
    ) -> Self {
        Self {
            store,
            gate,
            reconciler,
            transcription,
            scraper,
            poll_policy,
            callback_url,
        }
    }

    /// Pre-charge and record a job. The charge is undone if the job row
    /// cannot be written.
    async fn open_job(
        &self,
        account_id: Uuid,
        kind: JobKind,
        amount: i64,
        surcharges: Vec<String>,
    ) -> AppResult<BillableJob> {
        let job_id = Uuid::new_v4();
        let ref_type = match kind {
            JobKind::Transcription => RefType::TranscriptionJob,
            JobKind::Scrape => RefType::ScrapeRun,
        };
        let reference = LedgerRef::new(ref_type, job_id.to_string());

        let receipt = self
            .gate
            .require(&SpendRequest {
                account_id,
                amount,
                reason: LedgerReason::Spend,
                reference: Some(reference.clone()),
            })
            .await?;

        let created = self
            .store
            .create_job(NewJob {
                id: job_id,
                account_id,
                kind,
                // Unlimited accounts were charged nothing, so nothing is refundable
                credits_pre_charged: receipt.charged,
                surcharges,
            })
            .await;

        match created {
            Ok(job) => Ok(job),
            Err(e) => {
                error!(%job_id, %account_id, error = %e, "failed to record job, returning pre-charge");
                if receipt.charged > 0 {
                    self.gate.refund(account_id, receipt.charged, Some(&reference)).await?;
                }
                Err(e)
            }
        }
    }

    async fn reload(&self, job_id: Uuid) -> AppResult<BillableJob> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {}", job_id)))
    }

    /// Charge the transcription ceiling, submit, and leave the job processing
    /// until the callback or the recovery sweep settles it.
    pub async fn start_transcription(
        &self,
        account_id: Uuid,
        media_url: &str,
        options: TranscriptionOptions,
    ) -> AppResult<BillableJob> {
        let surcharges = options.surcharges();
        let ceiling = self.reconciler.pricing().transcription_ceiling(&surcharges);
        let job = self
            .open_job(account_id, JobKind::Transcription, ceiling, surcharges)
            .await?;

        let request = TranscriptionRequest {
            media_url: media_url.to_string(),
            options,
            callback_url: self.callback_url.clone(),
        };

        let provider_job_id = match self.transcription.submit(&request).await {
            Ok(id) => id,
            Err(e) => {
                warn!(job_id = %job.id, provider = self.transcription.name(), error = %e, "transcription submit failed");
                self.reconciler.reconcile(&job, JobOutcome::failed(e.to_string())).await?;
                return Err(CreditError::ProviderUnavailable(e.to_string()).into());
            }
        };

        self.store.mark_processing(job.id, &provider_job_id).await?;
        info!(job_id = %job.id, %provider_job_id, "transcription submitted");
        self.reload(job.id).await
    }

    /// Run a scrape to completion within the poll budget
    pub async fn run_scrape(&self, account_id: Uuid, input: Value) -> AppResult<BillableJob> {
        let cost = self.reconciler.pricing().scrape_run_credits;
        let job = self.open_job(account_id, JobKind::Scrape, cost, Vec::new()).await?;

        let run_id = match self.scraper.start_run(&input).await {
            Ok(id) => id,
            Err(e) => {
                warn!(job_id = %job.id, provider = self.scraper.name(), error = %e, "scrape start failed");
                self.reconciler.reconcile(&job, JobOutcome::failed(e.to_string())).await?;
                return Err(CreditError::ProviderUnavailable(e.to_string()).into());
            }
        };
        self.store.mark_processing(job.id, &run_id).await?;

        let scraper = &self.scraper;
        let run = run_id.as_str();
        let polled = self
            .poll_policy
            .poll(move |_| async move {
                Ok::<_, AppError>(match scraper.run_state(run).await? {
                    ProviderJobState::Pending => None,
                    ProviderJobState::Completed(result) => Some(Ok(result)),
                    ProviderJobState::Failed(reason) => Some(Err(reason)),
                })
            })
            .await;

        match polled {
            Ok(Ok(result)) => {
                let outcome = JobOutcome::Completed {
                    duration_secs: result.duration_secs,
                    enrichments: result.enrichments,
                    result: Some(result.payload),
                };
                let reconciled = self.reconciler.reconcile(&job, outcome).await?;
                Ok(reconciled.job().clone())
            }
            Ok(Err(reason)) => {
                self.reconciler.reconcile(&job, JobOutcome::failed(reason.clone())).await?;
                Err(CreditError::ProviderUnavailable(reason).into())
            }
            Err(AppError::Credit(CreditError::Timeout { attempts })) => {
                warn!(job_id = %job.id, %run_id, attempts, "scrape poll budget exhausted");
                self.reconciler
                    .reconcile(&job, JobOutcome::timed_out(format!("no result after {} polls", attempts)))
                    .await?;
                Err(CreditError::Timeout { attempts }.into())
            }
            Err(e) => {
                self.reconciler.reconcile(&job, JobOutcome::failed(e.to_string())).await?;
                Err(e)
            }
        }
    }

    /// Flat charge for an action that completes in-request
    pub async fn charge_operation(
        &self,
        account_id: Uuid,
        operation: BillableOperation,
        reference_id: Option<String>,
    ) -> AppResult<ChargeReceipt> {
        let amount = self.reconciler.pricing().operation_cost(operation);
        let receipt = self
            .gate
            .require(&SpendRequest {
                account_id,
                amount,
                reason: LedgerReason::Spend,
                reference: reference_id.map(|id| LedgerRef::new(operation.ref_type(), id)),
            })
            .await?;
        info!(%account_id, ?operation, charged = receipt.charged, "operation charged");
        Ok(receipt)
    }

    /// Settle a transcription from its completion callback. When the callback
    /// omits the duration the provider is asked directly.
    pub async fn handle_transcription_callback(
        &self,
        callback: TranscriptionCallback,
    ) -> AppResult<CallbackOutcome> {
        let job = self.find_callback_job(&callback.job_id).await?;

        let outcome = match callback.status.as_str() {
            "completed" => self.completed_outcome(&job, callback).await?,
            "error" | "failed" => {
                let reason = callback
                    .result_payload
                    .as_ref()
                    .and_then(|p| p.get("error"))
                    .and_then(|e| e.as_str())
                    .unwrap_or("provider reported an error")
                    .to_string();
                JobOutcome::failed(reason)
            }
            _ => {
                info!(job_id = %job.id, status = %callback.status, "ignoring non-terminal callback");
                return Ok(CallbackOutcome::Ignored { status: callback.status });
            }
        };

        Ok(CallbackOutcome::Reconciled(self.reconciler.reconcile(&job, outcome).await?))
    }

    /// Only transcription jobs are settled by callback
    async fn find_callback_job(&self, id: &str) -> AppResult<BillableJob> {
        let mut job = self.store.find_job_by_provider_id(id).await?;
        if job.is_none() {
            if let Ok(job_id) = Uuid::parse_str(id) {
                job = self.store.get_job(job_id).await?;
            }
        }

        match job {
            Some(job) if job.kind == JobKind::Transcription => Ok(job),
            Some(job) => {
                warn!(job_id = %job.id, kind = ?job.kind, "transcription callback for a non-transcription job");
                Err(AppError::InvalidInput(format!("Job {} is not a transcription", job.id)))
            }
            None => Err(AppError::NotFound(format!("Job for provider id {}", id))),
        }
    }

    async fn completed_outcome(&self, job: &BillableJob, callback: TranscriptionCallback) -> AppResult<JobOutcome> {
        if let (Some(duration), Some(payload)) = (callback.duration, &callback.result_payload) {
            return Ok(JobOutcome::Completed {
                duration_secs: Some(duration),
                enrichments: enrichments_in(payload),
                result: callback.result_payload,
            });
        }

        let provider_job_id = job.provider_job_id.as_deref().unwrap_or(callback.job_id.as_str());
        match self.transcription.fetch(provider_job_id).await? {
            ProviderJobState::Completed(result) => Ok(JobOutcome::Completed {
                duration_secs: result.duration_secs.or(callback.duration),
                enrichments: result.enrichments,
                result: Some(result.payload),
            }),
            ProviderJobState::Failed(reason) => Ok(JobOutcome::failed(reason)),
            // Provider disagrees with its own callback; settle at the pre-charge
            ProviderJobState::Pending => Ok(JobOutcome::Completed {
                duration_secs: callback.duration,
                enrichments: callback.result_payload.as_ref().map(enrichments_in).unwrap_or_default(),
                result: callback.result_payload,
            }),
        }
    }
}
