use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::pricing::CreditPricing;
use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::ledger::store::CreditStore;

/// How an external job ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        /// Unknown duration settles at the pre-charge
        duration_secs: Option<f64>,
        /// Enrichments actually delivered
        enrichments: Vec<String>,
        result: Option<Value>,
    },
    Failed {
        reason: String,
        timed_out: bool,
    },
}

impl JobOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        JobOutcome::Failed {
            reason: reason.into(),
            timed_out: false,
        }
    }

    pub fn timed_out(reason: impl Into<String>) -> Self {
        JobOutcome::Failed {
            reason: reason.into(),
            timed_out: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    Reconciled {
        job: BillableJob,
        credits_final: i64,
        refunded: i64,
    },
    /// The job was already terminal; nothing was written
    AlreadyReconciled { job: BillableJob },
}

impl ReconcileOutcome {
    pub fn job(&self) -> &BillableJob {
        match self {
            ReconcileOutcome::Reconciled { job, .. } => job,
            ReconcileOutcome::AlreadyReconciled { job } => job,
        }
    }

    pub fn refunded(&self) -> i64 {
        match self {
            ReconcileOutcome::Reconciled { refunded, .. } => *refunded,
            ReconcileOutcome::AlreadyReconciled { .. } => 0,
        }
    }
}

/// Settles pre-charged jobs against their actual cost
pub struct Reconciler {
    store: Arc<dyn CreditStore>,
    pricing: CreditPricing,
}

impl Reconciler {
    pub fn new(store: Arc<dyn CreditStore>, pricing: CreditPricing) -> Self {
        Self { store, pricing }
    }

    pub fn pricing(&self) -> &CreditPricing {
        &self.pricing
    }

    /// Credits the job should cost, never more than what was pre-charged
    pub fn final_cost(&self, job: &BillableJob, outcome: &JobOutcome) -> i64 {
        let cost = match outcome {
            JobOutcome::Failed { .. } => 0,
            JobOutcome::Completed { duration_secs, enrichments, .. } => match (job.kind, duration_secs) {
                (JobKind::Transcription, Some(duration)) if duration.is_finite() && *duration >= 0.0 => self
                    .pricing
                    .transcription_cost(*duration, &job.surcharges, enrichments),
                _ => job.credits_pre_charged,
            },
        };
        cost.min(job.credits_pre_charged)
    }

    /// Finalize the job and refund any overcharge exactly once
    pub async fn reconcile(&self, job: &BillableJob, outcome: JobOutcome) -> AppResult<ReconcileOutcome> {
        if job.status.is_terminal() {
            warn!(job_id = %job.id, status = ?job.status, "job already reconciled");
            return Ok(ReconcileOutcome::AlreadyReconciled { job: job.clone() });
        }

        let credits_final = self.final_cost(job, &outcome);
        let finalization = match outcome {
            JobOutcome::Completed { result, .. } => JobFinalization {
                status: JobStatus::Completed,
                credits_final,
                result_payload: result,
                error_message: None,
            },
            JobOutcome::Failed { reason, timed_out } => JobFinalization {
                status: JobStatus::Failed,
                credits_final,
                result_payload: None,
                error_message: Some(if timed_out {
                    format!("timeout: {}", reason)
                } else {
                    reason
                }),
            },
        };

        match self.store.finalize_job(job.id, finalization).await? {
            FinalizeOutcome::Finalized { job, refunded } => {
                info!(
                    job_id = %job.id,
                    account_id = %job.account_id,
                    status = ?job.status,
                    pre_charged = job.credits_pre_charged,
                    credits_final,
                    refunded,
                    "job reconciled"
                );
                Ok(ReconcileOutcome::Reconciled {
                    job,
                    credits_final,
                    refunded,
                })
            }
            FinalizeOutcome::AlreadyFinal(job) => {
                warn!(job_id = %job.id, "job reconciled concurrently, skipping");
                Ok(ReconcileOutcome::AlreadyReconciled { job })
            }
        }
    }

    pub async fn reconcile_by_id(&self, job_id: Uuid, outcome: JobOutcome) -> AppResult<ReconcileOutcome> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {}", job_id)))?;
        self.reconcile(&job, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::metering::pricing::SENTIMENT_ANALYSIS;

    async fn setup(
        balance: i64,
        kind: JobKind,
        pre_charge: i64,
        surcharges: Vec<String>,
    ) -> (Reconciler, Arc<InMemoryLedger>, BillableJob) {
        let store = Arc::new(InMemoryLedger::new());
        let account = Uuid::new_v4();
        store.create_account(account, AccountTier::Free).await.unwrap();
        store.credit(account, balance, LedgerReason::Grant, None).await.unwrap();

        let job_id = Uuid::new_v4();
        let spent = store
            .spend(&SpendRequest {
                account_id: account,
                amount: pre_charge,
                reason: LedgerReason::Spend,
                reference: Some(LedgerRef::new(RefType::TranscriptionJob, job_id.to_string())),
            })
            .await
            .unwrap();
        assert!(spent.is_ok());

        let job = store
            .create_job(NewJob {
                id: job_id,
                account_id: account,
                kind,
                credits_pre_charged: pre_charge,
                surcharges,
            })
            .await
            .unwrap();

        (Reconciler::new(store.clone(), CreditPricing::default()), store, job)
    }

    async fn balance(store: &InMemoryLedger, job: &BillableJob) -> i64 {
        store.get_account(job.account_id).await.unwrap().unwrap().balance
    }

    fn completed(duration: Option<f64>, enrichments: Vec<String>) -> JobOutcome {
        JobOutcome::Completed {
            duration_secs: duration,
            enrichments,
            result: None,
        }
    }

    #[tokio::test]
    async fn test_short_clip_refunds_difference_once() {
        let (reconciler, store, job) = setup(5, JobKind::Transcription, 2, vec![]).await;
        assert_eq!(balance(&store, &job).await, 3);

        let first = reconciler.reconcile(&job, completed(Some(45.0), vec![])).await.unwrap();
        assert_eq!(first.refunded(), 1);
        assert_eq!(first.job().status, JobStatus::Completed);
        assert_eq!(first.job().credits_final, Some(1));
        assert_eq!(balance(&store, &job).await, 4);

        // Stale copy of the job still says queued; the store lock decides
        let second = reconciler.reconcile(&job, completed(Some(45.0), vec![])).await.unwrap();
        assert!(matches!(second, ReconcileOutcome::AlreadyReconciled { .. }));
        assert_eq!(balance(&store, &job).await, 4);

        let refunds = store
            .list_entries(job.account_id, 50)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.reason == LedgerReason::Refund)
            .count();
        assert_eq!(refunds, 1);
    }

    #[tokio::test]
    async fn test_failed_job_refunds_everything() {
        let (reconciler, store, job) = setup(1, JobKind::Transcription, 1, vec![]).await;
        assert_eq!(balance(&store, &job).await, 0);

        let outcome = reconciler
            .reconcile_by_id(job.id, JobOutcome::failed("provider rejected media"))
            .await
            .unwrap();

        assert_eq!(outcome.refunded(), 1);
        assert_eq!(outcome.job().status, JobStatus::Failed);
        assert_eq!(outcome.job().error_message.as_deref(), Some("provider rejected media"));
        assert_eq!(balance(&store, &job).await, 1);
        assert!(store.consistency(job.account_id).await.unwrap().unwrap().consistent);
    }

    #[tokio::test]
    async fn test_sentiment_charged_only_when_delivered() {
        let requested = vec![SENTIMENT_ANALYSIS.to_string()];
        let (reconciler, store, job) = setup(3, JobKind::Transcription, 3, requested.clone()).await;

        // Long clip without sentiment delivered: 2 of 3
        let outcome = reconciler.reconcile(&job, completed(Some(300.0), vec![])).await.unwrap();
        assert_eq!(outcome.refunded(), 1);
        assert_eq!(balance(&store, &job).await, 1);

        let (reconciler, _, job) = setup(3, JobKind::Transcription, 3, requested.clone()).await;
        let outcome = reconciler.reconcile(&job, completed(Some(300.0), requested)).await.unwrap();
        assert_eq!(outcome.refunded(), 0);
    }

    #[tokio::test]
    async fn test_unknown_duration_keeps_pre_charge() {
        let (reconciler, store, job) = setup(2, JobKind::Transcription, 2, vec![]).await;

        let outcome = reconciler.reconcile(&job, completed(None, vec![])).await.unwrap();
        assert_eq!(outcome.refunded(), 0);
        assert_eq!(outcome.job().credits_final, Some(2));
        assert_eq!(balance(&store, &job).await, 0);
    }

    #[tokio::test]
    async fn test_cost_above_pre_charge_is_not_collected() {
        // Pre-charged below the ceiling, e.g. after a pricing change
        let (reconciler, store, job) = setup(1, JobKind::Transcription, 1, vec![]).await;

        let outcome = reconciler.reconcile(&job, completed(Some(600.0), vec![])).await.unwrap();
        assert_eq!(outcome.refunded(), 0);
        assert_eq!(outcome.job().credits_final, Some(1));
        assert_eq!(balance(&store, &job).await, 0);
    }

    #[tokio::test]
    async fn test_scrape_settles_at_pre_charge() {
        let (reconciler, _, job) = setup(1, JobKind::Scrape, 1, vec![]).await;
        let outcome = reconciler.reconcile(&job, completed(Some(10.0), vec![])).await.unwrap();
        assert_eq!(outcome.refunded(), 0);

        let (reconciler, _, job) = setup(1, JobKind::Scrape, 1, vec![]).await;
        let outcome = reconciler.reconcile(&job, JobOutcome::timed_out("60 polls")).await.unwrap();
        assert_eq!(outcome.refunded(), 1);
        assert_eq!(outcome.job().error_message.as_deref(), Some("timeout: 60 polls"));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let store = Arc::new(InMemoryLedger::new());
        let reconciler = Reconciler::new(store, CreditPricing::default());
        let err = reconciler
            .reconcile_by_id(Uuid::new_v4(), JobOutcome::failed("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
