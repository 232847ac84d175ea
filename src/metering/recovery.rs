use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::reconciler::{JobOutcome, ReconcileOutcome, Reconciler};
use crate::error::{AppError, AppResult, CreditError};
use crate::ledger::models::{BillableJob, JobKind};
use crate::ledger::store::CreditStore;
use crate::providers::traits::{ProviderJobState, ScrapeProvider, TranscriptionProvider};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Jobs untouched for this long are re-checked
    pub stale_after: Duration,
    /// Jobs older than this that are still running are failed and refunded
    pub give_up_after: Duration,
    pub batch_size: i64,
    pub concurrency: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::minutes(10),
            give_up_after: Duration::minutes(60),
            batch_size: 200,
            concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub still_pending: usize,
    /// Finalized by someone else between listing and reconciling
    pub already_final: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovered {
    Completed,
    Failed,
    TimedOut,
    StillPending,
    AlreadyFinal,
}

/// Finds jobs stuck in queued/processing and settles them against the provider
pub struct RecoverySweep {
    store: Arc<dyn CreditStore>,
    reconciler: Arc<Reconciler>,
    transcription: Arc<dyn TranscriptionProvider>,
    scraper: Arc<dyn ScrapeProvider>,
    config: RecoveryConfig,
}

impl RecoverySweep {
    pub fn new(
        store: Arc<dyn CreditStore>,
        reconciler: Arc<Reconciler>,
        transcription: Arc<dyn TranscriptionProvider>,
        scraper: Arc<dyn ScrapeProvider>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            reconciler,
            transcription,
            scraper,
            config,
        }
    }

    /// One pass over stale jobs. `max_age` overrides the configured threshold.
    pub async fn run(&self, max_age: Option<Duration>) -> AppResult<SweepReport> {
        let threshold = max_age.unwrap_or(self.config.stale_after);
        let older_than = Utc::now() - threshold;
        let jobs = self
            .store
            .list_stale_jobs(older_than, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            scanned: jobs.len(),
            ..SweepReport::default()
        };
        if jobs.is_empty() {
            debug!("no stale jobs");
            return Ok(report);
        }

        let results: Vec<AppResult<Recovered>> = stream::iter(jobs)
            .map(|job| async move {
                let job_id = job.id;
                self.recover(job).await.map_err(|e| {
                    error!(%job_id, error = %e, "failed to recover job");
                    e
                })
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                Ok(Recovered::Completed) => report.completed += 1,
                Ok(Recovered::Failed) => report.failed += 1,
                Ok(Recovered::TimedOut) => report.timed_out += 1,
                Ok(Recovered::StillPending) => report.still_pending += 1,
                Ok(Recovered::AlreadyFinal) => report.already_final += 1,
                Err(_) => report.errors += 1,
            }
        }

        info!(
            scanned = report.scanned,
            completed = report.completed,
            failed = report.failed,
            timed_out = report.timed_out,
            still_pending = report.still_pending,
            errors = report.errors,
            "recovery sweep finished"
        );
        Ok(report)
    }

    async fn recover(&self, job: BillableJob) -> AppResult<Recovered> {
        let Some(provider_job_id) = job.provider_job_id.clone() else {
            // A submit may still be in flight; a short on-demand override never shortens this
            if Utc::now() - job.updated_at < self.config.stale_after {
                return Ok(Recovered::StillPending);
            }
            warn!(job_id = %job.id, "job never reached the provider");
            let outcome = self
                .reconciler
                .reconcile(&job, JobOutcome::failed("job was never submitted to the provider"))
                .await?;
            return Ok(Self::classify(&outcome, Recovered::Failed));
        };

        let state = match job.kind {
            JobKind::Transcription => self.transcription.fetch(&provider_job_id).await,
            JobKind::Scrape => self.scraper.run_state(&provider_job_id).await,
        };

        let state = match state {
            Ok(state) => state,
            Err(AppError::Credit(CreditError::ProviderUnavailable(message))) => {
                warn!(job_id = %job.id, %message, "provider unreachable during recovery");
                ProviderJobState::Pending
            }
            Err(e) => return Err(e),
        };

        let (outcome, on_success) = match state {
            ProviderJobState::Completed(result) => (
                JobOutcome::Completed {
                    duration_secs: result.duration_secs,
                    enrichments: result.enrichments,
                    result: Some(result.payload),
                },
                Recovered::Completed,
            ),
            ProviderJobState::Failed(reason) => (JobOutcome::failed(reason), Recovered::Failed),
            ProviderJobState::Pending => {
                let age = Utc::now() - job.created_at;
                if age < self.config.give_up_after {
                    return Ok(Recovered::StillPending);
                }
                (
                    JobOutcome::timed_out(format!("still running after {} minutes", age.num_minutes())),
                    Recovered::TimedOut,
                )
            }
        };

        let reconciled = self.reconciler.reconcile(&job, outcome).await?;
        Ok(Self::classify(&reconciled, on_success))
    }

    fn classify(outcome: &ReconcileOutcome, on_success: Recovered) -> Recovered {
        match outcome {
            ReconcileOutcome::Reconciled { .. } => on_success,
            ReconcileOutcome::AlreadyReconciled { .. } => Recovered::AlreadyFinal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::*;
    use crate::ledger::InMemoryLedger;
    use crate::metering::pricing::{CreditPricing, SENTIMENT_ANALYSIS};
    use crate::providers::stub::{completed, StubScraper, StubTranscription};
    use uuid::Uuid;

    struct Harness {
        store: Arc<InMemoryLedger>,
        transcription: Arc<StubTranscription>,
        sweep: RecoverySweep,
        account: Uuid,
    }

    async fn harness(balance: i64) -> Harness {
        let store = Arc::new(InMemoryLedger::new());
        let account = Uuid::new_v4();
        store.create_account(account, AccountTier::Free).await.unwrap();
        store.credit(account, balance, LedgerReason::Grant, None).await.unwrap();

        let transcription = Arc::new(StubTranscription::new());
        let reconciler = Arc::new(Reconciler::new(store.clone(), CreditPricing::default()));
        let sweep = RecoverySweep::new(
            store.clone(),
            reconciler,
            transcription.clone(),
            Arc::new(StubScraper::new(vec![])),
            RecoveryConfig::default(),
        );

        Harness {
            store,
            transcription,
            sweep,
            account,
        }
    }

    impl Harness {
        /// Pre-charged transcription job, optionally submitted, aged by `minutes`
        async fn job(&self, pre_charge: i64, provider_id: Option<&str>, surcharges: Vec<String>, minutes: i64) -> Uuid {
            let id = Uuid::new_v4();
            self.store
                .spend(&SpendRequest {
                    account_id: self.account,
                    amount: pre_charge,
                    reason: LedgerReason::Spend,
                    reference: Some(LedgerRef::new(RefType::TranscriptionJob, id.to_string())),
                })
                .await
                .unwrap();
            self.store
                .create_job(NewJob {
                    id,
                    account_id: self.account,
                    kind: JobKind::Transcription,
                    credits_pre_charged: pre_charge,
                    surcharges,
                })
                .await
                .unwrap();
            if let Some(provider_id) = provider_id {
                self.store.mark_processing(id, provider_id).await.unwrap();
            }
            self.store.age_job(id, Duration::minutes(minutes));
            id
        }

        async fn balance(&self) -> i64 {
            self.store.get_account(self.account).await.unwrap().unwrap().balance
        }

        async fn status(&self, job_id: Uuid) -> JobStatus {
            self.store.get_job(job_id).await.unwrap().unwrap().status
        }
    }

    #[tokio::test]
    async fn test_unsubmitted_job_fails_once() {
        let h = harness(2).await;
        let job = h.job(2, None, vec![], 15).await;
        assert_eq!(h.balance().await, 0);

        let first = h.sweep.run(None).await.unwrap();
        assert_eq!(first.scanned, 1);
        assert_eq!(first.failed, 1);
        assert_eq!(h.status(job).await, JobStatus::Failed);
        assert_eq!(h.balance().await, 2);

        let second = h.sweep.run(None).await.unwrap();
        assert_eq!(second, SweepReport::default());
        assert_eq!(h.balance().await, 2);
    }

    #[tokio::test]
    async fn test_completed_job_is_reconciled() {
        let h = harness(2).await;
        let job = h.job(2, Some("tr-a"), vec![], 15).await;
        h.transcription.set_state("tr-a", completed(Some(45.0), vec![]));

        let report = h.sweep.run(None).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(h.status(job).await, JobStatus::Completed);
        assert_eq!(h.balance().await, 1);
    }

    #[tokio::test]
    async fn test_missing_enrichment_does_not_block_completion() {
        let h = harness(3).await;
        let job = h
            .job(3, Some("tr-b"), vec![SENTIMENT_ANALYSIS.to_string()], 15)
            .await;
        h.transcription.set_state("tr-b", completed(Some(200.0), vec![]));

        let report = h.sweep.run(None).await.unwrap();
        assert_eq!(report.completed, 1);
        let job = h.store.get_job(job).await.unwrap().unwrap();
        assert_eq!(job.credits_final, Some(2));
        assert_eq!(h.balance().await, 1);
    }

    #[tokio::test]
    async fn test_provider_failure_refunds() {
        let h = harness(2).await;
        h.job(2, Some("tr-c"), vec![], 15).await;
        h.transcription
            .set_state("tr-c", ProviderJobState::Failed("unsupported codec".into()));

        let report = h.sweep.run(None).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(h.balance().await, 2);
    }

    #[tokio::test]
    async fn test_running_job_waits_then_times_out() {
        let h = harness(2).await;
        let job = h.job(2, Some("tr-d"), vec![], 15).await;

        let report = h.sweep.run(None).await.unwrap();
        assert_eq!(report.still_pending, 1);
        assert_eq!(h.status(job).await, JobStatus::Processing);

        h.store.age_job(job, Duration::minutes(60));
        let report = h.sweep.run(None).await.unwrap();
        assert_eq!(report.timed_out, 1);
        assert_eq!(h.status(job).await, JobStatus::Failed);
        assert_eq!(h.balance().await, 2);
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_left_alone() {
        let h = harness(2).await;
        let job = h.job(2, Some("tr-e"), vec![], 15).await;
        h.transcription.set_unreachable("tr-e");

        let report = h.sweep.run(None).await.unwrap();
        assert_eq!(report.still_pending, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(h.status(job).await, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_max_age_override() {
        let h = harness(2).await;
        h.job(2, Some("tr-e"), vec![], 2).await;
        h.transcription
            .set_state("tr-e", ProviderJobState::Failed("bad audio".into()));

        assert_eq!(h.sweep.run(None).await.unwrap().scanned, 0);
        assert_eq!(h.sweep.run(Some(Duration::minutes(1))).await.unwrap().failed, 1);
        assert_eq!(h.balance().await, 2);
    }

    #[tokio::test]
    async fn test_short_override_leaves_recent_unsubmitted_job() {
        let h = harness(2).await;
        let job = h.job(2, None, vec![], 2).await;

        let report = h.sweep.run(Some(Duration::minutes(1))).await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.still_pending, 1);
        assert_eq!(h.status(job).await, JobStatus::Queued);
        assert_eq!(h.balance().await, 0);

        // Stuck past the configured threshold it is failed and refunded
        h.store.age_job(job, Duration::minutes(15));
        assert_eq!(h.sweep.run(Some(Duration::minutes(1))).await.unwrap().failed, 1);
        assert_eq!(h.balance().await, 2);
    }
}
