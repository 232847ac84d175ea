use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::*;
use crate::error::AppResult;

/// Persistence seam for the credit ledger.
///
/// Every mutating method is atomic: it either applies its balance change
/// together with the matching ledger entry, or changes nothing.
#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Open an account with a zero balance
    async fn create_account(&self, account_id: Uuid, tier: AccountTier) -> AppResult<Account>;

    async fn get_account(&self, account_id: Uuid) -> AppResult<Option<Account>>;

    async fn set_tier(&self, account_id: Uuid, tier: AccountTier) -> AppResult<Account>;

    /// Check-and-decrement. Rejections leave the account untouched.
    async fn spend(&self, request: &SpendRequest) -> AppResult<SpendOutcome>;

    /// Add credits, creating the account on first grant.
    ///
    /// When `reference` is set and an entry with the same reason and reference
    /// already exists, nothing is written and `None` is returned.
    async fn credit(
        &self,
        account_id: Uuid,
        amount: i64,
        reason: LedgerReason,
        reference: Option<&LedgerRef>,
    ) -> AppResult<Option<LedgerEntry>>;

    async fn list_entries(&self, account_id: Uuid, limit: i64) -> AppResult<Vec<LedgerEntry>>;

    /// Compare the stored balance against the sum of ledger deltas
    async fn consistency(&self, account_id: Uuid) -> AppResult<Option<ConsistencyReport>>;

    async fn create_job(&self, job: NewJob) -> AppResult<BillableJob>;

    async fn get_job(&self, job_id: Uuid) -> AppResult<Option<BillableJob>>;

    async fn find_job_by_provider_id(&self, provider_job_id: &str) -> AppResult<Option<BillableJob>>;

    /// Record the provider id and move a queued job to processing
    async fn mark_processing(&self, job_id: Uuid, provider_job_id: &str) -> AppResult<()>;

    /// Move a job to its terminal state and refund `pre_charged - final` in one
    /// transaction. A job already terminal is returned untouched.
    async fn finalize_job(&self, job_id: Uuid, finalization: JobFinalization) -> AppResult<FinalizeOutcome>;

    /// Non-terminal jobs last updated before `older_than`
    async fn list_stale_jobs(&self, older_than: DateTime<Utc>, limit: i64) -> AppResult<Vec<BillableJob>>;

    /// Cheap reachability probe for health checks
    async fn ping(&self) -> AppResult<()>;
}

/// Refund owed when a job settles at `credits_final`. The pre-charge is a
/// ceiling: undercharges are never collected afterwards.
pub fn refund_due(credits_pre_charged: i64, credits_final: i64) -> i64 {
    (credits_pre_charged - credits_final.max(0)).max(0)
}
