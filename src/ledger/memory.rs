use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::models::*;
use super::store::{refund_due, CreditStore};
use crate::error::{AppError, AppResult, CreditError};

#[derive(Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    entries: Vec<LedgerEntry>,
    jobs: HashMap<Uuid, BillableJob>,
}

impl State {
    fn push_entry(
        &mut self,
        account_id: Uuid,
        delta: i64,
        reason: LedgerReason,
        reference: Option<&LedgerRef>,
    ) -> AppResult<LedgerEntry> {
        let account = self
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| AppError::NotFound(format!("Account {}", account_id)))?;

        let balance_after = account.balance + delta;
        if balance_after < 0 {
            return Err(CreditError::Inconsistent(format!(
                "balance of {} would go negative",
                account_id
            ))
            .into());
        }
        account.balance = balance_after;
        account.updated_at = Utc::now();

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            account_id,
            delta,
            reason,
            ref_type: reference.map(|r| r.ref_type),
            ref_id: reference.map(|r| r.ref_id.clone()),
            balance_after,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn has_entry(&self, reason: LedgerReason, reference: &LedgerRef) -> bool {
        self.entries.iter().any(|e| {
            e.reason == reason
                && e.ref_type == Some(reference.ref_type)
                && e.ref_id.as_deref() == Some(reference.ref_id.as_str())
        })
    }

    fn new_account(id: Uuid, tier: AccountTier) -> Account {
        let now = Utc::now();
        Account {
            id,
            balance: 0,
            tier,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Process-local ledger with the same atomicity as the Postgres store.
///
/// A single mutex serializes every operation, so each trait call is one
/// critical section. Used for local runs (`STORE_BACKEND=memory`) and tests.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backdate a job so it looks stale to the recovery sweep
    #[cfg(test)]
    pub fn age_job(&self, job_id: Uuid, by: chrono::Duration) {
        let mut state = self.state.lock();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.updated_at -= by;
            job.created_at -= by;
        }
    }

    /// Overwrite a balance without a ledger entry, to simulate corruption
    #[cfg(test)]
    pub fn corrupt_balance(&self, account_id: Uuid, balance: i64) {
        let mut state = self.state.lock();
        if let Some(account) = state.accounts.get_mut(&account_id) {
            account.balance = balance;
        }
    }
}

#[async_trait]
impl CreditStore for InMemoryLedger {
    async fn create_account(&self, account_id: Uuid, tier: AccountTier) -> AppResult<Account> {
        let mut state = self.state.lock();
        if state.accounts.contains_key(&account_id) {
            return Err(AppError::BadRequest(format!("Account already exists: {}", account_id)));
        }
        let account = State::new_account(account_id, tier);
        state.accounts.insert(account_id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, account_id: Uuid) -> AppResult<Option<Account>> {
        Ok(self.state.lock().accounts.get(&account_id).cloned())
    }

    async fn set_tier(&self, account_id: Uuid, tier: AccountTier) -> AppResult<Account> {
        let mut state = self.state.lock();
        let account = state
            .accounts
            .entry(account_id)
            .or_insert_with(|| State::new_account(account_id, tier));
        account.tier = tier;
        account.updated_at = Utc::now();
        Ok(account.clone())
    }

    async fn spend(&self, request: &SpendRequest) -> AppResult<SpendOutcome> {
        if request.amount < 0 {
            return Err(AppError::InvalidInput("Spend amount must not be negative".into()));
        }

        let mut state = self.state.lock();
        let account = state
            .accounts
            .get(&request.account_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Account {}", request.account_id)))?;

        if account.tier.is_unlimited() {
            state.push_entry(account.id, 0, request.reason, request.reference.as_ref())?;
            return Ok(SpendOutcome::Accepted {
                new_balance: account.balance,
                charged: 0,
            });
        }

        if account.balance < request.amount {
            return Ok(SpendOutcome::Rejected {
                current_balance: account.balance,
            });
        }

        let entry = state.push_entry(
            account.id,
            -request.amount,
            request.reason,
            request.reference.as_ref(),
        )?;

        Ok(SpendOutcome::Accepted {
            new_balance: entry.balance_after,
            charged: request.amount,
        })
    }

    async fn credit(
        &self,
        account_id: Uuid,
        amount: i64,
        reason: LedgerReason,
        reference: Option<&LedgerRef>,
    ) -> AppResult<Option<LedgerEntry>> {
        if amount < 0 {
            return Err(AppError::InvalidInput("Credit amount must not be negative".into()));
        }

        let mut state = self.state.lock();
        state
            .accounts
            .entry(account_id)
            .or_insert_with(|| State::new_account(account_id, AccountTier::Free));

        if let Some(reference) = reference {
            if state.has_entry(reason, reference) {
                return Ok(None);
            }
        }

        state.push_entry(account_id, amount, reason, reference).map(Some)
    }

    async fn list_entries(&self, account_id: Uuid, limit: i64) -> AppResult<Vec<LedgerEntry>> {
        let state = self.state.lock();
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(state
            .entries
            .iter()
            .rev()
            .filter(|e| e.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn consistency(&self, account_id: Uuid) -> AppResult<Option<ConsistencyReport>> {
        let state = self.state.lock();
        Ok(state.accounts.get(&account_id).map(|account| {
            let ledger_sum = state
                .entries
                .iter()
                .filter(|e| e.account_id == account_id)
                .map(|e| e.delta)
                .sum();
            ConsistencyReport {
                account_id,
                balance: account.balance,
                ledger_sum,
                consistent: account.balance == ledger_sum,
            }
        }))
    }

    async fn create_job(&self, job: NewJob) -> AppResult<BillableJob> {
        let mut state = self.state.lock();
        if !state.accounts.contains_key(&job.account_id) {
            return Err(AppError::NotFound(format!("Account {}", job.account_id)));
        }
        if state.jobs.contains_key(&job.id) {
            return Err(AppError::BadRequest(format!("Job already exists: {}", job.id)));
        }

        let now = Utc::now();
        let job = BillableJob {
            id: job.id,
            account_id: job.account_id,
            kind: job.kind,
            status: JobStatus::Queued,
            provider_job_id: None,
            credits_pre_charged: job.credits_pre_charged,
            credits_final: None,
            surcharges: job.surcharges,
            result_payload: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> AppResult<Option<BillableJob>> {
        Ok(self.state.lock().jobs.get(&job_id).cloned())
    }

    async fn find_job_by_provider_id(&self, provider_job_id: &str) -> AppResult<Option<BillableJob>> {
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .find(|job| job.provider_job_id.as_deref() == Some(provider_job_id))
            .cloned())
    }

    async fn mark_processing(&self, job_id: Uuid, provider_job_id: &str) -> AppResult<()> {
        let mut state = self.state.lock();
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Queued => {
                job.status = JobStatus::Processing;
                job.provider_job_id = Some(provider_job_id.to_string());
                job.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(CreditError::Inconsistent(format!(
                "job {} is not queued, cannot attach provider id {}",
                job_id, provider_job_id
            ))
            .into()),
        }
    }

    async fn finalize_job(&self, job_id: Uuid, finalization: JobFinalization) -> AppResult<FinalizeOutcome> {
        if !finalization.status.is_terminal() {
            return Err(AppError::InvalidInput(format!(
                "cannot finalize job into {:?}",
                finalization.status
            )));
        }

        let mut state = self.state.lock();
        let current = state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Job {}", job_id)))?;

        if current.status.is_terminal() {
            return Ok(FinalizeOutcome::AlreadyFinal(current));
        }

        // At most one refund per job reference
        let refund = if state.has_entry(LedgerReason::Refund, &LedgerRef::job(&current)) {
            0
        } else {
            refund_due(current.credits_pre_charged, finalization.credits_final)
        };
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Err(AppError::NotFound(format!("Job {}", job_id)));
        };
        let now = Utc::now();
        job.status = finalization.status;
        job.credits_final = Some(finalization.credits_final);
        if finalization.result_payload.is_some() {
            job.result_payload = finalization.result_payload;
        }
        job.error_message = finalization.error_message;
        job.updated_at = now;
        job.completed_at = Some(now);
        let job = job.clone();

        if refund > 0 {
            state.push_entry(
                job.account_id,
                refund,
                LedgerReason::Refund,
                Some(&LedgerRef::job(&job)),
            )?;
        }

        Ok(FinalizeOutcome::Finalized { job, refunded: refund })
    }

    async fn list_stale_jobs(&self, older_than: DateTime<Utc>, limit: i64) -> AppResult<Vec<BillableJob>> {
        let state = self.state.lock();
        let mut jobs: Vec<BillableJob> = state
            .jobs
            .values()
            .filter(|job| !job.status.is_terminal() && job.updated_at < older_than)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.updated_at);
        jobs.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(jobs)
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}
