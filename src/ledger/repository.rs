use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::*;
use super::store::{refund_due, CreditStore};
use crate::error::{AppError, AppResult, CreditError};

const ACCOUNT_COLUMNS: &str = "id, balance, tier, created_at, updated_at";

const ENTRY_COLUMNS: &str =
    "id, account_id, delta, reason, ref_type, ref_id, balance_after, created_at";

const JOB_COLUMNS: &str = r#"
    id, account_id, kind, status, provider_job_id,
    credits_pre_charged, credits_final, surcharges,
    result_payload, error_message, created_at, updated_at, completed_at
"#;

/// Ledger repository - THE source of truth for balances and billable jobs
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    // ========== ROW HELPERS ==========

    /// Lock the account row for the rest of the transaction
    async fn lock_account(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
    ) -> AppResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = $1 FOR UPDATE",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(account)
    }

    async fn adjust_balance(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        delta: i64,
    ) -> AppResult<i64> {
        // The CHECK constraint on balance is the last line against overdraft
        let balance = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE accounts
            SET balance = balance + $2, updated_at = NOW()
            WHERE id = $1
            RETURNING balance
            "#,
        )
        .bind(account_id)
        .bind(delta)
        .fetch_one(&mut **tx)
        .await?;

        Ok(balance)
    }

    async fn insert_entry(
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        delta: i64,
        reason: LedgerReason,
        reference: Option<&LedgerRef>,
        balance_after: i64,
    ) -> AppResult<LedgerEntry> {
        let entry = sqlx::query_as::<_, LedgerEntry>(&format!(
            r#"
            INSERT INTO ledger_entries (account_id, delta, reason, ref_type, ref_id, balance_after)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        ))
        .bind(account_id)
        .bind(delta)
        .bind(reason)
        .bind(reference.map(|r| r.ref_type))
        .bind(reference.map(|r| r.ref_id.clone()))
        .bind(balance_after)
        .fetch_one(&mut **tx)
        .await?;

        Ok(entry)
    }

    async fn entry_exists(
        tx: &mut Transaction<'_, Postgres>,
        reason: LedgerReason,
        reference: &LedgerRef,
    ) -> AppResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM ledger_entries
                WHERE reason = $1 AND ref_type = $2 AND ref_id = $3
            )
            "#,
        )
        .bind(reason)
        .bind(reference.ref_type)
        .bind(&reference.ref_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(exists)
    }
}

#[async_trait]
impl CreditStore for LedgerRepository {
    // ========== ACCOUNT OPERATIONS ==========

    async fn create_account(&self, account_id: Uuid, tier: AccountTier) -> AppResult<Account> {
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            INSERT INTO accounts (id, tier)
            VALUES ($1, $2)
            ON CONFLICT (id) DO NOTHING
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .bind(tier)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::BadRequest(format!("Account already exists: {}", account_id)))?;

        info!(account_id = %account.id, tier = %account.tier, "account opened");
        Ok(account)
    }

    async fn get_account(&self, account_id: Uuid) -> AppResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn set_tier(&self, account_id: Uuid, tier: AccountTier) -> AppResult<Account> {
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            INSERT INTO accounts (id, tier)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET tier = EXCLUDED.tier, updated_at = NOW()
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .bind(tier)
        .fetch_one(&self.pool)
        .await?;

        Ok(account)
    }

    // ========== SPEND GATE SUPPORT ==========

    async fn spend(&self, request: &SpendRequest) -> AppResult<SpendOutcome> {
        if request.amount < 0 {
            return Err(AppError::InvalidInput("Spend amount must not be negative".into()));
        }

        let mut tx = self.begin_tx().await?;

        let account = Self::lock_account(&mut tx, request.account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account {}", request.account_id)))?;

        if account.tier.is_unlimited() {
            Self::insert_entry(
                &mut tx,
                account.id,
                0,
                request.reason,
                request.reference.as_ref(),
                account.balance,
            )
            .await?;
            tx.commit().await?;

            return Ok(SpendOutcome::Accepted {
                new_balance: account.balance,
                charged: 0,
            });
        }

        if account.balance < request.amount {
            tx.rollback().await?;
            debug!(
                account_id = %account.id,
                balance = account.balance,
                requested = request.amount,
                "spend rejected"
            );
            return Ok(SpendOutcome::Rejected {
                current_balance: account.balance,
            });
        }

        let new_balance = Self::adjust_balance(&mut tx, account.id, -request.amount).await?;
        Self::insert_entry(
            &mut tx,
            account.id,
            -request.amount,
            request.reason,
            request.reference.as_ref(),
            new_balance,
        )
        .await?;
        tx.commit().await?;

        Ok(SpendOutcome::Accepted {
            new_balance,
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

        let mut tx = self.begin_tx().await?;

        sqlx::query("INSERT INTO accounts (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        Self::lock_account(&mut tx, account_id).await?;

        if let Some(reference) = reference {
            if Self::entry_exists(&mut tx, reason, reference).await? {
                tx.rollback().await?;
                warn!(
                    %account_id,
                    ?reason,
                    ref_id = %reference.ref_id,
                    "duplicate credit ignored"
                );
                return Ok(None);
            }
        }

        let balance_after = Self::adjust_balance(&mut tx, account_id, amount).await?;
        let entry =
            Self::insert_entry(&mut tx, account_id, amount, reason, reference, balance_after).await?;
        tx.commit().await?;

        Ok(Some(entry))
    }

    async fn list_entries(&self, account_id: Uuid, limit: i64) -> AppResult<Vec<LedgerEntry>> {
        let entries = sqlx::query_as::<_, LedgerEntry>(&format!(
            r#"
            SELECT {}
            FROM ledger_entries
            WHERE account_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
            ENTRY_COLUMNS
        ))
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn consistency(&self, account_id: Uuid) -> AppResult<Option<ConsistencyReport>> {
        let row = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT a.balance, COALESCE(SUM(e.delta), 0)::BIGINT
            FROM accounts a
            LEFT JOIN ledger_entries e ON e.account_id = a.id
            WHERE a.id = $1
            GROUP BY a.balance
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(balance, ledger_sum)| ConsistencyReport {
            account_id,
            balance,
            ledger_sum,
            consistent: balance == ledger_sum,
        }))
    }

    // ========== BILLABLE JOB OPERATIONS ==========

    async fn create_job(&self, job: NewJob) -> AppResult<BillableJob> {
        let job = sqlx::query_as::<_, BillableJob>(&format!(
            r#"
            INSERT INTO billable_jobs (id, account_id, kind, credits_pre_charged, surcharges)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job.id)
        .bind(job.account_id)
        .bind(job.kind)
        .bind(job.credits_pre_charged)
        .bind(&job.surcharges)
        .fetch_one(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> AppResult<Option<BillableJob>> {
        let job = sqlx::query_as::<_, BillableJob>(&format!(
            "SELECT {} FROM billable_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn find_job_by_provider_id(&self, provider_job_id: &str) -> AppResult<Option<BillableJob>> {
        let job = sqlx::query_as::<_, BillableJob>(&format!(
            "SELECT {} FROM billable_jobs WHERE provider_job_id = $1",
            JOB_COLUMNS
        ))
        .bind(provider_job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn mark_processing(&self, job_id: Uuid, provider_job_id: &str) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE billable_jobs
            SET status = 'processing', provider_job_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(job_id)
        .bind(provider_job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CreditError::Inconsistent(format!(
                "job {} is not queued, cannot attach provider id {}",
                job_id, provider_job_id
            ))
            .into());
        }

        Ok(())
    }

    async fn finalize_job(&self, job_id: Uuid, finalization: JobFinalization) -> AppResult<FinalizeOutcome> {
        if !finalization.status.is_terminal() {
            return Err(AppError::InvalidInput(format!(
                "cannot finalize job into {:?}",
                finalization.status
            )));
        }

        let mut tx = self.begin_tx().await?;

        let job = sqlx::query_as::<_, BillableJob>(&format!(
            "SELECT {} FROM billable_jobs WHERE id = $1 FOR UPDATE",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {}", job_id)))?;

        if job.status.is_terminal() {
            tx.rollback().await?;
            return Ok(FinalizeOutcome::AlreadyFinal(job));
        }

        // At most one refund per job reference
        let job_ref = LedgerRef::job(&job);
        let already_refunded = Self::entry_exists(&mut tx, LedgerReason::Refund, &job_ref).await?;

        let refund = if already_refunded {
            0
        } else {
            refund_due(job.credits_pre_charged, finalization.credits_final)
        };

        let job = sqlx::query_as::<_, BillableJob>(&format!(
            r#"
            UPDATE billable_jobs
            SET status = $2,
                credits_final = $3,
                result_payload = COALESCE($4, result_payload),
                error_message = $5,
                updated_at = NOW(),
                completed_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job_id)
        .bind(finalization.status)
        .bind(finalization.credits_final)
        .bind(finalization.result_payload)
        .bind(finalization.error_message)
        .fetch_one(&mut *tx)
        .await?;

        if refund > 0 {
            Self::lock_account(&mut tx, job.account_id).await?;
            let balance_after = Self::adjust_balance(&mut tx, job.account_id, refund).await?;
            Self::insert_entry(
                &mut tx,
                job.account_id,
                refund,
                LedgerReason::Refund,
                Some(&LedgerRef::job(&job)),
                balance_after,
            )
            .await?;
        }

        tx.commit().await?;

        Ok(FinalizeOutcome::Finalized { job, refunded: refund })
    }

    async fn list_stale_jobs(&self, older_than: DateTime<Utc>, limit: i64) -> AppResult<Vec<BillableJob>> {
        let jobs = sqlx::query_as::<_, BillableJob>(&format!(
            r#"
            SELECT {}
            FROM billable_jobs
            WHERE status IN ('queued', 'processing') AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
            JOB_COLUMNS
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
