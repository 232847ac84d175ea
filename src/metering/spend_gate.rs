use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, CreditError};
use crate::ledger::models::*;
use crate::ledger::store::CreditStore;

/// Accepted charge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub new_balance: i64,
    /// 0 for unlimited accounts
    pub charged: i64,
}

/// Guard in front of every billable operation.
///
/// The check-and-decrement happens inside the store as one atomic unit, so
/// concurrent spends against an account serialize and never overdraw it.
pub struct SpendGate {
    store: Arc<dyn CreditStore>,
}

impl SpendGate {
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        Self { store }
    }

    /// Structured spend: `Rejected` is a normal result, not an error
    pub async fn spend(&self, request: &SpendRequest) -> AppResult<SpendOutcome> {
        if request.amount <= 0 {
            return Err(AppError::InvalidInput("Spend amount must be positive".into()));
        }
        if request.reason != LedgerReason::Spend {
            return Err(AppError::InvalidInput(format!(
                "Spend gate only writes spend entries, got {:?}",
                request.reason
            )));
        }

        let outcome = self.store.spend(request).await?;

        match outcome {
            SpendOutcome::Accepted { new_balance, charged } => info!(
                account_id = %request.account_id,
                charged,
                new_balance,
                ref_id = request.reference.as_ref().map(|r| r.ref_id.as_str()),
                "credits spent"
            ),
            SpendOutcome::Rejected { current_balance } => warn!(
                account_id = %request.account_id,
                requested = request.amount,
                current_balance,
                "insufficient credits"
            ),
        }

        Ok(outcome)
    }

    /// Spend or fail with `InsufficientCredits`, for callers about to start work
    pub async fn require(&self, request: &SpendRequest) -> AppResult<ChargeReceipt> {
        match self.spend(request).await? {
            SpendOutcome::Accepted { new_balance, charged } => Ok(ChargeReceipt { new_balance, charged }),
            SpendOutcome::Rejected { current_balance } => Err(CreditError::InsufficientCredits {
                required: request.amount,
                available: current_balance,
            }
            .into()),
        }
    }

    pub async fn grant(&self, account_id: Uuid, amount: i64) -> AppResult<LedgerEntry> {
        if amount <= 0 {
            return Err(AppError::InvalidInput("Grant amount must be positive".into()));
        }

        let entry = self
            .store
            .credit(account_id, amount, LedgerReason::Grant, None)
            .await?
            .ok_or_else(|| AppError::Internal("unreferenced grant was deduplicated".into()))?;

        info!(%account_id, amount, balance = entry.balance_after, "credits granted");
        Ok(entry)
    }

    /// Additive refund. With a reference, a second refund for it is a no-op.
    pub async fn refund(
        &self,
        account_id: Uuid,
        amount: i64,
        reference: Option<&LedgerRef>,
    ) -> AppResult<Option<LedgerEntry>> {
        if amount <= 0 {
            return Err(AppError::InvalidInput("Refund amount must be positive".into()));
        }

        let entry = self
            .store
            .credit(account_id, amount, LedgerReason::Refund, reference)
            .await?;

        match &entry {
            Some(entry) => info!(%account_id, amount, balance = entry.balance_after, "credits refunded"),
            None => warn!(%account_id, amount, "refund already recorded for reference"),
        }

        Ok(entry)
    }

    /// Balance vs ledger check; mismatches are logged as errors
    pub async fn audit(&self, account_id: Uuid) -> AppResult<ConsistencyReport> {
        let report = self
            .store
            .consistency(account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account {}", account_id)))?;

        if !report.consistent {
            tracing::error!(
                %account_id,
                balance = report.balance,
                ledger_sum = report.ledger_sum,
                "ledger sum does not match balance"
            );
        }

        Ok(report)
    }
}
