use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::metering::pricing::BillableOperation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

// ========== REQUEST MODELS ==========

/// Open an account, optionally seeding it with credits
#[derive(Debug, Deserialize, Validate)]
pub struct CreateAccountRequest {
    /// Generated when omitted
    pub account_id: Option<Uuid>,
    #[serde(default = "default_tier")]
    pub tier: AccountTier,
    #[validate(range(min = 0, message = "must not be negative"))]
    pub initial_credits: Option<i64>,
}

fn default_tier() -> AccountTier {
    AccountTier::Free
}

/// Spend gate request
#[derive(Debug, Deserialize, Validate)]
pub struct SpendCreditsRequest {
    pub account_id: Uuid,
    #[validate(range(min = 1, message = "must be positive"))]
    pub amount: i64,
    #[serde(default = "default_spend_reason")]
    pub reason: LedgerReason,
    pub ref_type: Option<RefType>,
    #[validate(length(min = 1, max = 255))]
    pub ref_id: Option<String>,
}

fn default_spend_reason() -> LedgerReason {
    LedgerReason::Spend
}

#[derive(Debug, Deserialize, Validate)]
pub struct GrantCreditsRequest {
    pub account_id: Uuid,
    #[validate(range(min = 1, message = "must be positive"))]
    pub amount: i64,
}

/// Refund request; with a reference it is applied at most once
#[derive(Debug, Deserialize, Validate)]
pub struct RefundCreditsRequest {
    pub account_id: Uuid,
    #[validate(range(min = 1, message = "must be positive"))]
    pub amount: i64,
    pub ref_type: Option<RefType>,
    #[validate(length(min = 1, max = 255))]
    pub ref_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChargeOperationRequest {
    pub account_id: Uuid,
    pub operation: BillableOperation,
    #[validate(length(min = 1, max = 255))]
    pub reference_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct StartTranscriptionRequest {
    pub account_id: Uuid,
    #[validate(url(message = "must be a URL"))]
    pub media_url: String,
    #[serde(default)]
    pub sentiment_analysis: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct StartScrapeRequest {
    pub account_id: Uuid,
    /// Passed through to the scraping actor
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SweepRequest {
    #[validate(range(min = 1, message = "must be positive"))]
    pub max_age_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LedgerQuery {
    pub limit: Option<i64>,
}

/// Both halves of a reference or neither
pub fn reference_from(ref_type: Option<RefType>, ref_id: Option<String>) -> AppResult<Option<LedgerRef>> {
    match (ref_type, ref_id) {
        (Some(ref_type), Some(ref_id)) => Ok(Some(LedgerRef::new(ref_type, ref_id))),
        (None, None) => Ok(None),
        _ => Err(AppError::InvalidInput("ref_type and ref_id must be given together".into())),
    }
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub account_id: Uuid,
    pub balance: i64,
    pub tier: AccountTier,
}

impl From<Account> for BalanceResponse {
    fn from(account: Account) -> Self {
        Self {
            account_id: account.id,
            balance: account.balance,
            tier: account.tier,
        }
    }
}

/// `{ok, new_balance?, current_balance?}`
#[derive(Debug, Serialize, Deserialize)]
pub struct SpendResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_balance: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charged: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_balance: Option<i64>,
}

impl From<SpendOutcome> for SpendResponse {
    fn from(outcome: SpendOutcome) -> Self {
        match outcome {
            SpendOutcome::Accepted { new_balance, charged } => Self {
                ok: true,
                new_balance: Some(new_balance),
                charged: Some(charged),
                current_balance: None,
            },
            SpendOutcome::Rejected { current_balance } => Self {
                ok: false,
                new_balance: None,
                charged: None,
                current_balance: Some(current_balance),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreditResponse {
    pub account_id: Uuid,
    pub credited: i64,
    pub balance: i64,
    pub entry_id: Option<Uuid>,
    /// The reference was already credited; nothing changed
    pub duplicate: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChargeResponse {
    pub account_id: Uuid,
    pub operation: BillableOperation,
    pub charged: i64,
    pub new_balance: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub account_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub provider_job_id: Option<String>,
    pub credits_pre_charged: i64,
    pub credits_final: Option<i64>,
    pub surcharges: Vec<String>,
    pub result_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<BillableJob> for JobResponse {
    fn from(job: BillableJob) -> Self {
        Self {
            job_id: job.id,
            account_id: job.account_id,
            kind: job.kind,
            status: job.status,
            provider_job_id: job.provider_job_id,
            credits_pre_charged: job.credits_pre_charged,
            credits_final: job.credits_final,
            surcharges: job.surcharges,
            result_payload: job.result_payload,
            error_message: job.error_message,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}
