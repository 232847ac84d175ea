use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Subscription tier of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "account_tier", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccountTier {
    Free,
    Pro,
    Unlimited,
}

impl AccountTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountTier::Free => "free",
            AccountTier::Pro => "pro",
            AccountTier::Unlimited => "unlimited",
        }
    }

    /// Unlimited accounts bypass the balance check
    pub fn is_unlimited(&self) -> bool {
        matches!(self, AccountTier::Unlimited)
    }
}

impl fmt::Display for AccountTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AccountTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(AccountTier::Free),
            "pro" => Ok(AccountTier::Pro),
            "unlimited" => Ok(AccountTier::Unlimited),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

/// Why a ledger entry was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "ledger_reason", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    Spend,
    Grant,
    Refund,
    SubscriptionGrant,
}

/// What an entry's `ref_id` points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "ledger_ref_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RefType {
    TranscriptionJob,
    ScrapeRun,
    ScriptGeneration,
    ContentAnalysis,
    CreatorSearch,
    Invoice,
    Manual,
}

impl RefType {
    /// References owned by billable jobs; their refunds come from reconciliation
    pub fn is_job(&self) -> bool {
        matches!(self, RefType::TranscriptionJob | RefType::ScrapeRun)
    }
}

/// External reference attached to a ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRef {
    pub ref_type: RefType,
    pub ref_id: String,
}

impl LedgerRef {
    pub fn new(ref_type: RefType, ref_id: impl Into<String>) -> Self {
        Self {
            ref_type,
            ref_id: ref_id.into(),
        }
    }

    pub fn job(job: &BillableJob) -> Self {
        let ref_type = match job.kind {
            JobKind::Transcription => RefType::TranscriptionJob,
            JobKind::Scrape => RefType::ScrapeRun,
        };
        Self::new(ref_type, job.id.to_string())
    }
}

/// Account entity
///
/// INVARIANT: balance >= 0 and balance == sum(ledger_entries.delta)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: Uuid,
    pub balance: i64,
    pub tier: AccountTier,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable ledger entry
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    pub delta: i64,
    pub reason: LedgerReason,
    pub ref_type: Option<RefType>,
    pub ref_id: Option<String>,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

/// A spend request as it reaches the gate
#[derive(Debug, Clone)]
pub struct SpendRequest {
    pub account_id: Uuid,
    pub amount: i64,
    pub reason: LedgerReason,
    pub reference: Option<LedgerRef>,
}

/// Structured spend gate result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SpendOutcome {
    /// Balance was decremented by `charged` (0 for unlimited accounts)
    Accepted { new_balance: i64, charged: i64 },
    /// Nothing was mutated
    Rejected { current_balance: i64 },
}

impl SpendOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, SpendOutcome::Accepted { .. })
    }
}

/// Kind of asynchronous external work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "job_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Transcription,
    Scrape,
}

/// Billable job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Billable unit of work - an external job whose final cost is known on completion
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillableJob {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub provider_job_id: Option<String>,
    pub credits_pre_charged: i64,
    pub credits_final: Option<i64>,
    /// Requested extras, e.g. "sentiment_analysis"
    pub surcharges: Vec<String>,
    pub result_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BillableJob {
    pub fn has_surcharge(&self, name: &str) -> bool {
        self.surcharges.iter().any(|s| s == name)
    }
}

/// Parameters for recording a newly pre-charged job
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Generated by the caller so the pre-charge can reference it
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: JobKind,
    pub credits_pre_charged: i64,
    pub surcharges: Vec<String>,
}

/// Terminal data written exactly once when a job is finalized
#[derive(Debug, Clone)]
pub struct JobFinalization {
    pub status: JobStatus,
    pub credits_final: i64,
    pub result_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

/// Result of finalizing a job
#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    Finalized { job: BillableJob, refunded: i64 },
    AlreadyFinal(BillableJob),
}

/// Result of comparing an account's balance with its ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub account_id: Uuid,
    pub balance: i64,
    pub ledger_sum: i64,
    pub consistent: bool,
}
