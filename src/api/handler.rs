use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::async_webhook::{AsyncWebhookProcessor, WebhookAcceptedResponse};
use super::models::*;
use crate::{
    billing::{stripe::{BillingOutcome, StripeEvent}, BillingService, StripeWebhookVerifier},
    error::{AppError, AppResult},
    ledger::{models::*, store::CreditStore},
    metering::{
        recovery::SweepReport, usage::TranscriptionCallback, RecoverySweep, SpendGate, UsageService,
    },
    middleware::ValidatedJson,
    providers::{assemblyai::WEBHOOK_AUTH_HEADER, traits::TranscriptionOptions, CallbackAuth},
};

const DEFAULT_LEDGER_LIMIT: i64 = 50;
const MAX_LEDGER_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CreditStore>,
    pub spend_gate: Arc<SpendGate>,
    pub usage: Arc<UsageService>,
    pub recovery: Arc<RecoverySweep>,
    pub billing: Arc<BillingService>,
    pub stripe_verifier: Arc<StripeWebhookVerifier>,
    pub webhooks: Arc<AsyncWebhookProcessor>,
    pub transcription_auth: Arc<CallbackAuth>,
}

async fn account_or_404(state: &AppState, account_id: Uuid) -> AppResult<Account> {
    state
        .store
        .get_account(account_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Account {}", account_id)))
}

/// GET /health - liveness plus store reachability
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (code, status, store) = match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "healthy", "reachable".to_string()),
        Err(e) => {
            warn!("Store unreachable: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "degraded", e.to_string())
        }
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            store,
            timestamp: Utc::now(),
        }),
    )
}

// ========== ACCOUNTS ==========

/// POST /accounts
pub async fn create_account(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreateAccountRequest>,
) -> AppResult<(StatusCode, Json<BalanceResponse>)> {
    let account_id = request.account_id.unwrap_or_else(Uuid::new_v4);
    let mut account = state.store.create_account(account_id, request.tier).await?;

    if let Some(credits) = request.initial_credits.filter(|c| *c > 0) {
        let entry = state.spend_gate.grant(account_id, credits).await?;
        account.balance = entry.balance_after;
    }

    info!(%account_id, tier = %account.tier, balance = account.balance, "account created");
    Ok((StatusCode::CREATED, Json(account.into())))
}

/// GET /accounts/:id/balance
pub async fn get_balance(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> AppResult<Json<BalanceResponse>> {
    Ok(Json(account_or_404(&state, account_id).await?.into()))
}

/// GET /accounts/:id/ledger?limit=N - newest first
pub async fn get_ledger(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<LedgerQuery>,
) -> AppResult<Json<Vec<LedgerEntry>>> {
    account_or_404(&state, account_id).await?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LEDGER_LIMIT)
        .clamp(1, MAX_LEDGER_LIMIT);

    Ok(Json(state.store.list_entries(account_id, limit).await?))
}

/// GET /accounts/:id/audit
pub async fn audit_account(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> AppResult<Json<ConsistencyReport>> {
    Ok(Json(state.spend_gate.audit(account_id).await?))
}

// ========== CREDITS ==========

/// POST /credits/spend - 402 with `{ok: false, current_balance}` when short
pub async fn spend_credits(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<SpendCreditsRequest>,
) -> AppResult<(StatusCode, Json<SpendResponse>)> {
    let reference = reference_from(request.ref_type, request.ref_id)?;
    let outcome = state
        .spend_gate
        .spend(&SpendRequest {
            account_id: request.account_id,
            amount: request.amount,
            reason: request.reason,
            reference,
        })
        .await?;

    let code = if outcome.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::PAYMENT_REQUIRED
    };
    Ok((code, Json(outcome.into())))
}

/// POST /credits/grant
pub async fn grant_credits(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<GrantCreditsRequest>,
) -> AppResult<Json<CreditResponse>> {
    let entry = state.spend_gate.grant(request.account_id, request.amount).await?;

    Ok(Json(CreditResponse {
        account_id: request.account_id,
        credited: entry.delta,
        balance: entry.balance_after,
        entry_id: Some(entry.id),
        duplicate: false,
    }))
}

/// POST /credits/refund
pub async fn refund_credits(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<RefundCreditsRequest>,
) -> AppResult<Json<CreditResponse>> {
    let reference = reference_from(request.ref_type, request.ref_id)?;
    if reference.as_ref().is_some_and(|r| r.ref_type.is_job()) {
        return Err(AppError::InvalidInput(
            "job refunds are settled by reconciliation".into(),
        ));
    }
    let entry = state
        .spend_gate
        .refund(request.account_id, request.amount, reference.as_ref())
        .await?;

    let response = match entry {
        Some(entry) => CreditResponse {
            account_id: request.account_id,
            credited: entry.delta,
            balance: entry.balance_after,
            entry_id: Some(entry.id),
            duplicate: false,
        },
        None => CreditResponse {
            account_id: request.account_id,
            credited: 0,
            balance: account_or_404(&state, request.account_id).await?.balance,
            entry_id: None,
            duplicate: true,
        },
    };
    Ok(Json(response))
}

// ========== BILLABLE WORK ==========

/// POST /operations/charge
pub async fn charge_operation(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<ChargeOperationRequest>,
) -> AppResult<Json<ChargeResponse>> {
    let receipt = state
        .usage
        .charge_operation(request.account_id, request.operation, request.reference_id)
        .await?;

    Ok(Json(ChargeResponse {
        account_id: request.account_id,
        operation: request.operation,
        charged: receipt.charged,
        new_balance: receipt.new_balance,
    }))
}

/// POST /transcriptions - 202, settled later by webhook or sweep
pub async fn start_transcription(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<StartTranscriptionRequest>,
) -> AppResult<(StatusCode, Json<JobResponse>)> {
    let options = TranscriptionOptions {
        sentiment_analysis: request.sentiment_analysis,
    };
    let job = state
        .usage
        .start_transcription(request.account_id, &request.media_url, options)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(job.into())))
}

/// POST /scrapes - runs to completion within the poll budget
pub async fn run_scrape(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<StartScrapeRequest>,
) -> AppResult<Json<JobResponse>> {
    let job = state.usage.run_scrape(request.account_id, request.input).await?;
    Ok(Json(job.into()))
}

/// GET /jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<JobResponse>> {
    let job = state
        .store
        .get_job(job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {}", job_id)))?;
    Ok(Json(job.into()))
}

// ========== WEBHOOKS ==========

/// POST /webhooks/transcription - authenticated by the shared-secret header
pub async fn transcription_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(callback): Json<TranscriptionCallback>,
) -> AppResult<(StatusCode, Json<WebhookAcceptedResponse>)> {
    let presented = headers.get(WEBHOOK_AUTH_HEADER).and_then(|v| v.to_str().ok());
    state.transcription_auth.verify(presented)?;

    info!(provider_job_id = %callback.job_id, status = %callback.status, "transcription webhook received");
    let response = state.webhooks.process_transcription_async(callback);
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// POST /webhooks/billing - signed Stripe events
pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<BillingOutcome>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)?;
    state.stripe_verifier.verify(&body, signature)?;

    let event: StripeEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid event payload: {}", e)))?;
    info!(event_id = %event.id, event_type = %event.event_type, "billing event received");

    Ok(Json(state.billing.handle_event(event).await?))
}

// ========== RECOVERY ==========

/// POST /recovery/sweep
pub async fn run_sweep(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<SweepRequest>,
) -> AppResult<Json<SweepReport>> {
    let max_age = request.max_age_minutes.map(chrono::Duration::minutes);
    Ok(Json(state.recovery.run(max_age).await?))
}
