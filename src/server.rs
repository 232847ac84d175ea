use std::time::Duration;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{
        audit_account, billing_webhook, charge_operation, create_account, get_balance, get_job, get_ledger,
        grant_credits, health_check, refund_credits, run_scrape, run_sweep, spend_credits, start_transcription,
        transcription_webhook, AppState,
    },
    config::Config,
    middleware::{create_cors_layer, rate_limit_middleware, RateLimitLayer},
};

/// HTTP-layer settings
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub cors_origins: String,
    pub rate_limit_per_minute: u32,
    pub request_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            cors_origins: "*".to_string(),
            rate_limit_per_minute: 600,
            request_timeout: Duration::from_secs(360),
        }
    }
}

impl From<&Config> for ServerOptions {
    fn from(config: &Config) -> Self {
        Self {
            cors_origins: config.cors_origins.clone(),
            rate_limit_per_minute: config.rate_limit_per_minute,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

pub fn create_app(state: AppState, options: &ServerOptions) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let api = Router::new()
        // Accounts
        .route("/accounts", post(create_account))
        .route("/accounts/:id/balance", get(get_balance))
        .route("/accounts/:id/ledger", get(get_ledger))
        .route("/accounts/:id/audit", get(audit_account))
        // Spend gate
        .route("/credits/spend", post(spend_credits))
        .route("/credits/grant", post(grant_credits))
        .route("/credits/refund", post(refund_credits))
        // Billable work
        .route("/operations/charge", post(charge_operation))
        .route("/transcriptions", post(start_transcription))
        .route("/scrapes", post(run_scrape))
        .route("/jobs/:id", get(get_job))
        // Webhook endpoints
        .route("/webhooks/transcription", post(transcription_webhook))
        .route("/webhooks/billing", post(billing_webhook))
        // Recovery
        .route("/recovery/sweep", post(run_sweep))
        .route_layer(from_fn_with_state(
            RateLimitLayer::per_minute(options.rate_limit_per_minute),
            rate_limit_middleware,
        ));

    let app = Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api)
        .layer(CompressionLayer::new())
        .layer(create_cors_layer(&options.cors_origins))
        .layer(TimeoutLayer::new(options.request_timeout))
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::api::async_webhook::AsyncWebhookProcessor;
    use crate::billing::stripe::sign_for_test;
    use crate::billing::{BillingService, StripeWebhookVerifier};
    use crate::config::PlanGrant;
    use crate::ledger::models::AccountTier;
    use crate::ledger::store::CreditStore;
    use crate::ledger::InMemoryLedger;
    use crate::metering::pricing::CreditPricing;
    use crate::metering::{Reconciler, RecoveryConfig, RecoverySweep, SpendGate, UsageService};
    use crate::providers::assemblyai::WEBHOOK_AUTH_HEADER;
    use crate::providers::poll::PollPolicy;
    use crate::providers::stub::{completed, StubScraper, StubTranscription};
    use crate::providers::CallbackAuth;

    const SECRET: &str = "whsec_router";
    const CALLBACK_SECRET: &str = "transcripts-only";

    struct TestApp {
        app: Router,
        transcription: Arc<StubTranscription>,
    }

    fn test_app() -> TestApp {
        let store: Arc<dyn CreditStore> = Arc::new(InMemoryLedger::new());
        let transcription = Arc::new(StubTranscription::new());
        let scraper = Arc::new(StubScraper::new(vec![completed(None, vec![])]));

        let spend_gate = Arc::new(SpendGate::new(store.clone()));
        let reconciler = Arc::new(Reconciler::new(store.clone(), CreditPricing::default()));
        let usage = Arc::new(UsageService::new(
            store.clone(),
            spend_gate.clone(),
            reconciler.clone(),
            transcription.clone(),
            scraper.clone(),
            PollPolicy {
                interval: Duration::from_millis(1),
                max_attempts: 3,
                backoff_factor: 1.0,
                max_interval: Duration::from_millis(1),
            },
            None,
        ));
        let recovery = Arc::new(RecoverySweep::new(
            store.clone(),
            reconciler,
            transcription.clone(),
            scraper,
            RecoveryConfig::default(),
        ));
        let plans = [(
            "price_pro".to_string(),
            PlanGrant {
                tier: AccountTier::Pro,
                credits: 100,
            },
        )]
        .into_iter()
        .collect();

        let state = AppState {
            store: store.clone(),
            spend_gate,
            usage: usage.clone(),
            recovery,
            billing: Arc::new(BillingService::new(store, plans)),
            stripe_verifier: Arc::new(StripeWebhookVerifier::new(SECRET, 300)),
            webhooks: Arc::new(AsyncWebhookProcessor::new(usage)),
            transcription_auth: Arc::new(CallbackAuth::new(CALLBACK_SECRET)),
        };

        TestApp {
            app: create_app(state, &ServerOptions::default()),
            transcription,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        call_with_headers(app, method, uri, body, &[]).await
    }

    async fn call_with_headers(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn open_account(app: &Router, credits: i64) -> Uuid {
        let (status, body) = call(app, "POST", "/api/v1/accounts", Some(json!({"initial_credits": credits}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["balance"], credits);
        body["account_id"].as_str().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let t = test_app();
        let (status, body) = call(&t.app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_spend_refund_walkthrough() {
        let t = test_app();
        let account = open_account(&t.app, 5).await;

        let (status, body) = call(
            &t.app,
            "POST",
            "/api/v1/credits/spend",
            Some(json!({"account_id": account, "amount": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["new_balance"], 3);

        let (status, body) = call(
            &t.app,
            "POST",
            "/api/v1/credits/spend",
            Some(json!({"account_id": account, "amount": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body, json!({"ok": false, "current_balance": 3}));

        let refund = json!({"account_id": account, "amount": 2, "ref_type": "manual", "ref_id": "ticket-7"});
        let (status, body) = call(&t.app, "POST", "/api/v1/credits/refund", Some(refund.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], 5);

        let (_, body) = call(&t.app, "POST", "/api/v1/credits/refund", Some(refund)).await;
        assert_eq!(body["duplicate"], true);
        assert_eq!(body["balance"], 5);

        let (_, body) = call(&t.app, "GET", &format!("/api/v1/accounts/{}/balance", account), None).await;
        assert_eq!(body["balance"], 5);

        let (_, body) = call(&t.app, "GET", &format!("/api/v1/accounts/{}/ledger?limit=2", account), None).await;
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[0]["reason"], "refund");

        let (_, body) = call(&t.app, "GET", &format!("/api/v1/accounts/{}/audit", account), None).await;
        assert_eq!(body["consistent"], true);
        assert_eq!(body["ledger_sum"], 5);
    }

    #[tokio::test]
    async fn test_spend_errors() {
        let t = test_app();

        let (status, body) = call(
            &t.app,
            "POST",
            "/api/v1/credits/spend",
            Some(json!({"account_id": Uuid::new_v4(), "amount": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_code"], "NOT_FOUND");

        let account = open_account(&t.app, 1).await;
        let (status, _) = call(
            &t.app,
            "POST",
            "/api/v1/credits/spend",
            Some(json!({"account_id": account, "amount": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &t.app,
            "POST",
            "/api/v1/credits/spend",
            Some(json!({"account_id": account, "amount": 1, "ref_type": "manual"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_operation_charge_insufficient_is_402() {
        let t = test_app();
        let account = open_account(&t.app, 0).await;

        let (status, body) = call(
            &t.app,
            "POST",
            "/api/v1/operations/charge",
            Some(json!({"account_id": account, "operation": "creator_search"})),
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error_code"], "INSUFFICIENT_CREDITS");
    }

    #[tokio::test]
    async fn test_transcription_webhook_settles_job() {
        let t = test_app();
        let account = open_account(&t.app, 5).await;

        let (status, job) = call(
            &t.app,
            "POST",
            "/api/v1/transcriptions",
            Some(json!({"account_id": account, "media_url": "https://cdn.example.com/a.mp3"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(job["status"], "processing");
        let job_id = job["job_id"].as_str().unwrap().to_string();
        let provider_id = job["provider_job_id"].as_str().unwrap().to_string();
        t.transcription.set_state(&provider_id, completed(Some(20.0), vec![]));

        let payload = json!({"transcript_id": provider_id, "status": "completed"});
        let (status, _) = call(&t.app, "POST", "/api/v1/webhooks/transcription", Some(payload.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call_with_headers(
            &t.app,
            "POST",
            "/api/v1/webhooks/transcription",
            Some(payload),
            &[(WEBHOOK_AUTH_HEADER, CALLBACK_SECRET)],
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let mut settled = Value::Null;
        for _ in 0..100 {
            let (_, body) = call(&t.app, "GET", &format!("/api/v1/jobs/{}", job_id), None).await;
            if body["status"] == "completed" {
                settled = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(settled["credits_final"], 1);

        let (_, body) = call(&t.app, "GET", &format!("/api/v1/accounts/{}/balance", account), None).await;
        assert_eq!(body["balance"], 4);
    }

    #[tokio::test]
    async fn test_manual_refund_cannot_use_job_reference() {
        let t = test_app();
        let account = open_account(&t.app, 5).await;

        let (_, job) = call(
            &t.app,
            "POST",
            "/api/v1/transcriptions",
            Some(json!({"account_id": account, "media_url": "https://cdn.example.com/b.mp3"})),
        )
        .await;

        let (status, _) = call(
            &t.app,
            "POST",
            "/api/v1/credits/refund",
            Some(json!({
                "account_id": account,
                "amount": 2,
                "ref_type": "transcription_job",
                "ref_id": job["job_id"],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&t.app, "GET", &format!("/api/v1/accounts/{}/balance", account), None).await;
        assert_eq!(body["balance"], 3);
    }

    #[tokio::test]
    async fn test_scrape_runs_synchronously() {
        let t = test_app();
        let account = open_account(&t.app, 2).await;

        let (status, body) = call(
            &t.app,
            "POST",
            "/api/v1/scrapes",
            Some(json!({"account_id": account, "input": {"handle": "someone"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["kind"], "scrape");
    }

    #[tokio::test]
    async fn test_billing_webhook_requires_signature() {
        let t = test_app();
        let account = Uuid::new_v4();
        let event = json!({
            "id": "evt_1",
            "type": "invoice.paid",
            "data": {"object": {
                "id": "in_1",
                "subscription_details": {"metadata": {"account_id": account}},
                "lines": {"data": [{"price": {"id": "price_pro"}}]}
            }}
        })
        .to_string();

        let unsigned = Request::builder()
            .method("POST")
            .uri("/api/v1/webhooks/billing")
            .body(Body::from(event.clone()))
            .unwrap();
        let response = t.app.clone().oneshot(unsigned).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let signature = sign_for_test(SECRET, chrono::Utc::now().timestamp(), event.as_bytes());
        let signed = Request::builder()
            .method("POST")
            .uri("/api/v1/webhooks/billing")
            .header("stripe-signature", signature)
            .body(Body::from(event))
            .unwrap();
        let response = t.app.clone().oneshot(signed).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (_, body) = call(&t.app, "GET", &format!("/api/v1/accounts/{}/balance", account), None).await;
        assert_eq!(body["balance"], 100);
        assert_eq!(body["tier"], "pro");
    }

    #[tokio::test]
    async fn test_sweep_and_missing_job() {
        let t = test_app();

        let (status, body) = call(&t.app, "POST", "/api/v1/recovery/sweep", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scanned"], 0);

        let (status, _) = call(
            &t.app,
            "POST",
            "/api/v1/recovery/sweep",
            Some(json!({"max_age_minutes": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&t.app, "GET", &format!("/api/v1/jobs/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
