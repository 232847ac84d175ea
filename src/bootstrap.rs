use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};

use crate::{
    api::{async_webhook::AsyncWebhookProcessor, handler::AppState},
    billing::{BillingService, StripeWebhookVerifier},
    config::{Config, StoreBackend},
    error::{AppError, AppResult},
    ledger::{CreditStore, InMemoryLedger, LedgerRepository},
    metering::{Reconciler, RecoveryConfig, RecoveryScheduler, RecoverySweep, SpendGate, UsageService},
    providers::{
        traits::{ScrapeProvider, TranscriptionProvider},
        ApifyClient, AssemblyAiClient, CallbackAuth,
    },
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let store: Arc<dyn CreditStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let pool = initialize_database(&config.database_url, config.max_db_connections).await?;
            Arc::new(LedgerRepository::new(pool))
        }
        StoreBackend::Memory => {
            warn!("⚠️  Using in-memory ledger - balances are lost on restart");
            Arc::new(InMemoryLedger::new())
        }
    };

    // Shared HTTP client for provider calls
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| AppError::Config(format!("HTTP client: {}", e)))?;

    if config.assemblyai_api_key.is_empty() {
        warn!("⚠️  ASSEMBLYAI_API_KEY not set - transcription calls will fail upstream");
    }
    let transcription: Arc<dyn TranscriptionProvider> = Arc::new(
        AssemblyAiClient::new(http.clone(), &config.assemblyai_base_url, &config.assemblyai_api_key)
            .with_webhook_secret(&config.transcription_webhook_secret),
    );

    if config.apify_token.is_empty() {
        warn!("⚠️  APIFY_TOKEN not set - scrape runs will fail upstream");
    }
    let scraper: Arc<dyn ScrapeProvider> = Arc::new(ApifyClient::new(
        http,
        &config.apify_base_url,
        &config.apify_token,
        &config.apify_actor_id,
    ));
    info!(
        "✅ Providers configured: {} / {}",
        transcription.name(),
        scraper.name()
    );

    // Metering core
    let spend_gate = Arc::new(SpendGate::new(store.clone()));
    let reconciler = Arc::new(Reconciler::new(store.clone(), config.pricing()));
    let callbacks_enabled =
        !config.public_base_url.is_empty() && !config.transcription_webhook_secret.is_empty();
    if !callbacks_enabled {
        warn!("⚠️  TRANSCRIPTION_WEBHOOK_SECRET or PUBLIC_BASE_URL not set - transcriptions settle via the recovery sweep");
    }
    let callback_url = callbacks_enabled.then(|| config.transcription_callback_url());
    let usage = Arc::new(UsageService::new(
        store.clone(),
        spend_gate.clone(),
        reconciler.clone(),
        transcription.clone(),
        scraper.clone(),
        config.poll_policy(),
        callback_url,
    ));

    let recovery = Arc::new(RecoverySweep::new(
        store.clone(),
        reconciler,
        transcription,
        scraper,
        RecoveryConfig {
            stale_after: chrono::Duration::minutes(config.stale_after_minutes),
            give_up_after: chrono::Duration::minutes(config.give_up_after_minutes),
            ..RecoveryConfig::default()
        },
    ));

    // Billing
    if config.stripe_webhook_secret.is_empty() {
        warn!("⚠️  STRIPE_WEBHOOK_SECRET not set - billing webhooks will be rejected");
    }
    let plans = config.plan_grants();
    info!("📋 {} subscription plan(s) configured", plans.len());
    let billing = Arc::new(BillingService::new(store.clone(), plans));
    let stripe_verifier = Arc::new(StripeWebhookVerifier::new(
        &config.stripe_webhook_secret,
        config.stripe_tolerance_secs,
    ));

    let webhooks = Arc::new(AsyncWebhookProcessor::new(usage.clone()));
    let transcription_auth = Arc::new(CallbackAuth::new(&config.transcription_webhook_secret));

    if config.sweep_enabled {
        RecoveryScheduler::new(recovery.clone(), Duration::from_secs(config.sweep_interval_secs)).start();
        info!("✅ Recovery scheduler started");
    } else {
        warn!("⚠️  Recovery sweep disabled - stuck jobs need a manual sweep");
    }

    Ok(AppState {
        store,
        spend_gate,
        usage,
        recovery,
        billing,
        stripe_verifier,
        webhooks,
        transcription_auth,
    })
}

async fn initialize_database(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", max_connections);

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
