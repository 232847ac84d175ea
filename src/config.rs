use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::ledger::models::AccountTier;
use crate::metering::pricing::CreditPricing;
use crate::providers::poll::PollPolicy;

/// Which ledger store backs the service
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Flat service configuration, read from the environment (after `.env`).
///
/// Every key maps to the upper-cased environment variable of the same name,
/// e.g. `sweep_interval_secs` <- `SWEEP_INTERVAL_SECS`.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub store_backend: StoreBackend,
    pub max_db_connections: u32,

    // Recovery sweep
    pub sweep_enabled: bool,
    pub sweep_interval_secs: u64,
    pub stale_after_minutes: i64,
    pub give_up_after_minutes: i64,

    // Bounded polling for providers without callbacks
    pub poll_interval_secs: u64,
    pub poll_max_attempts: u32,
    pub poll_backoff_factor: f64,
    pub poll_max_interval_secs: u64,

    // Pricing
    pub short_clip_max_secs: u32,
    pub short_clip_credits: i64,
    pub long_clip_credits: i64,
    pub sentiment_surcharge_credits: i64,
    pub script_generation_credits: i64,
    pub content_analysis_credits: i64,
    pub creator_search_credits: i64,
    pub scrape_run_credits: i64,

    // Providers
    pub assemblyai_base_url: String,
    pub assemblyai_api_key: String,
    pub apify_base_url: String,
    pub apify_token: String,
    pub apify_actor_id: String,
    pub public_base_url: String,
    /// Echoed by the transcription provider on callbacks; callbacks are off without it
    pub transcription_webhook_secret: String,

    // Billing
    pub stripe_webhook_secret: String,
    pub stripe_tolerance_secs: i64,
    /// `price_id:tier:credits` triples separated by commas
    pub stripe_plans: String,

    // HTTP
    /// Must outlast a full scrape poll (interval * attempts)
    pub request_timeout_secs: u64,
    pub rate_limit_per_minute: u32,
    /// Comma-separated allowed origins, `*` for any
    pub cors_origins: String,
}

/// A subscription plan as resolved from a Stripe price id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanGrant {
    pub tier: AccountTier,
    pub credits: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .set_default("database_url", "postgresql://localhost/credit_ledger")?
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("store_backend", "postgres")?
            .set_default("max_db_connections", 20)?
            .set_default("sweep_enabled", true)?
            .set_default("sweep_interval_secs", 300)?
            .set_default("stale_after_minutes", 10)?
            .set_default("give_up_after_minutes", 60)?
            .set_default("poll_interval_secs", 5)?
            .set_default("poll_max_attempts", 60)?
            .set_default("poll_backoff_factor", 1.0)?
            .set_default("poll_max_interval_secs", 30)?
            .set_default("short_clip_max_secs", 90)?
            .set_default("short_clip_credits", 1)?
            .set_default("long_clip_credits", 2)?
            .set_default("sentiment_surcharge_credits", 1)?
            .set_default("script_generation_credits", 1)?
            .set_default("content_analysis_credits", 1)?
            .set_default("creator_search_credits", 1)?
            .set_default("scrape_run_credits", 1)?
            .set_default("assemblyai_base_url", "https://api.assemblyai.com")?
            .set_default("assemblyai_api_key", "")?
            .set_default("apify_base_url", "https://api.apify.com")?
            .set_default("apify_token", "")?
            .set_default("apify_actor_id", "apify~instagram-scraper")?
            .set_default("public_base_url", "http://localhost:8080")?
            .set_default("transcription_webhook_secret", "")?
            .set_default("stripe_webhook_secret", "")?
            .set_default("stripe_tolerance_secs", 300)?
            .set_default("stripe_plans", "")?
            .set_default("request_timeout_secs", 360)?
            .set_default("rate_limit_per_minute", 600)?
            .set_default("cors_origins", "http://localhost:3000")?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn pricing(&self) -> CreditPricing {
        CreditPricing {
            short_clip_max_secs: self.short_clip_max_secs,
            short_clip_credits: self.short_clip_credits,
            long_clip_credits: self.long_clip_credits,
            sentiment_surcharge_credits: self.sentiment_surcharge_credits,
            script_generation_credits: self.script_generation_credits,
            content_analysis_credits: self.content_analysis_credits,
            creator_search_credits: self.creator_search_credits,
            scrape_run_credits: self.scrape_run_credits,
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(self.poll_interval_secs),
            max_attempts: self.poll_max_attempts,
            backoff_factor: self.poll_backoff_factor,
            max_interval: Duration::from_secs(self.poll_max_interval_secs),
        }
    }

    pub fn transcription_callback_url(&self) -> String {
        format!(
            "{}/api/v1/webhooks/transcription",
            self.public_base_url.trim_end_matches('/')
        )
    }

    /// Parse `STRIPE_PLANS`, skipping malformed entries
    pub fn plan_grants(&self) -> HashMap<String, PlanGrant> {
        parse_plans(&self.stripe_plans)
    }
}

fn parse_plans(raw: &str) -> HashMap<String, PlanGrant> {
    raw.split(',')
        .filter_map(|entry| {
            let mut parts = entry.trim().split(':');
            let price_id = parts.next()?.trim();
            let tier = parts.next()?.trim().parse::<AccountTier>().ok()?;
            let credits = parts.next()?.trim().parse::<i64>().ok()?;
            if price_id.is_empty() || credits < 0 {
                return None;
            }
            Some((price_id.to_string(), PlanGrant { tier, credits }))
        })
        .collect()
}
