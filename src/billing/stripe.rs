use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::PlanGrant;
use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::ledger::store::CreditStore;

type HmacSha256 = Hmac<Sha256>;

fn rejected(reason: &str) -> AppError {
    warn!(reason, "billing webhook rejected");
    AppError::Unauthorized
}

/// Checks the `Stripe-Signature` header: `t=<unix>,v1=<hex hmac>[,v1=...]`,
/// signed over `"{t}.{body}"`.
pub struct StripeWebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl StripeWebhookVerifier {
    pub fn new(secret: &str, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.to_string(),
            tolerance_secs,
        }
    }

    pub fn verify(&self, payload: &[u8], header: &str) -> AppResult<()> {
        self.verify_at(payload, header, Utc::now().timestamp())
    }

    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> AppResult<()> {
        if self.secret.is_empty() {
            return Err(rejected("Billing webhook secret is not configured"));
        }

        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp =
            timestamp.ok_or_else(|| rejected("Signature header has no timestamp"))?;
        if signatures.is_empty() {
            return Err(rejected("Signature header has no v1 signature"));
        }
        if (now - timestamp).abs() > self.tolerance_secs {
            return Err(rejected("Signature timestamp outside tolerance"));
        }

        let matched = signatures.iter().any(|signature| {
            let Ok(expected) = hex::decode(signature) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
                return false;
            };
            mac.update(timestamp.to_string().as_bytes());
            mac.update(b".");
            mac.update(payload);
            mac.verify_slice(&expected).is_ok()
        });

        if matched {
            Ok(())
        } else {
            Err(rejected("Invalid billing webhook signature"))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BillingOutcome {
    Granted {
        account_id: Uuid,
        credits: i64,
        tier: AccountTier,
    },
    /// Invoice was already credited; redelivery
    AlreadyGranted { invoice_id: String },
    TierChanged { account_id: Uuid, tier: AccountTier },
    Ignored { event_type: String },
}

/// Applies subscription events to the ledger
pub struct BillingService {
    store: Arc<dyn CreditStore>,
    plans: HashMap<String, PlanGrant>,
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(|v| v.as_str())
}

fn account_of(object: &Value) -> AppResult<Uuid> {
    let raw = str_at(object, &["subscription_details", "metadata", "account_id"])
        .or_else(|| str_at(object, &["parent", "subscription_details", "metadata", "account_id"]))
        .or_else(|| str_at(object, &["metadata", "account_id"]))
        .ok_or_else(|| AppError::BadRequest("Event carries no account_id metadata".into()))?;

    Uuid::parse_str(raw).map_err(|_| AppError::BadRequest(format!("Invalid account_id: {}", raw)))
}

fn price_of(invoice: &Value) -> Option<&str> {
    let line = invoice.get("lines")?.get("data")?.get(0)?;
    str_at(line, &["price", "id"]).or_else(|| str_at(line, &["pricing", "price_details", "price"]))
}

impl BillingService {
    pub fn new(store: Arc<dyn CreditStore>, plans: HashMap<String, PlanGrant>) -> Self {
        Self { store, plans }
    }

    pub async fn handle_event(&self, event: StripeEvent) -> AppResult<BillingOutcome> {
        match event.event_type.as_str() {
            "invoice.paid" => self.invoice_paid(&event).await,
            "customer.subscription.deleted" => {
                let account_id = account_of(&event.data.object)?;
                self.store.set_tier(account_id, AccountTier::Free).await?;
                info!(%account_id, event_id = %event.id, "subscription cancelled, tier reset");
                Ok(BillingOutcome::TierChanged {
                    account_id,
                    tier: AccountTier::Free,
                })
            }
            other => {
                info!(event_id = %event.id, event_type = other, "ignoring billing event");
                Ok(BillingOutcome::Ignored {
                    event_type: other.to_string(),
                })
            }
        }
    }

    async fn invoice_paid(&self, event: &StripeEvent) -> AppResult<BillingOutcome> {
        let invoice = &event.data.object;
        let invoice_id = str_at(invoice, &["id"])
            .ok_or_else(|| AppError::BadRequest("Invoice has no id".into()))?;
        let account_id = account_of(invoice)?;

        let Some(plan) = price_of(invoice).and_then(|price| self.plans.get(price)) else {
            error!(%account_id, invoice_id, price = ?price_of(invoice), "paid invoice for unknown plan");
            return Ok(BillingOutcome::Ignored {
                event_type: event.event_type.clone(),
            });
        };

        let mut granted = true;
        if plan.credits > 0 {
            let reference = LedgerRef::new(RefType::Invoice, invoice_id);
            granted = self
                .store
                .credit(account_id, plan.credits, LedgerReason::SubscriptionGrant, Some(&reference))
                .await?
                .is_some();
        }

        // Idempotent, so it also runs for an invoice that was already credited
        self.store.set_tier(account_id, plan.tier).await?;

        if !granted {
            warn!(%account_id, invoice_id, "invoice already credited");
            return Ok(BillingOutcome::AlreadyGranted {
                invoice_id: invoice_id.to_string(),
            });
        }
        info!(%account_id, invoice_id, credits = plan.credits, tier = %plan.tier, "subscription credits granted");

        Ok(BillingOutcome::Granted {
            account_id,
            credits: plan.credits,
            tier: plan.tier,
        })
    }
}

#[cfg(test)]
pub(crate) fn sign_for_test(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}
