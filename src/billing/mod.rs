pub mod stripe;

pub use stripe::{BillingService, StripeWebhookVerifier};
