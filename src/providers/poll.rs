use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult, CreditError};

/// Bounded polling for providers that cannot call us back.
///
/// Defaults to a fixed 5 s interval with a hard cap of 60 attempts. A
/// `backoff_factor` above 1.0 turns it into capped exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub backoff_factor: f64,
    pub max_interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 60,
            backoff_factor: 1.0,
            max_interval: Duration::from_secs(30),
        }
    }
}

impl PollPolicy {
    /// Delay after the given zero-based attempt, before jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = if self.backoff_factor.is_finite() {
            self.backoff_factor.max(1.0)
        } else {
            1.0
        };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.interval.as_secs_f64() * factor.powi(exponent);
        let cap = self.max_interval.max(self.interval).as_secs_f64();

        if secs.is_finite() && secs < cap {
            Duration::from_secs_f64(secs)
        } else {
            Duration::from_secs_f64(cap)
        }
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        // Only exponential polls are jittered; the fixed cadence stays exact
        if self.backoff_factor <= 1.0 {
            return delay;
        }
        let spread = delay.as_millis() / 10;
        let extra = u64::try_from(rand::rng().random_range(0..=spread)).unwrap_or(0);
        delay + Duration::from_millis(extra)
    }

    /// Call `probe` until it yields `Some`, the attempt budget runs out
    /// (`CreditError::Timeout`), or it returns a non-provider error.
    ///
    /// Provider hiccups (`ProviderUnavailable`) use up an attempt but do not
    /// end the poll.
    pub async fn poll<T, F, Fut>(&self, mut probe: F) -> AppResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AppResult<Option<T>>>,
    {
        for attempt in 0..self.max_attempts {
            match probe(attempt).await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => debug!(attempt, "still pending"),
                Err(AppError::Credit(CreditError::ProviderUnavailable(message))) => {
                    warn!(attempt, %message, "provider error while polling")
                }
                Err(other) => return Err(other),
            }

            if attempt + 1 < self.max_attempts {
                tokio::time::sleep(self.jittered(attempt)).await;
            }
        }

        Err(CreditError::Timeout {
            attempts: self.max_attempts,
        }
        .into())
    }
}
