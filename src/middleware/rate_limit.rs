use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

use crate::error::ErrorResponse;

/// Process-wide request budget
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitLayer {
    pub fn per_minute(requests: u32) -> Self {
        let requests = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        RateLimitLayer {
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(requests))),
        }
    }

    pub fn check(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

pub async fn rate_limit_middleware(
    State(limit): State<RateLimitLayer>,
    req: Request,
    next: Next,
) -> Response {
    if limit.check() {
        return next.run(req).await;
    }

    warn!(path = %req.uri().path(), "rate limit exceeded");
    let body = Json(ErrorResponse {
        error: "Rate limit exceeded. Please try again later.".to_string(),
        error_code: "RATE_LIMITED".to_string(),
        details: None,
    });
    (StatusCode::TOO_MANY_REQUESTS, body).into_response()
}
