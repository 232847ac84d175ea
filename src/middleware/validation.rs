use axum::{
    async_trait,
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

use crate::error::ErrorResponse;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Validation error: {0}")]
    InvalidInput(String),
}

impl IntoResponse for ValidationError {
    fn into_response(self) -> Response {
        let ValidationError::InvalidInput(message) = self;
        let body = Json(ErrorResponse {
            error: message,
            error_code: "INVALID_INPUT".to_string(),
            details: None,
        });

        (StatusCode::BAD_REQUEST, body).into_response()
    }
}

fn describe(errors: &ValidationErrors) -> String {
    let mut fields: Vec<String> = errors
        .field_errors()
        .into_iter()
        .map(|(field, errors)| {
            let messages: Vec<String> = errors
                .iter()
                .map(|e| {
                    e.message
                        .as_ref()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| e.code.to_string())
                })
                .collect();
            format!("{}: {}", field, messages.join(", "))
        })
        .collect();
    fields.sort();
    fields.join("; ")
}

/// JSON body extractor that runs `validator` rules before the handler sees it
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ValidationError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ValidationError::InvalidInput(format!("Invalid JSON: {}", e.body_text())))?;

        value
            .validate()
            .map_err(|e| ValidationError::InvalidInput(format!("Validation failed: {}", describe(&e))))?;

        Ok(ValidatedJson(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Validate)]
    struct Probe {
        #[validate(range(min = 1, message = "must be positive"))]
        amount: i64,
    }

    fn json_request(body: &'static str) -> Request {
        Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_valid_body_passes() {
        let ValidatedJson(probe) = ValidatedJson::<Probe>::from_request(json_request(r#"{"amount": 3}"#), &())
            .await
            .unwrap();
        assert_eq!(probe.amount, 3);
    }

    #[tokio::test]
    async fn test_rule_violation_is_reported() {
        let err = ValidatedJson::<Probe>::from_request(json_request(r#"{"amount": 0}"#), &())
            .await
            .unwrap_err();
        let ValidationError::InvalidInput(message) = err;
        assert!(message.contains("amount: must be positive"));
    }

    #[tokio::test]
    async fn test_malformed_json_is_rejected() {
        let err = ValidatedJson::<Probe>::from_request(json_request("{"), &())
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
