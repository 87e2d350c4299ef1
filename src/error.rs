use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

/// Every way a webhook request can stop short of success. Messages sent to the
/// client are fixed per kind; details stay in the logs.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("missing or invalid API key")]
    Unauthorized,
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("request body of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("too many requests in flight")]
    Unavailable,
    #[error("unexpected failure: {0}")]
    Internal(String),
}

impl WebhookError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidJson(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::RateLimited => "Rate limit exceeded. Please try again later.".to_string(),
            Self::Unauthorized => "Unauthorized".to_string(),
            Self::PayloadTooLarge(_) => "Payload too large".to_string(),
            Self::InvalidJson(_) => "Invalid JSON format".to_string(),
            Self::Validation(reason) => reason.clone(),
            Self::Storage(_) => "Database error".to_string(),
            Self::Unavailable => "Service unavailable".to_string(),
            Self::Internal(_) => "Internal Server Error".to_string(),
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.client_message() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_details_are_not_exposed() {
        let err = WebhookError::Storage(StoreError::Timestamp("garbage".to_string()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.client_message(), "Database error");
        assert!(err.to_string().contains("garbage"));
    }

    #[test]
    fn validation_reason_is_echoed() {
        let err = WebhookError::Validation("Field 'error' must be a boolean".to_string());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.client_message(), "Field 'error' must be a boolean");
    }

    #[test]
    fn status_table() {
        assert_eq!(WebhookError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(WebhookError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(WebhookError::Unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            WebhookError::PayloadTooLarge(70_000).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            WebhookError::Internal("boom".to_string()).client_message(),
            "Internal Server Error"
        );
    }
}
