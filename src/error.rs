//! OAuth/OIDC error taxonomy.
//!
//! Every externally visible failure maps to an RFC 6749 §5.2 error token
//! rendered as JSON `{"error", "error_description"}`. Internal failures
//! are logged and collapse to `server_error`.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::storage::StorageError;

/// Protocol-level errors surfaced to OAuth/OIDC callers.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    InvalidClient(String),

    #[error("{0}")]
    InvalidGrant(String),

    #[error("{0}")]
    UnauthorizedClient(String),

    #[error("unsupported grant_type")]
    UnsupportedGrantType,

    #[error("unsupported response_type")]
    UnsupportedResponseType,

    #[error("{0}")]
    InvalidScope(String),

    #[error("{0}")]
    InvalidToken(String),

    #[error("{0}")]
    InsufficientScope(String),

    #[error("unsupported token type")]
    UnsupportedTokenType,

    #[error("user not found")]
    UserNotFound,

    #[error("user is not active")]
    UserInactive,

    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after: u64 },

    #[error("service unavailable")]
    ServiceUnavailable,

    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl OAuthError {
    /// The stable error token placed in the `error` field.
    pub fn error_token(&self) -> &'static str {
        match self {
            OAuthError::InvalidRequest(_) => "invalid_request",
            OAuthError::InvalidClient(_) => "invalid_client",
            OAuthError::InvalidGrant(_) => "invalid_grant",
            OAuthError::UnauthorizedClient(_) => "unauthorized_client",
            OAuthError::UnsupportedGrantType => "unsupported_grant_type",
            OAuthError::UnsupportedResponseType => "unsupported_response_type",
            OAuthError::InvalidScope(_) => "invalid_scope",
            OAuthError::InvalidToken(_) => "invalid_token",
            OAuthError::InsufficientScope(_) => "insufficient_scope",
            OAuthError::UnsupportedTokenType => "unsupported_token_type",
            OAuthError::UserNotFound => "user_not_found",
            OAuthError::UserInactive => "user_inactive",
            OAuthError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            OAuthError::ServiceUnavailable => "service_unavailable",
            OAuthError::Internal(_) => "server_error",
        }
    }

    /// HTTP status per RFC 6749 §5.2: 400 default, 401 for
    /// `invalid_client` / `invalid_token`.
    pub fn status(&self) -> StatusCode {
        match self {
            OAuthError::InvalidClient(_) | OAuthError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            OAuthError::InsufficientScope(_) | OAuthError::UserInactive => StatusCode::FORBIDDEN,
            OAuthError::UserNotFound => StatusCode::NOT_FOUND,
            OAuthError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            OAuthError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            OAuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Human-readable description for the `error_description` field.
    ///
    /// Internal errors are deliberately vague; the cause is logged, not
    /// echoed back to the caller.
    pub fn description(&self) -> String {
        match self {
            OAuthError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StorageError> for OAuthError {
    fn from(err: StorageError) -> Self {
        OAuthError::Internal(err.into())
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        if let OAuthError::Internal(e) = &self {
            tracing::error!(error = %e, "internal error surfaced as server_error");
        }

        let status = self.status();
        let body = serde_json::json!({
            "error": self.error_token(),
            "error_description": self.description(),
        });

        let mut response = (status, axum::Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));

        match &self {
            OAuthError::InvalidToken(_) => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer error=\"invalid_token\""),
                );
            }
            OAuthError::InsufficientScope(_) => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer error=\"insufficient_scope\""),
                );
            }
            OAuthError::RateLimitExceeded { retry_after } => {
                if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
                    headers.insert(header::RETRY_AFTER, v);
                }
            }
            _ => {}
        }

        response
    }
}

/// Result type alias for endpoint handlers.
pub type OAuthResult<T> = Result<T, OAuthError>;
