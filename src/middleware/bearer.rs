//! Bearer token authentication middleware.
//!
//! Parses `Authorization: Bearer <jwt>`, resolves the signing key by
//! the header `kid` (falling back to the latest active RS256 key),
//! verifies the signature and time claims, and checks `iss`. The
//! verified payload rides in request extensions for handlers.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::crypto::{JwsAlgorithm, jwt};
use crate::state::AppState;

/// Verified bearer-token payload attached to the request.
#[derive(Debug, Clone)]
pub struct BearerClaims {
    pub sub: String,
    pub client_id: Option<String>,
    pub scope: String,
    pub claims: Value,
}

impl BearerClaims {
    /// Whitespace-split scope membership check.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == scope)
    }
}

/// 401/403 challenge response per RFC 6750 §3.
fn challenge(status: StatusCode, error: &'static str) -> Response {
    let header_value = match error {
        "invalid_request" => HeaderValue::from_static("Bearer error=\"invalid_request\""),
        "insufficient_scope" => HeaderValue::from_static("Bearer error=\"insufficient_scope\""),
        _ => HeaderValue::from_static("Bearer error=\"invalid_token\""),
    };
    let body = serde_json::json!({ "error": error });
    let mut response = (status, axum::Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, header_value);
    response
}

/// Middleware protecting bearer endpoints.
pub async fn authenticate_bearer(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(auth_header) = auth_header else {
        return challenge(StatusCode::UNAUTHORIZED, "invalid_request");
    };
    let Some(token) = auth_header.strip_prefix("Bearer ") else {
        return challenge(StatusCode::UNAUTHORIZED, "invalid_request");
    };

    let parsed = match jwt::parse(token) {
        Ok(p) => p,
        Err(e) => {
            debug!(error = %e, "malformed bearer token");
            return challenge(StatusCode::UNAUTHORIZED, "invalid_token");
        }
    };

    let handle = match parsed.header.kid.as_deref() {
        Some(kid) => state.keys().get_for_verification(kid),
        None => state.keys().latest_active(JwsAlgorithm::RS256),
    };
    let Some(handle) = handle else {
        debug!("bearer token references unknown signing key");
        return challenge(StatusCode::UNAUTHORIZED, "invalid_token");
    };

    let claims =
        match jwt::verify(token, handle.decoding_key(), Some(handle.pair.algorithm)) {
            Ok((_, claims)) => claims,
            Err(e) => {
                debug!(error = %e, "bearer token verification failed");
                return challenge(StatusCode::UNAUTHORIZED, "invalid_token");
            }
        };

    if claims.get("iss").and_then(Value::as_str) != Some(state.config().issuer.as_str()) {
        debug!("bearer token issuer mismatch");
        return challenge(StatusCode::UNAUTHORIZED, "invalid_token");
    }

    // `exp` must be present and in the future; `verify` already
    // rejected present-but-passed values.
    let exp = claims.get("exp").and_then(Value::as_i64).unwrap_or(0);
    if exp <= 0 || exp <= Utc::now().timestamp() {
        return challenge(StatusCode::UNAUTHORIZED, "invalid_token");
    }

    let bearer = BearerClaims {
        sub: claims
            .get("sub")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        client_id: claims
            .get("client_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        scope: claims
            .get("scope")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        claims,
    };
    request.extensions_mut().insert(bearer);

    next.run(request).await
}

/// Layer requiring a scope on an already bearer-authenticated route.
///
/// Attach with `middleware::from_fn_with_state("openid", require_scope)`.
pub async fn require_scope(
    State(required): State<&'static str>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(bearer) = request.extensions().get::<BearerClaims>() else {
        return challenge(StatusCode::UNAUTHORIZED, "invalid_token");
    };
    if !bearer.has_scope(required) {
        return challenge(StatusCode::FORBIDDEN, "insufficient_scope");
    }
    next.run(request).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn scope_membership() {
        let bearer = BearerClaims {
            sub: "user-456".to_string(),
            client_id: None,
            scope: "openid profile email".to_string(),
            claims: Value::Null,
        };
        assert!(bearer.has_scope("openid"));
        assert!(bearer.has_scope("email"));
        assert!(!bearer.has_scope("offline_access"));
        assert!(!bearer.has_scope("open"));
    }

    #[test]
    fn challenge_sets_www_authenticate() {
        let response = challenge(StatusCode::UNAUTHORIZED, "invalid_token");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok()),
            Some("Bearer error=\"invalid_token\"")
        );
    }
}
