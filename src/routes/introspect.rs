//! Token introspection (RFC 7662).
//!
//! Requires client authentication and always answers 200; a token that
//! does not resolve in either path is simply `{"active": false}`.

use axum::Router;
use axum::extract::{FromRequest, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::crypto::{JwsAlgorithm, jwt};
use crate::error::OAuthError;
use crate::state::AppState;

use super::helpers::{ClientAuth, is_form_content_type, no_store_headers, resolve_client_auth};

#[derive(Debug, Deserialize)]
pub struct IntrospectForm {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_type_hint: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/introspect", post(introspect))
}

/// POST /introspect
async fn introspect(State(state): State<AppState>, request: Request) -> Response {
    let headers = request.headers().clone();
    if !is_form_content_type(&headers) {
        return OAuthError::InvalidRequest(
            "Content-Type must be application/x-www-form-urlencoded".into(),
        )
        .into_response();
    }
    let form = match Form::<IntrospectForm>::from_request(request, &()).await {
        Ok(Form(form)) => form,
        Err(_) => {
            return OAuthError::InvalidRequest("malformed form body".into()).into_response();
        }
    };

    // Introspection callers must hold a secret; a bare public
    // client_id is not enough to learn about tokens.
    let auth = match resolve_client_auth(
        &state,
        &headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    )
    .await
    {
        Ok(ClientAuth::Authenticated(client)) => client,
        Ok(ClientAuth::Public(_)) => {
            return OAuthError::InvalidClient("client authentication required".into())
                .into_response();
        }
        Err(e) => return e.into_response(),
    };

    let Some(token) = form.token.as_deref().filter(|t| !t.is_empty()) else {
        return OAuthError::InvalidRequest("token is required".into()).into_response();
    };
    let hint = form.token_type_hint.as_deref();

    debug!(client_id = %auth.id, "introspection request");

    if hint != Some("refresh_token")
        && let Some(body) = introspect_access_token(&state, token)
    {
        return (no_store_headers(), Json(body)).into_response();
    }

    if hint != Some("access_token") {
        match introspect_refresh_token(&state, token).await {
            Ok(Some(body)) => return (no_store_headers(), Json(body)).into_response(),
            Ok(None) => {}
            Err(e) => return e.into_response(),
        }
    }

    (no_store_headers(), Json(json!({ "active": false }))).into_response()
}

/// JWT access-token path. `None` means "not a token we minted".
fn introspect_access_token(state: &AppState, token: &str) -> Option<Value> {
    let parsed = jwt::parse(token).ok()?;

    // Resolve by kid; an unknown kid falls back to the latest active
    // key of the header algorithm.
    let alg = JwsAlgorithm::parse(&parsed.header.alg).ok()?;
    let handle = parsed
        .header
        .kid
        .as_deref()
        .and_then(|kid| state.keys().get_for_verification(kid))
        .or_else(|| state.keys().latest_active(alg))?;

    match jwt::verify(token, handle.decoding_key(), Some(handle.pair.algorithm)) {
        Ok((_, claims)) => {
            if claims.get("iss").and_then(Value::as_str)
                != Some(state.config().issuer.as_str())
            {
                return None;
            }
            let mut body = json!({
                "active": true,
                "scope": claims.get("scope").cloned().unwrap_or(Value::Null),
                "client_id": claims.get("client_id").cloned().unwrap_or(Value::Null),
                "username": claims.get("sub").cloned().unwrap_or(Value::Null),
                "sub": claims.get("sub").cloned().unwrap_or(Value::Null),
                "token_type": "Bearer",
                "exp": claims.get("exp").cloned().unwrap_or(Value::Null),
                "iat": claims.get("iat").cloned().unwrap_or(Value::Null),
            });
            for optional in ["iss", "aud", "jti"] {
                if let Some(value) = claims.get(optional) {
                    body[optional] = value.clone();
                }
            }
            Some(body)
        }
        Err(jwt::JwtError::Expired) => {
            // Signature checked out; report the expiry.
            let exp = parsed.payload.get("exp").cloned().unwrap_or(Value::Null);
            Some(json!({ "active": false, "exp": exp }))
        }
        Err(_) => None,
    }
}

/// Opaque refresh-token path; looks up without consuming.
async fn introspect_refresh_token(
    state: &AppState,
    token: &str,
) -> Result<Option<Value>, OAuthError> {
    let Some(record) = state.refresh_tokens().lookup(token).await? else {
        return Ok(None);
    };

    if record.expires_at < Utc::now() {
        return Ok(Some(json!({
            "active": false,
            "exp": record.expires_at.timestamp(),
        })));
    }

    Ok(Some(json!({
        "active": true,
        "scope": record.scopes.join(" "),
        "client_id": record.client_id,
        "username": record.user_id,
        "sub": record.user_id,
        "token_type": "refresh_token",
        "exp": record.expires_at.timestamp(),
        "iat": record.created_at.timestamp(),
    })))
}
