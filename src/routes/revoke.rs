//! Token revocation (RFC 7009).
//!
//! Always answers 200 with an empty body once the caller authenticates,
//! whether or not the token existed; existence must not leak. Access
//! tokens are short-lived JWTs and revocation of one is a no-op;
//! refresh tokens are deleted, scoped to the presenting client.

use axum::Router;
use axum::extract::{FromRequest, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Form;
use serde::Deserialize;
use tracing::debug;

use crate::error::OAuthError;
use crate::state::AppState;

use super::helpers::{is_form_content_type, no_store_headers, resolve_client_auth};

#[derive(Debug, Deserialize)]
pub struct RevokeForm {
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
    Router::new().route("/revoke", post(revoke))
}

/// POST /revoke
async fn revoke(State(state): State<AppState>, request: Request) -> Response {
    let headers = request.headers().clone();
    if !is_form_content_type(&headers) {
        return OAuthError::InvalidRequest(
            "Content-Type must be application/x-www-form-urlencoded".into(),
        )
        .into_response();
    }
    let form = match Form::<RevokeForm>::from_request(request, &()).await {
        Ok(Form(form)) => form,
        Err(_) => {
            return OAuthError::InvalidRequest("malformed form body".into()).into_response();
        }
    };

    let Some(token) = form.token.as_deref().filter(|t| !t.is_empty()) else {
        return OAuthError::InvalidRequest("token is required".into()).into_response();
    };

    let hint = form.token_type_hint.as_deref();
    if let Some(hint) = hint
        && hint != "refresh_token"
        && hint != "access_token"
    {
        return OAuthError::UnsupportedTokenType.into_response();
    }

    // Confidential clients authenticate; public clients pass a bare
    // client_id that must resolve to an auth_method=none record.
    let auth = match resolve_client_auth(
        &state,
        &headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    )
    .await
    {
        Ok(auth) => auth,
        Err(e) => return e.into_response(),
    };
    let client = auth.client();

    if hint != Some("access_token") {
        match state.refresh_tokens().revoke(token, &client.id).await {
            Ok(revoked) => {
                if revoked {
                    debug!(client_id = %client.id, "refresh token revoked via endpoint");
                }
            }
            Err(e) => return e.into_response(),
        }
    }
    // Access-token revocation is a no-op: the JWTs expire on their own
    // and there is no deny-list to add them to.

    (StatusCode::OK, no_store_headers()).into_response()
}
