//! Token endpoint (RFC 6749 §3.2, OIDC Core §3.1.3).
//!
//! Implements the `authorization_code` and `refresh_token` grants.
//! Both redeem a one-time ticket through the consume-once stores, mint
//! an RS256 access token and ID token, and, when the grant allows it,
//! issue a rotated refresh token.

use axum::extract::{FromRequest, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::crypto::JwsAlgorithm;
use crate::crypto::jwt;
use crate::error::{OAuthError, OAuthResult};
use crate::models::{Account, OAuthClient};
use crate::services::pkce::verify_pkce;
use crate::services::refresh::IssueRefreshToken;
use crate::state::AppState;

use super::helpers::{ClientAuth, is_form_content_type, no_store_headers, resolve_client_auth};

/// Access-token lifetime: 1 hour.
const ACCESS_TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Deserialize)]
pub struct TokenForm {
    #[serde(default)]
    pub grant_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub code_verifier: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

/// Successful token response (RFC 6749 §5.1).
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub scope: String,
    pub id_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/token", post(token))
}

/// POST /token
async fn token(State(state): State<AppState>, request: Request) -> Response {
    let headers = request.headers().clone();
    if !is_form_content_type(&headers) {
        return OAuthError::InvalidRequest(
            "Content-Type must be application/x-www-form-urlencoded".into(),
        )
        .into_response();
    }
    let form = match Form::<TokenForm>::from_request(request, &()).await {
        Ok(Form(form)) => form,
        Err(_) => {
            return OAuthError::InvalidRequest("malformed form body".into()).into_response();
        }
    };

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

    let result = match form.grant_type.as_str() {
        "authorization_code" => authorization_code_grant(&state, auth, &form).await,
        "refresh_token" => refresh_token_grant(&state, auth, &form).await,
        _ => Err(OAuthError::UnsupportedGrantType),
    };

    match result {
        Ok(response) => (no_store_headers(), Json(response)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// RFC 6749 §4.1.3 + PKCE (RFC 7636 §4.6).
async fn authorization_code_grant(
    state: &AppState,
    auth: ClientAuth,
    form: &TokenForm,
) -> OAuthResult<TokenResponse> {
    let client = auth.client().clone();

    let code = form
        .code
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| OAuthError::InvalidRequest("code is required".into()))?;
    let redirect_uri = form
        .redirect_uri
        .as_deref()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| OAuthError::InvalidRequest("redirect_uri is required".into()))?;

    if !client.supports_grant_type("authorization_code") {
        return Err(OAuthError::UnauthorizedClient(
            "client may not use the authorization_code grant".into(),
        ));
    }

    let record = state
        .codes()
        .consume(code, &client.id, redirect_uri)
        .await?
        .ok_or_else(|| {
            OAuthError::InvalidGrant("authorization code is invalid, expired, or already used".into())
        })?;

    // Public clients must have bound a challenge at /authorize.
    if client.is_public() && record.code_challenge.is_none() {
        return Err(OAuthError::InvalidGrant("PKCE required".into()));
    }

    if let Some(challenge) = record.code_challenge.as_deref() {
        let verifier = form
            .code_verifier
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| OAuthError::InvalidGrant("code_verifier is required".into()))?;
        // Absent method means plain (RFC 7636 §4.3).
        let method = record.code_challenge_method.as_deref().unwrap_or("plain");
        if !verify_pkce(challenge, method, verifier) {
            return Err(OAuthError::InvalidGrant("PKCE verification failed".into()));
        }
    }

    let account = state
        .accounts()
        .get(&record.user_id)
        .await?
        .ok_or_else(|| {
            OAuthError::Internal(anyhow::anyhow!(
                "authorization code references missing user {}",
                record.user_id
            ))
        })?;
    if !account.is_active {
        return Err(OAuthError::InvalidGrant("user is not active".into()));
    }

    let refresh_token = if client.supports_grant_type("refresh_token")
        && record.scopes.iter().any(|s| s == "offline_access")
    {
        let issued = state
            .refresh_tokens()
            .issue(IssueRefreshToken {
                client_id: client.id.clone(),
                user_id: account.id.clone(),
                scopes: record.scopes.clone(),
                auth_time: Some(record.auth_time),
            })
            .await?;
        Some(issued.token)
    } else {
        None
    };

    mint_response(
        state,
        &client,
        &account,
        &record.scopes,
        record.auth_time,
        record.nonce.as_deref(),
        refresh_token,
    )
    .await
}

/// RFC 6749 §6 with mandatory rotation.
async fn refresh_token_grant(
    state: &AppState,
    auth: ClientAuth,
    form: &TokenForm,
) -> OAuthResult<TokenResponse> {
    // Credential-less requests are acceptable only for the
    // authorization_code grant.
    let ClientAuth::Authenticated(client) = auth else {
        return Err(OAuthError::InvalidClient(
            "client authentication required".into(),
        ));
    };

    let token = form
        .refresh_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| OAuthError::InvalidRequest("refresh_token is required".into()))?;

    if !client.supports_grant_type("refresh_token") {
        return Err(OAuthError::UnauthorizedClient(
            "client may not use the refresh_token grant".into(),
        ));
    }

    let record = state
        .refresh_tokens()
        .consume(token, &client.id)
        .await?
        .ok_or_else(|| {
            OAuthError::InvalidGrant("refresh token is invalid, expired, or already used".into())
        })?;

    let account = state
        .accounts()
        .get(&record.user_id)
        .await?
        .ok_or_else(|| {
            OAuthError::Internal(anyhow::anyhow!(
                "refresh token references missing user {}",
                record.user_id
            ))
        })?;
    if !account.is_active {
        return Err(OAuthError::InvalidGrant("user is not active".into()));
    }

    // Legacy records carry no auth_time; their creation instant is the
    // best available bound.
    let auth_time = record.auth_time.unwrap_or(record.created_at.timestamp());

    // Rotation: the old token is already consumed; a failure from here
    // on forces the client to re-authenticate, which beats any window
    // where two tokens are live.
    let rotated = state
        .refresh_tokens()
        .issue(IssueRefreshToken {
            client_id: client.id.clone(),
            user_id: account.id.clone(),
            scopes: record.scopes.clone(),
            auth_time: Some(auth_time),
        })
        .await?;

    mint_response(
        state,
        &client,
        &account,
        &record.scopes,
        auth_time,
        None,
        Some(rotated.token),
    )
    .await
}

async fn mint_response(
    state: &AppState,
    client: &OAuthClient,
    account: &Account,
    scopes: &[String],
    auth_time: i64,
    nonce: Option<&str>,
    refresh_token: Option<String>,
) -> OAuthResult<TokenResponse> {
    let now = Utc::now().timestamp();
    let scope = scopes.join(" ");

    let access_token = mint_access_token(state, client, account, &scope, now)?;
    let id_token = mint_id_token(state, client, account, scopes, now, auth_time, nonce).await?;

    Ok(TokenResponse {
        access_token,
        token_type: "Bearer",
        expires_in: ACCESS_TOKEN_LIFETIME_SECS,
        scope,
        id_token,
        refresh_token,
    })
}

/// RS256 bearer JWT: `{iss, sub, aud, iat, exp, scope, client_id, jti}`.
fn mint_access_token(
    state: &AppState,
    client: &OAuthClient,
    account: &Account,
    scope: &str,
    now: i64,
) -> OAuthResult<String> {
    let handle = state
        .keys()
        .initialize()
        .map_err(OAuthError::Internal)?;

    let claims = serde_json::json!({
        "iss": state.config().issuer,
        "sub": account.id,
        "aud": client.id,
        "iat": now,
        "exp": now + ACCESS_TOKEN_LIFETIME_SECS,
        "scope": scope,
        "client_id": client.id,
        "jti": Uuid::new_v4().to_string(),
    });
    jwt::sign(
        &claims,
        handle.encoding_key(),
        JwsAlgorithm::RS256,
        Some(&handle.pair.kid),
    )
    .map_err(|e| OAuthError::Internal(anyhow::anyhow!("access token signing failed: {e}")))
}

/// ID token with scope-gated identity claims (OIDC Core §2, §5.4).
async fn mint_id_token(
    state: &AppState,
    client: &OAuthClient,
    account: &Account,
    scopes: &[String],
    now: i64,
    auth_time: i64,
    nonce: Option<&str>,
) -> OAuthResult<String> {
    let handle = state
        .keys()
        .initialize()
        .map_err(OAuthError::Internal)?;

    let mut claims = Map::new();
    claims.insert("iss".into(), Value::from(state.config().issuer.clone()));
    claims.insert("sub".into(), Value::from(account.id.clone()));
    claims.insert("aud".into(), Value::from(client.id.clone()));
    claims.insert("iat".into(), Value::from(now));
    claims.insert("exp".into(), Value::from(now + ACCESS_TOKEN_LIFETIME_SECS));
    claims.insert("auth_time".into(), Value::from(auth_time));
    if let Some(nonce) = nonce {
        claims.insert("nonce".into(), Value::from(nonce));
    }

    if scopes.iter().any(|s| s == "email")
        && let Some(email) = state.accounts().primary_email(&account.id).await?
    {
        claims.insert("email".into(), Value::from(email.value.clone()));
        claims.insert("email_verified".into(), Value::from(email.is_verified()));
    }

    if scopes.iter().any(|s| s == "profile") {
        for (claim, value) in [
            ("name", &account.name),
            ("given_name", &account.given_name),
            ("family_name", &account.family_name),
            ("picture", &account.picture),
        ] {
            if let Some(value) = value {
                claims.insert(claim.into(), Value::from(value.clone()));
            }
        }
    }

    jwt::sign(
        &Value::Object(claims),
        handle.encoding_key(),
        JwsAlgorithm::RS256,
        Some(&handle.pair.kid),
    )
    .map_err(|e| OAuthError::Internal(anyhow::anyhow!("id token signing failed: {e}")))
}
