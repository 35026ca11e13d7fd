//! Federated sign-in endpoints.
//!
//! `GET /auth/{provider}` starts the round trip: a CSRF `state` (and,
//! where supported, a PKCE verifier) goes into the consume-once state
//! store and the browser is sent to the provider. The callback consumes
//! the state, exchanges the code, resolves the external identity to a
//! local account, provisioning one on first contact, and establishes
//! a session.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::Utc;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Deserialize;
use tracing::{info, warn};

use crate::crypto::b64url_encode;
use crate::error::OAuthResult;
use crate::models::account::CONTACT_EMAIL;
use crate::models::{Account, NewAccount, ProviderAccount};
use crate::services::federation::ProviderIdentity;
use crate::services::pkce::s256_challenge;
use crate::session;
use crate::state::AppState;

use super::helpers::{html_error, safe_return_to};

#[derive(Debug, Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub return_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/{provider}", get(start))
        .route("/auth/{provider}/callback", get(callback))
}

fn callback_uri(issuer: &str, provider: &str) -> String {
    format!("{issuer}/auth/{provider}/callback")
}

/// GET /auth/{provider}
async fn start(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    Query(query): Query<StartQuery>,
) -> Response {
    let Some(provider) = state.providers().get(&provider_name) else {
        return html_error(StatusCode::NOT_FOUND, "Unknown provider", "no such sign-in provider");
    };

    let code_verifier = provider.uses_pkce.then(|| {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        b64url_encode(&bytes)
    });
    let code_challenge = code_verifier.as_deref().map(s256_challenge);

    let return_to = query.return_to.unwrap_or_default();
    let csrf_state = match state
        .oauth_state()
        .store(&return_to, code_verifier.as_deref())
        .await
    {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to persist federated login state");
            return html_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server error",
                "internal server error",
            );
        }
    };

    let redirect_uri = callback_uri(&state.config().issuer, provider.name);
    match state
        .providers()
        .authorize_url(provider, &redirect_uri, &csrf_state, code_challenge.as_deref())
    {
        Ok(location) => {
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, provider = provider.name, "authorize URL build failed");
            html_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server error",
                "internal server error",
            )
        }
    }
}

/// GET /auth/{provider}/callback
async fn callback(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(provider) = state.providers().get(&provider_name) else {
        return html_error(StatusCode::NOT_FOUND, "Unknown provider", "no such sign-in provider");
    };

    if let Some(error) = query.error.as_deref() {
        warn!(provider = provider.name, error = %error, "provider returned an error");
        return html_error(
            StatusCode::BAD_REQUEST,
            "Sign-in failed",
            "the identity provider declined the sign-in",
        );
    }
    let (Some(csrf_state), Some(code)) = (query.state.as_deref(), query.code.as_deref()) else {
        return html_error(
            StatusCode::BAD_REQUEST,
            "Sign-in failed",
            "missing state or code",
        );
    };

    let stored = match state.oauth_state().consume(csrf_state).await {
        Ok(Some(stored)) => stored,
        Ok(None) => {
            warn!(provider = provider.name, "unknown or replayed federated login state");
            return html_error(
                StatusCode::BAD_REQUEST,
                "Sign-in failed",
                "sign-in attempt expired; start again",
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "state consume failed");
            return html_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server error",
                "internal server error",
            );
        }
    };

    let redirect_uri = callback_uri(&state.config().issuer, provider.name);
    let identity = match state
        .providers()
        .exchange_code(provider, code, &redirect_uri, stored.code_verifier.as_deref())
        .await
    {
        Ok(tokens) => match state.providers().resolve_identity(provider, &tokens).await {
            Ok(identity) if !identity.provider_sub.is_empty() => identity,
            Ok(_) => {
                warn!(provider = provider.name, "provider identity missing subject");
                return html_error(
                    StatusCode::BAD_GATEWAY,
                    "Sign-in failed",
                    "the identity provider returned an unusable identity",
                );
            }
            Err(e) => {
                warn!(provider = provider.name, error = %e, "identity resolution failed");
                return html_error(
                    StatusCode::BAD_GATEWAY,
                    "Sign-in failed",
                    "could not verify the provider response",
                );
            }
        },
        Err(e) => {
            warn!(provider = provider.name, error = %e, "code exchange failed");
            return html_error(
                StatusCode::BAD_GATEWAY,
                "Sign-in failed",
                "could not complete the sign-in with the provider",
            );
        }
    };

    let account = match resolve_or_provision(&state, provider.name, &identity).await {
        Ok(account) => account,
        Err(e) => {
            tracing::error!(error = %e, "account resolution failed");
            return html_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server error",
                "internal server error",
            );
        }
    };
    if !account.is_active {
        return html_error(StatusCode::FORBIDDEN, "Account disabled", "user_inactive");
    }

    let token = match session::issue(state.keys(), &account.id) {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(error = %e, "session issuance failed");
            return html_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server error",
                "internal server error",
            );
        }
    };

    info!(
        provider = provider.name,
        account_id = %account.id,
        "federated sign-in completed"
    );

    let destination = safe_return_to(&state.config().issuer, &stored.return_to);
    let cookie = session::cookie_header(&token, session::request_is_secure(&uri, &headers));
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, destination),
            (header::SET_COOKIE, cookie),
        ],
    )
        .into_response()
}

/// Map a provider identity to a local account, linking or provisioning
/// as needed.
async fn resolve_or_provision(
    state: &AppState,
    provider: &str,
    identity: &ProviderIdentity,
) -> OAuthResult<Account> {
    if let Some(account) = state
        .accounts()
        .find_by_provider(provider, &identity.provider_sub)
        .await?
    {
        return Ok(account);
    }

    // First contact. Attach to an existing account that owns the
    // verified email, otherwise provision a fresh one.
    let existing = match identity.email.as_deref() {
        Some(email) if identity.email_verified => {
            state.accounts().find_by_email(email).await?
        }
        _ => None,
    };

    let account = match existing {
        Some(account) => account,
        None => {
            let account = state
                .accounts()
                .create(NewAccount {
                    password: None,
                    name: identity.name.clone(),
                    given_name: identity.given_name.clone(),
                    family_name: identity.family_name.clone(),
                    picture: identity.picture.clone(),
                })
                .await?;
            if let Some(email) = identity.email.as_deref() {
                let verified_at = identity.email_verified.then(Utc::now);
                // A lost uniqueness race just means the address stays
                // with its current owner.
                state
                    .accounts()
                    .add_contact(&account.id, CONTACT_EMAIL, email, true, verified_at)
                    .await?;
            }
            account
        }
    };

    state
        .accounts()
        .link_provider(&ProviderAccount {
            provider: provider.to_string(),
            provider_sub: identity.provider_sub.clone(),
            account_id: account.id.clone(),
            contact_id: None,
        })
        .await?;

    Ok(account)
}
