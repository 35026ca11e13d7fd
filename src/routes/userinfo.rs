//! UserInfo endpoint (OIDC Core §5.3).
//!
//! Bearer-protected (see the middleware wiring in `routes::app`);
//! projects claims gated by the access token's scopes.

use axum::Extension;
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::{Map, Value, json};

use crate::error::{OAuthError, OAuthResult};
use crate::middleware::BearerClaims;
use crate::models::ContactMethod;
use crate::models::account::{CONTACT_EMAIL, CONTACT_PHONE};
use crate::state::AppState;

use super::helpers::no_store_headers;

pub fn router() -> Router<AppState> {
    Router::new().route("/userinfo", get(userinfo))
}

/// GET /userinfo
async fn userinfo(
    State(state): State<AppState>,
    Extension(bearer): Extension<BearerClaims>,
) -> Response {
    match build_userinfo(&state, &bearer).await {
        Ok(body) => (no_store_headers(), axum::Json(body)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn build_userinfo(state: &AppState, bearer: &BearerClaims) -> OAuthResult<Value> {
    let account = state
        .accounts()
        .get(&bearer.sub)
        .await?
        .ok_or(OAuthError::UserNotFound)?;
    if !account.is_active {
        return Err(OAuthError::UserInactive);
    }

    let mut body = Map::new();
    body.insert("sub".into(), Value::from(account.id.clone()));

    if bearer.has_scope("profile") {
        for (claim, value) in [
            ("name", &account.name),
            ("given_name", &account.given_name),
            ("family_name", &account.family_name),
            ("picture", &account.picture),
        ] {
            if let Some(value) = value {
                body.insert(claim.into(), Value::from(value.clone()));
            }
        }
    }

    if bearer.has_scope("email") {
        let contacts = state.accounts().contacts(&account.id).await?;
        let emails: Vec<&ContactMethod> =
            contacts.iter().filter(|c| c.kind == CONTACT_EMAIL).collect();
        let phones: Vec<&ContactMethod> =
            contacts.iter().filter(|c| c.kind == CONTACT_PHONE).collect();

        if let Some(primary) = emails
            .iter()
            .find(|c| c.is_primary)
            .or_else(|| emails.first())
        {
            body.insert("email".into(), Value::from(primary.value.clone()));
            body.insert("email_verified".into(), Value::from(primary.is_verified()));
        }
        body.insert("emails".into(), contact_list(&emails));
        body.insert("phone_numbers".into(), contact_list(&phones));
    }

    Ok(Value::Object(body))
}

fn contact_list(contacts: &[&ContactMethod]) -> Value {
    Value::Array(
        contacts
            .iter()
            .map(|c| {
                json!({
                    "value": c.value,
                    "verified": c.is_verified(),
                    "primary": c.is_primary,
                })
            })
            .collect(),
    )
}
