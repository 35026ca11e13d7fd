//! Password sign-in.
//!
//! A deliberately minimal HTML page: the provider's only first-party
//! UI. Successful sign-in sets the session cookie and bounces the
//! browser back to `return_to`, typically the `/authorize` request
//! that sent it here.

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Form;
use serde::Deserialize;
use tracing::{debug, info};

use crate::session;
use crate::state::AppState;

use super::helpers::{escape_html, safe_return_to};

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    #[serde(default)]
    pub return_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub return_to: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", get(login_form))
        .route("/login", post(login_submit))
}

/// GET /login?return_to=
async fn login_form(Query(query): Query<LoginQuery>) -> Response {
    let return_to = query.return_to.unwrap_or_default();
    Html(render_form(&return_to, None)).into_response()
}

/// POST /login
async fn login_submit(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let return_to = form.return_to.clone().unwrap_or_default();

    let account = match state.accounts().find_by_email(form.email.trim()).await {
        Ok(account) => account,
        Err(e) => {
            tracing::error!(error = %e, "account lookup failed during login");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(render_form(&return_to, Some("Something went wrong. Try again."))),
            )
                .into_response();
        }
    };

    let authenticated = account
        .filter(|a| a.is_active)
        .filter(|a| state.accounts().verify_password(a, &form.password));
    let Some(account) = authenticated else {
        debug!(email = %form.email, "failed sign-in attempt");
        return (
            StatusCode::UNAUTHORIZED,
            Html(render_form(&return_to, Some("Invalid email or password."))),
        )
            .into_response();
    };

    let token = match session::issue(state.keys(), &account.id) {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(error = %e, "session issuance failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(render_form(&return_to, Some("Something went wrong. Try again."))),
            )
                .into_response();
        }
    };

    info!(account_id = %account.id, "user signed in");

    let destination = safe_return_to(&state.config().issuer, &return_to);
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

fn render_form(return_to: &str, error: Option<&str>) -> String {
    let error_html = error
        .map(|e| format!("<p style=\"color: #b00;\">{}</p>", escape_html(e)))
        .unwrap_or_default();
    format!(
        r#"<!DOCTYPE html>
<html><head><title>Sign in</title></head>
<body style="font-family: sans-serif; max-width: 400px; margin: 100px auto; padding: 2rem;">
<h1>Sign in</h1>
{error_html}
<form method="post" action="/login">
<input type="hidden" name="return_to" value="{return_to}">
<p><label>Email<br><input type="email" name="email" required></label></p>
<p><label>Password<br><input type="password" name="password" required></label></p>
<p><button type="submit">Sign in</button></p>
</form>
</body></html>"#,
        return_to = escape_html(return_to),
        error_html = error_html,
    )
}
