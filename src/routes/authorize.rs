//! Authorization endpoint (RFC 6749 §4.1.1, OIDC Core §3.1.2).
//!
//! Validation order matters: until the client and its registered
//! redirect URI check out, errors render an HTML page; redirecting an
//! unvalidated URI would make the endpoint an open redirector. From
//! that point on, errors go back to the client via 302 with `error`
//! and the echoed `state`.

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use url::Url;

use crate::services::codes::IssueCode;
use crate::session;
use crate::state::AppState;

use super::helpers::html_error;

/// Maximum `state` length.
const MAX_STATE_LENGTH: usize = 512;

/// Maximum `scope` length.
const MAX_SCOPE_LENGTH: usize = 2048;

/// Maximum PKCE `code_challenge` length (RFC 7636 §4.2).
const MAX_CODE_CHALLENGE_LENGTH: usize = 128;

const ALLOWED_PROMPTS: &[&str] = &["none", "login", "consent", "select_account"];

#[derive(Debug, Deserialize)]
pub struct AuthorizeParams {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub response_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub code_challenge: Option<String>,
    #[serde(default)]
    pub code_challenge_method: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub max_age: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/authorize", get(authorize))
}

/// GET /authorize
async fn authorize(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    // --- Errors up to redirect-URI validation render HTML. ---

    let client_id = params.client_id.as_deref().map(str::trim).unwrap_or("");
    if client_id.is_empty() {
        return html_error(StatusCode::BAD_REQUEST, "Invalid request", "client_id is required");
    }

    let redirect_uri = params.redirect_uri.as_deref().unwrap_or("");
    if redirect_uri.is_empty() || !is_absolute_http_url(redirect_uri) {
        return html_error(
            StatusCode::BAD_REQUEST,
            "Invalid request",
            "redirect_uri must be an absolute http(s) URL",
        );
    }

    let state_param = params.state.as_deref().unwrap_or("");
    if state_param.len() > MAX_STATE_LENGTH {
        return html_error(StatusCode::BAD_REQUEST, "Invalid request", "state is too long");
    }
    let scope_param = params.scope.as_deref().unwrap_or("");
    if scope_param.len() > MAX_SCOPE_LENGTH {
        return html_error(StatusCode::BAD_REQUEST, "Invalid request", "scope is too long");
    }

    let client = match state.clients().get(client_id).await {
        Ok(Some(client)) => client,
        Ok(None) => {
            return html_error(StatusCode::BAD_REQUEST, "Unknown client", "invalid_client");
        }
        Err(e) => {
            tracing::error!(error = %e, "client lookup failed");
            return html_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Server error",
                "internal server error",
            );
        }
    };

    // Exact string membership; no normalization of any kind.
    if !client.has_redirect_uri(redirect_uri) {
        return html_error(
            StatusCode::BAD_REQUEST,
            "Invalid request",
            "redirect_uri is not registered for this client",
        );
    }

    // --- The redirect URI is trusted from here on. ---

    let state_echo = (!state_param.is_empty()).then_some(state_param);

    if params.response_type.as_deref() != Some("code") {
        return error_redirect(
            redirect_uri,
            "unsupported_response_type",
            "response_type must be code",
            state_echo,
        );
    }

    let scopes: Vec<String> = scope_param
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if !scopes.iter().any(|s| s == "openid") {
        return error_redirect(
            redirect_uri,
            "invalid_scope",
            "scope must include openid",
            state_echo,
        );
    }
    let rejected: Vec<&str> = scopes
        .iter()
        .filter(|s| !client.allows_scope(s))
        .map(String::as_str)
        .collect();
    if !rejected.is_empty() {
        return error_redirect(
            redirect_uri,
            "invalid_scope",
            &format!("scope not allowed for this client: {}", rejected.join(" ")),
            state_echo,
        );
    }

    if !client.supports_response_type("code") {
        return error_redirect(
            redirect_uri,
            "unauthorized_client",
            "client may not use the code response type",
            state_echo,
        );
    }

    if client.is_public() && params.code_challenge.is_none() {
        return error_redirect(
            redirect_uri,
            "invalid_request",
            "PKCE is required",
            state_echo,
        );
    }

    if let Some(method) = params.code_challenge_method.as_deref()
        && method != "S256"
        && method != "plain"
    {
        return error_redirect(
            redirect_uri,
            "invalid_request",
            "code_challenge_method must be S256 or plain",
            state_echo,
        );
    }

    if let Some(prompt) = params.prompt.as_deref()
        && !ALLOWED_PROMPTS.contains(&prompt)
    {
        return error_redirect(redirect_uri, "invalid_request", "invalid prompt", state_echo);
    }

    if let Some(max_age) = params.max_age.as_deref()
        && max_age.parse::<u64>().is_err()
    {
        return error_redirect(
            redirect_uri,
            "invalid_request",
            "max_age must be a non-negative integer",
            state_echo,
        );
    }

    if let Some(challenge) = params.code_challenge.as_deref()
        && challenge.len() > MAX_CODE_CHALLENGE_LENGTH
    {
        return error_redirect(
            redirect_uri,
            "invalid_request",
            "code_challenge is too long",
            state_echo,
        );
    }
    if params.code_challenge_method.is_some() && params.code_challenge.is_none() {
        return error_redirect(
            redirect_uri,
            "invalid_request",
            "code_challenge_method requires code_challenge",
            state_echo,
        );
    }

    // --- Request is valid; require a signed-in browser. ---

    let session_claims = session::token_from_headers(&headers)
        .and_then(|token| session::verify(state.keys(), &token));
    let Some(session_claims) = session_claims else {
        let return_to = format!(
            "{}{}",
            state.config().issuer,
            uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/authorize")
        );
        let location = format!(
            "{}/login?return_to={}",
            state.config().issuer,
            urlencoding::encode(&return_to)
        );
        return redirect(location);
    };

    let issue = IssueCode {
        client_id: client.id.clone(),
        redirect_uri: redirect_uri.to_string(),
        scopes,
        user_id: session_claims.sub.clone(),
        code_challenge: params.code_challenge.clone(),
        code_challenge_method: params.code_challenge_method.clone(),
        nonce: params.nonce.clone(),
        // The session's iat is when the user actually authenticated.
        auth_time: session_claims.iat,
    };
    let code = match state.codes().issue(issue).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "authorization code issuance failed");
            return error_redirect(redirect_uri, "server_error", "code issuance failed", state_echo);
        }
    };

    let separator = if redirect_uri.contains('?') { '&' } else { '?' };
    let mut location = format!("{redirect_uri}{separator}code={}", urlencoding::encode(&code));
    if let Some(s) = state_echo {
        location.push_str(&format!("&state={}", urlencoding::encode(s)));
    }
    redirect(location)
}

fn is_absolute_http_url(candidate: &str) -> bool {
    match Url::parse(candidate) {
        Ok(url) => url.scheme() == "http" || url.scheme() == "https",
        Err(_) => false,
    }
}

/// 302 with CRLF stripped so nothing can inject headers through a
/// parameter that survived validation.
fn redirect(location: String) -> Response {
    let safe: String = location.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    (StatusCode::FOUND, [(axum::http::header::LOCATION, safe)]).into_response()
}

/// 302 back to the validated redirect URI with an error (RFC 6749
/// §4.1.2.1).
fn error_redirect(
    redirect_uri: &str,
    error: &str,
    description: &str,
    state: Option<&str>,
) -> Response {
    let separator = if redirect_uri.contains('?') { '&' } else { '?' };
    let mut location = format!(
        "{redirect_uri}{separator}error={}&error_description={}",
        urlencoding::encode(error),
        urlencoding::encode(description)
    );
    if let Some(state) = state {
        location.push_str(&format!("&state={}", urlencoding::encode(state)));
    }
    redirect(location)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn location(response: &Response) -> String {
        response
            .headers()
            .get(axum::http::header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn absolute_url_check() {
        assert!(is_absolute_http_url("https://example.com/cb"));
        assert!(is_absolute_http_url("http://localhost:8080/cb?x=1"));
        assert!(!is_absolute_http_url("/relative"));
        assert!(!is_absolute_http_url("javascript:alert(1)"));
        assert!(!is_absolute_http_url("ftp://example.com/cb"));
    }

    #[test]
    fn error_redirect_carries_state_iff_present() {
        let response = error_redirect("https://example.com/cb", "invalid_scope", "bad", Some("s1"));
        assert_eq!(response.status(), StatusCode::FOUND);
        let location_str = location(&response);
        assert!(location_str.starts_with("https://example.com/cb?error=invalid_scope"));
        assert!(location_str.contains("&state=s1"));

        let response = error_redirect("https://example.com/cb", "invalid_scope", "bad", None);
        assert!(!location(&response).contains("state="));
    }

    #[test]
    fn error_redirect_appends_to_existing_query() {
        let response =
            error_redirect("https://example.com/cb?app=1", "invalid_request", "x", None);
        assert!(location(&response).starts_with("https://example.com/cb?app=1&error="));
    }

    #[test]
    fn redirect_strips_crlf() {
        let response = redirect("https://example.com/cb?x=a\r\nSet-Cookie: evil".to_string());
        assert_eq!(
            location(&response),
            "https://example.com/cb?x=aSet-Cookie: evil"
        );
    }
}
