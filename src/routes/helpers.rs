//! Shared endpoint plumbing: response headers, the pre-redirect HTML
//! error page, and client authentication for the token-ish endpoints.

use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::OAuthError;
use crate::models::OAuthClient;
use crate::state::AppState;

/// `Cache-Control: no-store` headers required on OAuth responses
/// (RFC 6749 §5.1).
pub fn no_store_headers() -> [(HeaderName, &'static str); 2] {
    [
        (header::CACHE_CONTROL, "no-store"),
        (header::PRAGMA, "no-cache"),
    ]
}

/// Minimal HTML error page for failures that must not be redirected
/// (RFC 6749 §4.1.2.1: before the redirect URI is validated).
pub fn html_error(status: StatusCode, title: &str, message: &str) -> Response {
    let body = format!(
        r#"<!DOCTYPE html>
<html><head><title>{title}</title></head>
<body style="font-family: sans-serif; max-width: 480px; margin: 100px auto; padding: 2rem;">
<h1>{title}</h1>
<p>{message}</p>
</body></html>"#,
        title = escape_html(title),
        message = escape_html(message),
    );
    (status, Html(body)).into_response()
}

/// Escape text for interpolation into the error page.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Whether the request body is form-encoded (charset suffix allowed).
pub fn is_form_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| {
            ct.split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
        })
}

/// Credentials recovered from an HTTP Basic header (RFC 6749 §2.3.1:
/// both halves are form-urlencoded before base64).
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    let id = urlencoding::decode(id).ok()?.into_owned();
    let secret = urlencoding::decode(secret).ok()?.into_owned();
    Some((id, secret))
}

/// Clamp a post-login destination to this deployment.
///
/// Accepts site-relative paths and absolute URLs under the issuer;
/// anything else falls back to `/` so the login flow can never be used
/// as an open redirector.
pub fn safe_return_to(issuer: &str, candidate: &str) -> String {
    if candidate.starts_with('/') && !candidate.starts_with("//") {
        return candidate.to_string();
    }
    if candidate.starts_with(issuer) {
        return candidate.to_string();
    }
    "/".to_string()
}

/// How a client proved (or did not prove) itself on this request.
#[derive(Debug, Clone)]
pub enum ClientAuth {
    /// Secret-bearing client, digest verified.
    Authenticated(OAuthClient),
    /// Public client identified by `client_id` only; acceptable for a
    /// subset of operations.
    Public(OAuthClient),
}

impl ClientAuth {
    pub fn client(&self) -> &OAuthClient {
        match self {
            ClientAuth::Authenticated(c) | ClientAuth::Public(c) => c,
        }
    }
}

/// Resolve client authentication from the Basic header and form fields.
///
/// Basic and body credentials naming different clients is an error;
/// a present secret must verify; a bare `client_id` is accepted only
/// for active public clients.
pub async fn resolve_client_auth(
    state: &AppState,
    headers: &HeaderMap,
    form_client_id: Option<&str>,
    form_client_secret: Option<&str>,
) -> Result<ClientAuth, OAuthError> {
    let basic = basic_credentials(headers);
    let form_client_id = form_client_id.map(str::trim).filter(|s| !s.is_empty());
    let form_client_secret = form_client_secret.filter(|s| !s.is_empty());

    if let (Some((basic_id, _)), Some(form_id)) = (&basic, form_client_id)
        && basic_id != form_id
    {
        return Err(OAuthError::InvalidRequest(
            "client_id in Authorization header and body disagree".into(),
        ));
    }

    let client_id = basic
        .as_ref()
        .map(|(id, _)| id.as_str())
        .or(form_client_id)
        .ok_or_else(|| OAuthError::InvalidClient("client authentication required".into()))?;
    let secret = basic
        .as_ref()
        .map(|(_, secret)| secret.as_str())
        .filter(|s| !s.is_empty())
        .or(form_client_secret);

    match secret {
        Some(secret) => {
            let client = state
                .clients()
                .authenticate(client_id, secret)
                .await?
                .ok_or_else(|| {
                    OAuthError::InvalidClient("client authentication failed".into())
                })?;
            Ok(ClientAuth::Authenticated(client))
        }
        None => {
            let client = state
                .clients()
                .get(client_id)
                .await?
                .filter(OAuthClient::is_public)
                .ok_or_else(|| {
                    OAuthError::InvalidClient("client authentication required".into())
                })?;
            Ok(ClientAuth::Public(client))
        }
    }
}
