//! Browser session tokens.
//!
//! After sign-in the browser holds a short-lived RS256-signed JWT in an
//! `oidc_session` cookie. The token binds the browser to a subject;
//! everything else about the session is stateless.

use axum::http::{HeaderMap, Uri};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::crypto::keys::KeyManager;
use crate::crypto::{JwsAlgorithm, jwt};
use crate::error::{OAuthError, OAuthResult};

/// Session cookie name.
pub const SESSION_COOKIE: &str = "oidc_session";

/// Session lifetime: 15 minutes.
const SESSION_LIFETIME_SECS: i64 = 900;

const SESSION_PURPOSE: &str = "session";

/// Claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub purpose: String,
}

/// Mint a session token for a subject, signed with the current RS256
/// key.
pub fn issue(keys: &KeyManager, sub: &str) -> OAuthResult<String> {
    let handle = keys
        .latest_active(JwsAlgorithm::RS256)
        .ok_or_else(|| OAuthError::Internal(anyhow::anyhow!("no active RS256 signing key")))?;

    let now = Utc::now().timestamp();
    let claims = SessionClaims {
        sub: sub.to_string(),
        iat: now,
        exp: now + SESSION_LIFETIME_SECS,
        purpose: SESSION_PURPOSE.to_string(),
    };
    jwt::sign(
        &claims,
        handle.encoding_key(),
        JwsAlgorithm::RS256,
        Some(&handle.pair.kid),
    )
    .map_err(|e| OAuthError::Internal(anyhow::anyhow!("session signing failed: {e}")))
}

/// Verify a session token.
///
/// `None` for anything off: bad signature, expiry, wrong purpose, or an
/// empty subject. Session validation failures are never distinguished
/// to the browser; it is just sent back to the login page.
pub fn verify(keys: &KeyManager, token: &str) -> Option<SessionClaims> {
    let parsed = jwt::parse(token).ok()?;
    let handle = match parsed.header.kid.as_deref() {
        Some(kid) => keys.get_for_verification(kid)?,
        None => keys.latest_active(JwsAlgorithm::RS256)?,
    };

    let (_, payload) =
        jwt::verify(token, handle.decoding_key(), Some(JwsAlgorithm::RS256)).ok()?;
    let claims: SessionClaims = serde_json::from_value(payload).ok()?;

    if claims.purpose != SESSION_PURPOSE || claims.sub.is_empty() {
        return None;
    }
    Some(claims)
}

/// Render the `Set-Cookie` value for a session token.
pub fn cookie_header(token: &str, secure: bool) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={SESSION_LIFETIME_SECS}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Extract the session token from the `Cookie` header, if any.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let pair = pair.trim();
        if let Some(value) = pair.strip_prefix(SESSION_COOKIE)
            && let Some(value) = value.strip_prefix('=')
        {
            return Some(value.to_string());
        }
    }
    None
}

/// Whether the request arrived over TLS: the request target carries an
/// `https` scheme, or a fronting proxy says so via `X-Forwarded-Proto`.
pub fn request_is_secure(uri: &Uri, headers: &HeaderMap) -> bool {
    if uri.scheme_str() == Some("https") {
        return true;
    }
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn manager() -> KeyManager {
        let keys = KeyManager::new();
        keys.initialize().unwrap();
        keys
    }

    #[test]
    fn issue_and_verify_roundtrip() {
        let keys = manager();
        let token = issue(&keys, "user-456").unwrap();
        let claims = verify(&keys, &token).unwrap();
        assert_eq!(claims.sub, "user-456");
        assert_eq!(claims.purpose, "session");
        assert_eq!(claims.exp - claims.iat, SESSION_LIFETIME_SECS);
    }

    #[test]
    fn wrong_purpose_is_rejected() {
        let keys = manager();
        let handle = keys.latest_active(JwsAlgorithm::RS256).unwrap();
        let now = Utc::now().timestamp();
        let token = jwt::sign(
            &serde_json::json!({"sub": "user-456", "iat": now, "exp": now + 60, "purpose": "other"}),
            handle.encoding_key(),
            JwsAlgorithm::RS256,
            Some(&handle.pair.kid),
        )
        .unwrap();
        assert!(verify(&keys, &token).is_none());
    }

    #[test]
    fn empty_subject_is_rejected() {
        let keys = manager();
        let handle = keys.latest_active(JwsAlgorithm::RS256).unwrap();
        let now = Utc::now().timestamp();
        let token = jwt::sign(
            &serde_json::json!({"sub": "", "iat": now, "exp": now + 60, "purpose": "session"}),
            handle.encoding_key(),
            JwsAlgorithm::RS256,
            Some(&handle.pair.kid),
        )
        .unwrap();
        assert!(verify(&keys, &token).is_none());
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        let keys = manager();
        assert!(verify(&keys, "not-a-token").is_none());
    }

    #[test]
    fn cookie_attributes() {
        let cookie = cookie_header("tok", false);
        assert!(cookie.starts_with("oidc_session=tok; "));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Max-Age=900"));
        assert!(!cookie.contains("Secure"));
        assert!(cookie_header("tok", true).contains("; Secure"));
    }

    #[test]
    fn cookie_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("theme=dark; oidc_session=abc123; lang=en"),
        );
        assert_eq!(token_from_headers(&headers).as_deref(), Some("abc123"));

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("theme=dark"),
        );
        assert!(token_from_headers(&headers).is_none());
    }

    #[test]
    fn secure_detection() {
        let relative: Uri = "/login".parse().unwrap();
        let absolute: Uri = "https://id.example.com/login".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert!(!request_is_secure(&relative, &headers));
        // TLS visible in the request target itself.
        assert!(request_is_secure(&absolute, &headers));
        // TLS terminated at a proxy.
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert!(request_is_secure(&relative, &headers));
    }
}
