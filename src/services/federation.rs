//! Federated identity providers.
//!
//! Builds provider authorization URLs, exchanges callback codes, and
//! resolves the external identity. OIDC providers (google, microsoft)
//! return an ID token which is verified against the provider's JWKS,
//! fetched through a per-process cache with a one-hour lifetime;
//! graph-style providers (facebook, x) are resolved through their
//! userinfo resource with the exchanged access token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonwebtoken::DecodingKey;
use moka::sync::Cache;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{Config, ProviderCredentials};
use crate::crypto::jwt;

/// How long a fetched provider JWKS document is reused.
const JWKS_CACHE_TTL_SECS: u64 = 3600;

/// How client credentials are sent on the token exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenAuthStyle {
    /// `client_id` + `client_secret` in the form body.
    Body,
    /// HTTP Basic authentication.
    Basic,
}

/// One configured upstream provider.
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: &'static str,
    authorize_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: Option<String>,
    jwks_uri: Option<String>,
    issuer: Option<String>,
    scopes: &'static str,
    /// Whether the provider supports (or requires) PKCE.
    pub uses_pkce: bool,
    auth_style: TokenAuthStyle,
    credentials: ProviderCredentials,
}

/// Identity facts resolved from the provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderIdentity {
    pub provider_sub: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub picture: Option<String>,
}

/// Token-exchange result.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTokens {
    pub access_token: String,
    #[serde(default)]
    pub id_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteJwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteJwks {
    keys: Vec<RemoteJwk>,
}

/// Configured providers plus the shared HTTP client and JWKS cache.
pub struct ProviderRegistry {
    providers: HashMap<&'static str, Provider>,
    http: reqwest::Client,
    jwks_cache: Cache<String, Arc<RemoteJwks>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &Config) -> Self {
        let mut providers = HashMap::new();

        if let Some(credentials) = config.google.clone() {
            providers.insert(
                "google",
                Provider {
                    name: "google",
                    authorize_endpoint: "https://accounts.google.com/o/oauth2/v2/auth".into(),
                    token_endpoint: "https://oauth2.googleapis.com/token".into(),
                    userinfo_endpoint: None,
                    jwks_uri: Some("https://www.googleapis.com/oauth2/v3/certs".into()),
                    issuer: Some("https://accounts.google.com".into()),
                    scopes: "openid email profile",
                    uses_pkce: true,
                    auth_style: TokenAuthStyle::Body,
                    credentials,
                },
            );
        }
        if let Some(credentials) = config.microsoft.clone() {
            let tenant = credentials.tenant.clone().unwrap_or_else(|| "common".into());
            providers.insert(
                "microsoft",
                Provider {
                    name: "microsoft",
                    authorize_endpoint: format!(
                        "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/authorize"
                    ),
                    token_endpoint: format!(
                        "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token"
                    ),
                    userinfo_endpoint: None,
                    jwks_uri: Some(format!(
                        "https://login.microsoftonline.com/{tenant}/discovery/v2.0/keys"
                    )),
                    issuer: Some(format!("https://login.microsoftonline.com/{tenant}/v2.0")),
                    scopes: "openid email profile",
                    uses_pkce: true,
                    auth_style: TokenAuthStyle::Body,
                    credentials,
                },
            );
        }
        if let Some(credentials) = config.facebook.clone() {
            providers.insert(
                "facebook",
                Provider {
                    name: "facebook",
                    authorize_endpoint: "https://www.facebook.com/v19.0/dialog/oauth".into(),
                    token_endpoint: "https://graph.facebook.com/v19.0/oauth/access_token".into(),
                    userinfo_endpoint: Some(
                        "https://graph.facebook.com/me?fields=id,name,email,picture".into(),
                    ),
                    jwks_uri: None,
                    issuer: None,
                    scopes: "email public_profile",
                    uses_pkce: false,
                    auth_style: TokenAuthStyle::Body,
                    credentials,
                },
            );
        }
        if let Some(credentials) = config.x.clone() {
            providers.insert(
                "x",
                Provider {
                    name: "x",
                    authorize_endpoint: "https://twitter.com/i/oauth2/authorize".into(),
                    token_endpoint: "https://api.twitter.com/2/oauth2/token".into(),
                    userinfo_endpoint: Some("https://api.twitter.com/2/users/me".into()),
                    jwks_uri: None,
                    issuer: None,
                    scopes: "users.read tweet.read",
                    uses_pkce: true,
                    auth_style: TokenAuthStyle::Basic,
                    credentials,
                },
            );
        }

        Self {
            providers,
            http: reqwest::Client::new(),
            jwks_cache: Cache::builder()
                .time_to_live(Duration::from_secs(JWKS_CACHE_TTL_SECS))
                .build(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Provider> {
        self.providers.get(name)
    }

    /// Build the provider's authorization URL.
    pub fn authorize_url(
        &self,
        provider: &Provider,
        redirect_uri: &str,
        state: &str,
        code_challenge: Option<&str>,
    ) -> Result<String> {
        let mut url =
            url::Url::parse(&provider.authorize_endpoint).context("bad authorize endpoint")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &provider.credentials.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("scope", provider.scopes)
                .append_pair("state", state);
            if let Some(challenge) = code_challenge {
                query
                    .append_pair("code_challenge", challenge)
                    .append_pair("code_challenge_method", "S256");
            }
        }
        Ok(url.into())
    }

    /// Exchange the callback code for provider tokens.
    pub async fn exchange_code(
        &self,
        provider: &Provider,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<ProviderTokens> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &provider.credentials.client_id),
        ];
        if provider.auth_style == TokenAuthStyle::Body {
            form.push(("client_secret", &provider.credentials.client_secret));
        }
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier));
        }

        let mut request = self.http.post(&provider.token_endpoint).form(&form);
        if provider.auth_style == TokenAuthStyle::Basic {
            request = request.basic_auth(
                &provider.credentials.client_id,
                Some(&provider.credentials.client_secret),
            );
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("token exchange with {} failed", provider.name))?;
        if !response.status().is_success() {
            bail!(
                "token exchange with {} returned {}",
                provider.name,
                response.status()
            );
        }
        response
            .json::<ProviderTokens>()
            .await
            .with_context(|| format!("unparseable token response from {}", provider.name))
    }

    /// Resolve the external identity from exchanged tokens.
    pub async fn resolve_identity(
        &self,
        provider: &Provider,
        tokens: &ProviderTokens,
    ) -> Result<ProviderIdentity> {
        if let (Some(jwks_uri), Some(id_token)) = (&provider.jwks_uri, &tokens.id_token) {
            let claims = self.verify_id_token(provider, jwks_uri, id_token).await?;
            return Ok(identity_from_claims(&claims));
        }

        let userinfo = provider
            .userinfo_endpoint
            .as_deref()
            .ok_or_else(|| anyhow!("{} has no identity source", provider.name))?;
        let body: Value = self
            .http
            .get(userinfo)
            .bearer_auth(&tokens.access_token)
            .send()
            .await
            .with_context(|| format!("userinfo fetch from {} failed", provider.name))?
            .error_for_status()
            .with_context(|| format!("userinfo fetch from {} rejected", provider.name))?
            .json()
            .await
            .with_context(|| format!("unparseable userinfo from {}", provider.name))?;

        identity_from_userinfo(provider.name, &body)
    }

    /// Verify a provider ID token against its JWKS and return claims.
    async fn verify_id_token(
        &self,
        provider: &Provider,
        jwks_uri: &str,
        id_token: &str,
    ) -> Result<Value> {
        let parsed = jwt::parse(id_token).map_err(|e| anyhow!("bad id_token: {e}"))?;
        let kid = parsed
            .header
            .kid
            .as_deref()
            .ok_or_else(|| anyhow!("id_token missing kid"))?;

        let jwks = self.provider_jwks(jwks_uri).await?;
        let jwk = jwks
            .keys
            .iter()
            .find(|k| k.kid.as_deref() == Some(kid))
            .ok_or_else(|| anyhow!("id_token kid {kid} not in provider JWKS"))?;
        let key = decoding_key(jwk)?;

        let (_, claims) =
            jwt::verify(id_token, &key, None).map_err(|e| anyhow!("id_token rejected: {e}"))?;

        if let Some(expected_iss) = &provider.issuer {
            let iss = claims.get("iss").and_then(Value::as_str).unwrap_or_default();
            if iss != expected_iss {
                bail!("id_token issuer {iss} does not match {expected_iss}");
            }
        }
        if !audience_matches(&claims, &provider.credentials.client_id) {
            bail!("id_token audience mismatch");
        }
        Ok(claims)
    }

    async fn provider_jwks(&self, jwks_uri: &str) -> Result<Arc<RemoteJwks>> {
        if let Some(cached) = self.jwks_cache.get(jwks_uri) {
            return Ok(cached);
        }
        debug!(jwks_uri = jwks_uri, "fetching provider JWKS");
        let jwks: RemoteJwks = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .context("JWKS fetch failed")?
            .error_for_status()
            .context("JWKS fetch rejected")?
            .json()
            .await
            .context("unparseable JWKS document")?;
        let jwks = Arc::new(jwks);
        // Last writer wins; a racing refresh is harmless.
        self.jwks_cache.insert(jwks_uri.to_string(), Arc::clone(&jwks));
        Ok(jwks)
    }

    /// Drop a cached JWKS document (test hook and operator escape hatch).
    pub fn invalidate_jwks(&self, jwks_uri: &str) {
        self.jwks_cache.invalidate(jwks_uri);
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn decoding_key(jwk: &RemoteJwk) -> Result<DecodingKey> {
    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk.n.as_deref().ok_or_else(|| anyhow!("RSA JWK missing n"))?;
            let e = jwk.e.as_deref().ok_or_else(|| anyhow!("RSA JWK missing e"))?;
            DecodingKey::from_rsa_components(n, e).context("bad RSA JWK components")
        }
        "EC" => {
            let x = jwk.x.as_deref().ok_or_else(|| anyhow!("EC JWK missing x"))?;
            let y = jwk.y.as_deref().ok_or_else(|| anyhow!("EC JWK missing y"))?;
            DecodingKey::from_ec_components(x, y).context("bad EC JWK components")
        }
        other => bail!("unsupported JWK key type {other}"),
    }
}

/// `aud` may be a string or an array of strings.
fn audience_matches(claims: &Value, client_id: &str) -> bool {
    match claims.get("aud") {
        Some(Value::String(aud)) => aud == client_id,
        Some(Value::Array(auds)) => auds
            .iter()
            .any(|a| a.as_str() == Some(client_id)),
        _ => false,
    }
}

fn identity_from_claims(claims: &Value) -> ProviderIdentity {
    let text = |key: &str| {
        claims
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    // Some providers encode email_verified as the string "true".
    let email_verified = match claims.get("email_verified") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true",
        _ => false,
    };
    ProviderIdentity {
        provider_sub: text("sub").unwrap_or_default(),
        email: text("email"),
        email_verified,
        name: text("name"),
        given_name: text("given_name"),
        family_name: text("family_name"),
        picture: text("picture"),
    }
}

fn identity_from_userinfo(provider: &str, body: &Value) -> Result<ProviderIdentity> {
    match provider {
        "facebook" => {
            let id = body
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("facebook userinfo missing id"))?;
            Ok(ProviderIdentity {
                provider_sub: id.to_string(),
                email: body.get("email").and_then(Value::as_str).map(str::to_string),
                // Facebook only returns deliverable addresses.
                email_verified: body.get("email").is_some(),
                name: body.get("name").and_then(Value::as_str).map(str::to_string),
                picture: body
                    .pointer("/picture/data/url")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                ..ProviderIdentity::default()
            })
        }
        "x" => {
            let data = body.get("data").unwrap_or(body);
            let id = data
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("x userinfo missing id"))?;
            Ok(ProviderIdentity {
                provider_sub: id.to_string(),
                name: data.get("name").and_then(Value::as_str).map(str::to_string),
                ..ProviderIdentity::default()
            })
        }
        other => bail!("no userinfo mapping for provider {other}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn config_with_google() -> Config {
        Config {
            port: 3000,
            issuer: "http://localhost:3000".to_string(),
            default_audience: None,
            database_url: "postgres://unused".to_string(),
            database_max_connections: 1,
            rate_limit_window_ms: 60_000,
            rate_limit_max_requests: 100,
            cors_allowed_origins: vec!["*".to_string()],
            google: Some(ProviderCredentials {
                client_id: "google-client".to_string(),
                client_secret: "google-secret".to_string(),
                tenant: None,
            }),
            microsoft: None,
            facebook: None,
            x: None,
        }
    }

    #[test]
    fn authorize_url_carries_state_and_pkce() {
        let registry = ProviderRegistry::from_config(&config_with_google());
        let provider = registry.get("google").unwrap();
        let url = registry
            .authorize_url(
                provider,
                "http://localhost:3000/auth/google/callback",
                "state-1",
                Some("challenge-1"),
            )
            .unwrap();

        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        assert!(url.contains("client_id=google-client"));
        assert!(url.contains("state=state-1"));
        assert!(url.contains("code_challenge=challenge-1"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("response_type=code"));
    }

    #[test]
    fn unconfigured_providers_are_absent() {
        let registry = ProviderRegistry::from_config(&config_with_google());
        assert!(registry.get("google").is_some());
        assert!(registry.get("facebook").is_none());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn audience_matching_handles_both_shapes() {
        assert!(audience_matches(&json!({"aud": "c1"}), "c1"));
        assert!(audience_matches(&json!({"aud": ["c0", "c1"]}), "c1"));
        assert!(!audience_matches(&json!({"aud": "other"}), "c1"));
        assert!(!audience_matches(&json!({}), "c1"));
    }

    #[test]
    fn identity_from_oidc_claims() {
        let identity = identity_from_claims(&json!({
            "sub": "g-123",
            "email": "ada@example.com",
            "email_verified": "true",
            "name": "Ada Lovelace",
            "given_name": "Ada",
        }));
        assert_eq!(identity.provider_sub, "g-123");
        assert_eq!(identity.email.as_deref(), Some("ada@example.com"));
        assert!(identity.email_verified);
        assert_eq!(identity.given_name.as_deref(), Some("Ada"));
        assert!(identity.family_name.is_none());
    }

    #[test]
    fn identity_from_graph_userinfo() {
        let identity = identity_from_userinfo(
            "facebook",
            &json!({"id": "fb-9", "name": "Ada", "email": "ada@example.com"}),
        )
        .unwrap();
        assert_eq!(identity.provider_sub, "fb-9");
        assert!(identity.email_verified);

        let identity =
            identity_from_userinfo("x", &json!({"data": {"id": "x-7", "name": "Ada"}})).unwrap();
        assert_eq!(identity.provider_sub, "x-7");
        assert!(identity.email.is_none());
    }
}
