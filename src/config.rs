//! Configuration loaded from environment variables.

use std::env;

use anyhow::{Context, Result, bail};
use url::Url;

/// Credentials for one federated identity provider.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub client_id: String,
    pub client_secret: String,
    /// Microsoft-only: directory tenant ("common" when unset).
    pub tenant: Option<String>,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 3000).
    pub port: u16,

    /// Issuer identifier, an absolute http(s) URL. Required.
    ///
    /// Every minted token carries this as `iss`, and the discovery
    /// document derives all endpoint URLs from it.
    pub issuer: String,

    /// Default audience for tokens minted without an explicit client
    /// context (currently informational only).
    pub default_audience: Option<String>,

    /// PostgreSQL connection URL.
    pub database_url: String,

    /// Maximum database connections in pool (default: 10).
    pub database_max_connections: u32,

    /// Rate-limit fixed window length in milliseconds (default: 60000).
    pub rate_limit_window_ms: u64,

    /// Maximum requests per window per (scope, tenant, identifier)
    /// (default: 100).
    pub rate_limit_max_requests: i64,

    /// CORS allowed origins (comma-separated, default: "*").
    pub cors_allowed_origins: Vec<String>,

    /// Google federated sign-in credentials.
    pub google: Option<ProviderCredentials>,

    /// Microsoft federated sign-in credentials.
    pub microsoft: Option<ProviderCredentials>,

    /// Facebook federated sign-in credentials.
    pub facebook: Option<ProviderCredentials>,

    /// X (Twitter) federated sign-in credentials.
    pub x: Option<ProviderCredentials>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("PORT must be a valid u16")?;

        let issuer =
            env::var("OIDC_ISSUER").context("OIDC_ISSUER environment variable is required")?;
        validate_issuer(&issuer)?;
        // A trailing slash would change every derived endpoint URL.
        let issuer = issuer.trim_end_matches('/').to_string();

        let default_audience = env::var("OIDC_DEFAULT_AUDIENCE").ok();

        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")?;

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be a valid u32")?;

        let rate_limit_window_ms = env::var("RATE_LIMIT_WINDOW_MS")
            .unwrap_or_else(|_| "60000".to_string())
            .parse()
            .context("RATE_LIMIT_WINDOW_MS must be a valid u64")?;

        let rate_limit_max_requests = env::var("RATE_LIMIT_MAX_REQUESTS")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .context("RATE_LIMIT_MAX_REQUESTS must be a valid i64")?;

        let cors_allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|_| vec!["*".to_string()]);

        let google = provider_from_env("GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_SECRET", None);
        let microsoft = provider_from_env(
            "MICROSOFT_CLIENT_ID",
            "MICROSOFT_CLIENT_SECRET",
            Some("MICROSOFT_TENANT"),
        );
        let facebook = provider_from_env("FACEBOOK_APP_ID", "FACEBOOK_APP_SECRET", None);
        let x = provider_from_env("X_CLIENT_ID", "X_CLIENT_SECRET", None);

        Ok(Self {
            port,
            issuer,
            default_audience,
            database_url,
            database_max_connections,
            rate_limit_window_ms,
            rate_limit_max_requests,
            cors_allowed_origins,
            google,
            microsoft,
            facebook,
            x,
        })
    }
}

/// Read one provider's credential pair; absent id or secret disables it.
fn provider_from_env(
    id_var: &str,
    secret_var: &str,
    tenant_var: Option<&str>,
) -> Option<ProviderCredentials> {
    let client_id = env::var(id_var).ok()?;
    let client_secret = env::var(secret_var).ok()?;
    let tenant = tenant_var.and_then(|v| env::var(v).ok());
    Some(ProviderCredentials {
        client_id,
        client_secret,
        tenant,
    })
}

/// The issuer must be an absolute http(s) URL without query or fragment.
fn validate_issuer(issuer: &str) -> Result<()> {
    let url = Url::parse(issuer).context("OIDC_ISSUER must be an absolute URL")?;
    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("OIDC_ISSUER must use http or https");
    }
    if url.query().is_some() || url.fragment().is_some() {
        bail!("OIDC_ISSUER must not carry a query or fragment");
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn issuer_validation() {
        assert!(validate_issuer("http://localhost:3000").is_ok());
        assert!(validate_issuer("https://id.example.com").is_ok());
        assert!(validate_issuer("ftp://id.example.com").is_err());
        assert!(validate_issuer("not a url").is_err());
        assert!(validate_issuer("https://id.example.com/?x=1").is_err());
    }
}
