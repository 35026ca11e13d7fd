//! OAuth client registry.
//!
//! Client records live in the `clients` table. Secrets are stored as
//! argon2 digests only; the plaintext is returned exactly once, at
//! registration. Deactivation is soft: the record stays, but lookup and
//! authentication reject it.

use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::crypto::b64url_encode;
use crate::error::{OAuthError, OAuthResult};
use crate::storage::{SharedGateway, Table};

/// Grant types a client may be registered with.
pub const ALLOWED_GRANT_TYPES: &[&str] = &[
    "authorization_code",
    "refresh_token",
    "client_credentials",
    "password",
    "implicit",
];

/// Response types a client may be registered with.
pub const ALLOWED_RESPONSE_TYPES: &[&str] = &["code", "token", "id_token"];

/// Scopes a client may be granted.
pub const ALLOWED_SCOPES: &[&str] = &["openid", "profile", "email", "offline_access"];

/// Token-endpoint authentication methods.
pub const ALLOWED_AUTH_METHODS: &[&str] = &["client_secret_basic", "client_secret_post", "none"];

/// A registered relying party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClient {
    pub id: String,
    pub name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub scopes: Vec<String>,
    pub token_endpoint_auth_method: String,
    #[serde(default)]
    pub secret_hash: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OAuthClient {
    /// Public clients authenticate with PKCE instead of a secret.
    pub fn is_public(&self) -> bool {
        self.token_endpoint_auth_method == "none"
    }

    pub fn supports_grant_type(&self, grant_type: &str) -> bool {
        self.grant_types.iter().any(|g| g == grant_type)
    }

    pub fn supports_response_type(&self, response_type: &str) -> bool {
        self.response_types.iter().any(|r| r == response_type)
    }

    pub fn allows_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Exact string match against the registered set; no normalization.
    pub fn has_redirect_uri(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|u| u == redirect_uri)
    }
}

/// Input for registering a client.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterClient {
    pub name: String,
    pub redirect_uris: Vec<String>,
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<String>,
    #[serde(default = "default_response_types")]
    pub response_types: Vec<String>,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_auth_method")]
    pub token_endpoint_auth_method: String,
}

fn default_grant_types() -> Vec<String> {
    vec!["authorization_code".to_string(), "refresh_token".to_string()]
}

fn default_response_types() -> Vec<String> {
    vec!["code".to_string()]
}

fn default_scopes() -> Vec<String> {
    ALLOWED_SCOPES.iter().map(|s| s.to_string()).collect()
}

fn default_auth_method() -> String {
    "client_secret_basic".to_string()
}

/// Partial update; unset fields are preserved.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateClient {
    pub name: Option<String>,
    pub redirect_uris: Option<Vec<String>>,
    pub grant_types: Option<Vec<String>>,
    pub response_types: Option<Vec<String>>,
    pub scopes: Option<Vec<String>>,
}

/// Registration result: the stored client plus its one-time plaintext
/// secret (absent for public clients).
#[derive(Debug, Clone)]
pub struct ClientWithSecret {
    pub client: OAuthClient,
    pub client_secret: Option<String>,
}

/// Typed operations over the `clients` table.
#[derive(Clone)]
pub struct ClientRegistry {
    gateway: SharedGateway,
}

impl ClientRegistry {
    pub fn new(gateway: SharedGateway) -> Self {
        Self { gateway }
    }

    /// Validate and store a new client; returns the plaintext secret
    /// exactly once.
    pub async fn register(&self, input: RegisterClient) -> OAuthResult<ClientWithSecret> {
        validate_registration(&input)?;

        let now = Utc::now();
        let (secret, secret_hash) = if input.token_endpoint_auth_method == "none" {
            (None, None)
        } else {
            let secret = generate_secret();
            let hash = super::hash_secret(&secret).map_err(OAuthError::Internal)?;
            (Some(secret), Some(hash))
        };

        let client = OAuthClient {
            id: Uuid::new_v4().to_string(),
            name: input.name,
            redirect_uris: input.redirect_uris,
            grant_types: input.grant_types,
            response_types: input.response_types,
            scopes: input.scopes,
            token_endpoint_auth_method: input.token_endpoint_auth_method,
            secret_hash,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        self.put(&client).await?;
        tracing::info!(client_id = %client.id, name = %client.name, "registered client");

        Ok(ClientWithSecret {
            client,
            client_secret: secret,
        })
    }

    /// Fetch a client; inactive clients are invisible here.
    pub async fn get(&self, id: &str) -> OAuthResult<Option<OAuthClient>> {
        Ok(self.get_any(id).await?.filter(|c| c.is_active))
    }

    /// Fetch a client regardless of active state (admin paths).
    pub async fn get_any(&self, id: &str) -> OAuthResult<Option<OAuthClient>> {
        let Some(row) = self.gateway.fetch(Table::Clients, id, "").await? else {
            return Ok(None);
        };
        let client = decode_client(row)?;
        Ok(Some(client))
    }

    /// Authenticate a confidential client by id and secret.
    ///
    /// Returns the client only when it is active, its auth method
    /// expects a secret, and the digest matches. Everything else is an
    /// indistinguishable `None`.
    pub async fn authenticate(&self, id: &str, secret: &str) -> OAuthResult<Option<OAuthClient>> {
        let Some(client) = self.get(id).await? else {
            return Ok(None);
        };
        if client.is_public() {
            return Ok(None);
        }
        let Some(hash) = client.secret_hash.as_deref() else {
            return Ok(None);
        };
        if super::verify_secret(hash, secret) {
            Ok(Some(client))
        } else {
            Ok(None)
        }
    }

    /// Apply a partial update; unset fields keep their value.
    pub async fn update(&self, id: &str, patch: UpdateClient) -> OAuthResult<Option<OAuthClient>> {
        let Some(mut client) = self.get_any(id).await? else {
            return Ok(None);
        };

        if let Some(name) = patch.name {
            client.name = name;
        }
        if let Some(redirect_uris) = patch.redirect_uris {
            client.redirect_uris = redirect_uris;
        }
        if let Some(grant_types) = patch.grant_types {
            client.grant_types = grant_types;
        }
        if let Some(response_types) = patch.response_types {
            client.response_types = response_types;
        }
        if let Some(scopes) = patch.scopes {
            client.scopes = scopes;
        }
        client.updated_at = Utc::now();

        validate_client_shape(&client)?;
        self.put(&client).await?;
        Ok(Some(client))
    }

    /// Soft-delete: auth and introspection reject from here on.
    pub async fn deactivate(&self, id: &str) -> OAuthResult<bool> {
        let Some(mut client) = self.get_any(id).await? else {
            return Ok(false);
        };
        client.is_active = false;
        client.updated_at = Utc::now();
        self.put(&client).await?;
        tracing::info!(client_id = %id, "deactivated client");
        Ok(true)
    }

    /// Store a fully formed client (startup seeding, tests).
    pub async fn put(&self, client: &OAuthClient) -> OAuthResult<()> {
        let row = serde_json::to_value(client).map_err(crate::storage::StorageError::from)?;
        self.gateway.upsert(Table::Clients, &client.id, "", &row).await?;
        Ok(())
    }
}

fn decode_client(row: Value) -> OAuthResult<OAuthClient> {
    serde_json::from_value(row)
        .map_err(|e| OAuthError::Internal(anyhow::anyhow!("corrupt client row: {e}")))
}

/// 32 random bytes, base64url.
fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    b64url_encode(&bytes)
}

fn validate_registration(input: &RegisterClient) -> OAuthResult<()> {
    validate_parts(
        &input.name,
        &input.redirect_uris,
        &input.grant_types,
        &input.response_types,
        &input.scopes,
    )?;
    if !ALLOWED_AUTH_METHODS.contains(&input.token_endpoint_auth_method.as_str()) {
        return Err(OAuthError::InvalidRequest(format!(
            "invalid token_endpoint_auth_method: {}",
            input.token_endpoint_auth_method
        )));
    }
    Ok(())
}

fn validate_client_shape(client: &OAuthClient) -> OAuthResult<()> {
    validate_parts(
        &client.name,
        &client.redirect_uris,
        &client.grant_types,
        &client.response_types,
        &client.scopes,
    )
}

fn validate_parts(
    name: &str,
    redirect_uris: &[String],
    grant_types: &[String],
    response_types: &[String],
    scopes: &[String],
) -> OAuthResult<()> {
    if name.trim().is_empty() {
        return Err(OAuthError::InvalidRequest("client name is required".into()));
    }
    if redirect_uris.is_empty() {
        return Err(OAuthError::InvalidRequest(
            "at least one redirect_uri is required".into(),
        ));
    }
    for uri in redirect_uris {
        if !is_valid_redirect_uri(uri) {
            return Err(OAuthError::InvalidRequest(format!(
                "invalid redirect_uri: {uri}"
            )));
        }
    }
    check_subset("grant_types", grant_types, ALLOWED_GRANT_TYPES)?;
    check_subset("response_types", response_types, ALLOWED_RESPONSE_TYPES)?;
    check_subset("scopes", scopes, ALLOWED_SCOPES)?;
    Ok(())
}

fn check_subset(field: &str, values: &[String], allowed: &[&str]) -> OAuthResult<()> {
    for value in values {
        if !allowed.contains(&value.as_str()) {
            return Err(OAuthError::InvalidRequest(format!(
                "invalid {field} value: {value}"
            )));
        }
    }
    Ok(())
}

/// Redirect URIs must parse as absolute http(s) URLs.
fn is_valid_redirect_uri(uri: &str) -> bool {
    match Url::parse(uri) {
        Ok(url) => url.scheme() == "http" || url.scheme() == "https",
        Err(_) => false,
    }
}
