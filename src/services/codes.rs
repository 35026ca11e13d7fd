//! Authorization-code store.
//!
//! Codes are opaque one-time tickets minted at `/authorize` and
//! redeemed at `/token`. Per RFC 6749 §4.1.2 they are short-lived and
//! single-use; the gateway's consume-once delete is what makes a replay
//! observable as a miss rather than a duplicate grant.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{OAuthError, OAuthResult};
use crate::storage::{SharedGateway, StorageError, Table};

/// Authorization-code lifetime: 10 minutes.
const AUTH_CODE_LIFETIME_SECS: i64 = 600;

/// Grant data bound to an authorization code at issuance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub user_id: String,
    #[serde(default)]
    pub code_challenge: Option<String>,
    #[serde(default)]
    pub code_challenge_method: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// When the end-user authenticated (Unix seconds).
    pub auth_time: i64,
}

/// Issuance parameters.
#[derive(Debug, Clone)]
pub struct IssueCode {
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub user_id: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
    pub auth_time: i64,
}

/// Typed operations over the `authorization_codes` table.
#[derive(Clone)]
pub struct AuthCodeStore {
    gateway: SharedGateway,
}

impl AuthCodeStore {
    pub fn new(gateway: SharedGateway) -> Self {
        Self { gateway }
    }

    /// Mint and persist a code; returns the opaque code value.
    pub async fn issue(&self, input: IssueCode) -> OAuthResult<String> {
        // 32 random bytes, hex-encoded (RFC 6749 §10.10 entropy).
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let code = hex::encode(bytes);

        let record = AuthorizationCode {
            code: code.clone(),
            client_id: input.client_id,
            redirect_uri: input.redirect_uri,
            scopes: input.scopes,
            user_id: input.user_id,
            code_challenge: input.code_challenge,
            code_challenge_method: input.code_challenge_method,
            nonce: input.nonce,
            expires_at: Utc::now() + Duration::seconds(AUTH_CODE_LIFETIME_SECS),
            auth_time: input.auth_time,
        };
        self.put(&record).await?;

        debug!(client_id = %record.client_id, "issued authorization code");
        Ok(code)
    }

    /// Redeem a code, enforcing the client and redirect-URI binding.
    ///
    /// The binding check runs before the consume so a mismatched
    /// presentation cannot burn the legitimate client's code, but the
    /// row is dropped anyway as defense in depth, since a mismatch
    /// means the code leaked. The stored `redirect_uri` is compared by
    /// exact string equality; no URL normalization.
    pub async fn consume(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
    ) -> OAuthResult<Option<AuthorizationCode>> {
        let Some(row) = self
            .gateway
            .fetch(Table::AuthorizationCodes, code, "")
            .await?
        else {
            return Ok(None);
        };
        let record = decode(row)?;

        if record.client_id != client_id || record.redirect_uri != redirect_uri {
            warn!(
                event = "authorization_code_binding_mismatch",
                client_id = %client_id,
                bound_client_id = %record.client_id,
                "authorization code presented with wrong binding"
            );
            self.gateway
                .remove(Table::AuthorizationCodes, code, "")
                .await?;
            return Ok(None);
        }

        if record.expires_at < Utc::now() {
            self.gateway
                .remove(Table::AuthorizationCodes, code, "")
                .await?;
            return Ok(None);
        }

        let Some(consumed) = self
            .gateway
            .consume_once(Table::AuthorizationCodes, code, "")
            .await?
        else {
            // A parallel consumer won the delete.
            debug!(client_id = %client_id, "authorization code already consumed");
            return Ok(None);
        };

        Ok(Some(decode(consumed)?))
    }

    /// Store a fully formed record (tests, seeding).
    pub async fn put(&self, record: &AuthorizationCode) -> OAuthResult<()> {
        let row = serde_json::to_value(record).map_err(StorageError::from)?;
        let ttl = (record.expires_at - Utc::now())
            .to_std()
            .unwrap_or_default();
        self.gateway
            .insert_ttl(Table::AuthorizationCodes, &record.code, "", &row, ttl)
            .await?;
        Ok(())
    }
}

fn decode(row: serde_json::Value) -> OAuthResult<AuthorizationCode> {
    serde_json::from_value(row)
        .map_err(|e| OAuthError::Internal(anyhow::anyhow!("corrupt authorization code row: {e}")))
}
