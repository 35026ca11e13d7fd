//! Refresh-token store with rotation.
//!
//! Refresh tokens are long-lived one-time tickets. A successful use
//! deletes the record atomically and the caller mints a replacement;
//! a consume-once miss after a successful read is a replay and gets a
//! security log entry. The `(user_id, client_id)` secondary index
//! exists for mass revocation only.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto::b64url_encode;
use crate::error::{OAuthError, OAuthResult};
use crate::storage::{SharedGateway, StorageError, Table};

/// Refresh-token lifetime: 30 days.
const REFRESH_TOKEN_LIFETIME_SECS: i64 = 30 * 86_400;

/// A stored refresh token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub token: String,
    pub client_id: String,
    pub user_id: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// End-user authentication time carried from the originating grant.
    /// Absent on legacy records; readers fall back to `created_at`.
    #[serde(default)]
    pub auth_time: Option<i64>,
}

/// Issuance parameters.
#[derive(Debug, Clone)]
pub struct IssueRefreshToken {
    pub client_id: String,
    pub user_id: String,
    pub scopes: Vec<String>,
    pub auth_time: Option<i64>,
}

/// Secondary-index row: partition `(user_id, client_id)`, one row per
/// outstanding token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    token: String,
}

/// Typed operations over `refresh_tokens` and `refresh_tokens_by_user`.
#[derive(Clone)]
pub struct RefreshTokenStore {
    gateway: SharedGateway,
}

impl RefreshTokenStore {
    pub fn new(gateway: SharedGateway) -> Self {
        Self { gateway }
    }

    /// Mint and persist a token in both tables.
    pub async fn issue(&self, input: IssueRefreshToken) -> OAuthResult<RefreshToken> {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let token = b64url_encode(&bytes);

        let now = Utc::now();
        let record = RefreshToken {
            token: token.clone(),
            client_id: input.client_id,
            user_id: input.user_id,
            scopes: input.scopes,
            expires_at: now + Duration::seconds(REFRESH_TOKEN_LIFETIME_SECS),
            created_at: now,
            auth_time: input.auth_time,
        };

        let ttl = std::time::Duration::from_secs(REFRESH_TOKEN_LIFETIME_SECS as u64);
        let row = serde_json::to_value(&record).map_err(StorageError::from)?;
        self.gateway
            .insert_ttl(Table::RefreshTokens, &token, "", &row, ttl)
            .await?;

        let index_row =
            serde_json::to_value(IndexEntry {
                token: token.clone(),
            })
            .map_err(StorageError::from)?;
        self.gateway
            .insert_ttl(
                Table::RefreshTokensByUser,
                &index_partition(&record.user_id, &record.client_id),
                &token,
                &index_row,
                ttl,
            )
            .await?;

        debug!(client_id = %record.client_id, user_id = %record.user_id, "issued refresh token");
        Ok(record)
    }

    /// Redeem a token for the given client.
    ///
    /// The client-binding check runs before the consume, so a token
    /// presented by the wrong client is refused without burning it for
    /// the legitimate holder, but the attempt is logged as a security
    /// event. A consume-once miss after a successful read means someone
    /// else just spent this token: a replay.
    pub async fn consume(
        &self,
        token: &str,
        client_id: &str,
    ) -> OAuthResult<Option<RefreshToken>> {
        let Some(row) = self.gateway.fetch(Table::RefreshTokens, token, "").await? else {
            return Ok(None);
        };
        let record = decode(row)?;

        if record.client_id != client_id {
            warn!(
                event = "refresh_token_client_mismatch",
                client_id = %client_id,
                bound_client_id = %record.client_id,
                user_id = %record.user_id,
                "refresh token presented by wrong client"
            );
            return Ok(None);
        }

        if record.expires_at < Utc::now() {
            self.remove_both(&record).await?;
            return Ok(None);
        }

        let Some(consumed) = self
            .gateway
            .consume_once(Table::RefreshTokens, token, "")
            .await?
        else {
            warn!(
                event = "refresh_token_replay",
                client_id = %client_id,
                user_id = %record.user_id,
                "refresh token replayed after consumption"
            );
            return Ok(None);
        };
        let record = decode(consumed)?;

        self.gateway
            .remove(
                Table::RefreshTokensByUser,
                &index_partition(&record.user_id, &record.client_id),
                token,
            )
            .await?;

        Ok(Some(record))
    }

    /// Revoke a single token; same client binding as `consume`.
    ///
    /// Returns whether a live token was removed.
    pub async fn revoke(&self, token: &str, client_id: &str) -> OAuthResult<bool> {
        let Some(row) = self.gateway.fetch(Table::RefreshTokens, token, "").await? else {
            return Ok(false);
        };
        let record = decode(row)?;

        if record.client_id != client_id {
            warn!(
                event = "refresh_token_client_mismatch",
                client_id = %client_id,
                bound_client_id = %record.client_id,
                user_id = %record.user_id,
                "revocation attempted by wrong client"
            );
            return Ok(false);
        }

        let removed = self
            .gateway
            .consume_once(Table::RefreshTokens, token, "")
            .await?
            .is_some();
        if removed {
            self.gateway
                .remove(
                    Table::RefreshTokensByUser,
                    &index_partition(&record.user_id, &record.client_id),
                    token,
                )
                .await?;
            info!(
                event = "token_revoked",
                client_id = %client_id,
                user_id = %record.user_id,
                "refresh token revoked"
            );
        }
        Ok(removed)
    }

    /// Revoke every outstanding token for `(user_id, client_id)`.
    ///
    /// Walks the secondary index, deletes each primary row, then clears
    /// the index partition. Returns the number of primaries removed.
    pub async fn revoke_by_user(&self, client_id: &str, user_id: &str) -> OAuthResult<u64> {
        let partition = index_partition(user_id, client_id);
        let entries = self.gateway.scan(Table::RefreshTokensByUser, &partition).await?;

        let mut removed = 0u64;
        for row in entries {
            let entry: IndexEntry = serde_json::from_value(row).map_err(|e| {
                OAuthError::Internal(anyhow::anyhow!("corrupt refresh index row: {e}"))
            })?;
            if self
                .gateway
                .consume_once(Table::RefreshTokens, &entry.token, "")
                .await?
                .is_some()
            {
                removed += 1;
            }
        }
        self.gateway
            .remove_partition(Table::RefreshTokensByUser, &partition)
            .await?;

        if removed > 0 {
            info!(
                event = "token_revoked",
                client_id = %client_id,
                user_id = %user_id,
                count = removed,
                "revoked all refresh tokens for user"
            );
        }
        Ok(removed)
    }

    /// Read a token without consuming it (introspection).
    pub async fn lookup(&self, token: &str) -> OAuthResult<Option<RefreshToken>> {
        let Some(row) = self.gateway.fetch(Table::RefreshTokens, token, "").await? else {
            return Ok(None);
        };
        Ok(Some(decode(row)?))
    }

    async fn remove_both(&self, record: &RefreshToken) -> OAuthResult<()> {
        self.gateway
            .remove(Table::RefreshTokens, &record.token, "")
            .await?;
        self.gateway
            .remove(
                Table::RefreshTokensByUser,
                &index_partition(&record.user_id, &record.client_id),
                &record.token,
            )
            .await?;
        Ok(())
    }
}

fn index_partition(user_id: &str, client_id: &str) -> String {
    format!("{user_id}:{client_id}")
}

fn decode(row: serde_json::Value) -> OAuthResult<RefreshToken> {
    serde_json::from_value(row)
        .map_err(|e| OAuthError::Internal(anyhow::anyhow!("corrupt refresh token row: {e}")))
}
