//! Federated-login state store.
//!
//! Holds the CSRF `state` (and, for providers that support it, the PKCE
//! verifier) between the outbound redirect and the callback. Entries
//! are consume-once with a 10-minute lifetime.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::crypto::b64url_encode;
use crate::error::{OAuthError, OAuthResult};
use crate::storage::{SharedGateway, StorageError, Table};

/// State lifetime: 10 minutes.
const STATE_LIFETIME_SECS: i64 = 600;

/// One pending federated-login round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthState {
    pub state: String,
    pub return_to: String,
    #[serde(default)]
    pub code_verifier: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Typed operations over the `oauth_state` table.
#[derive(Clone)]
pub struct OAuthStateStore {
    gateway: SharedGateway,
}

impl OAuthStateStore {
    pub fn new(gateway: SharedGateway) -> Self {
        Self { gateway }
    }

    /// Persist a fresh state entry; returns the opaque state value.
    pub async fn store(
        &self,
        return_to: &str,
        code_verifier: Option<&str>,
    ) -> OAuthResult<String> {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let state = b64url_encode(&bytes);

        let record = OAuthState {
            state: state.clone(),
            return_to: return_to.to_string(),
            code_verifier: code_verifier.map(str::to_string),
            expires_at: Utc::now() + Duration::seconds(STATE_LIFETIME_SECS),
        };
        let row = serde_json::to_value(&record).map_err(StorageError::from)?;
        self.gateway
            .insert_ttl(
                Table::OauthState,
                &state,
                "",
                &row,
                std::time::Duration::from_secs(STATE_LIFETIME_SECS as u64),
            )
            .await?;
        Ok(state)
    }

    /// Consume a state entry; `None` when missing, expired, or already
    /// consumed.
    pub async fn consume(&self, state: &str) -> OAuthResult<Option<OAuthState>> {
        let Some(row) = self
            .gateway
            .consume_once(Table::OauthState, state, "")
            .await?
        else {
            return Ok(None);
        };
        let record: OAuthState = serde_json::from_value(row)
            .map_err(|e| OAuthError::Internal(anyhow::anyhow!("corrupt oauth state row: {e}")))?;
        if record.expires_at < Utc::now() {
            return Ok(None);
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use crate::storage::MemoryGateway;

    use super::*;

    fn store() -> OAuthStateStore {
        OAuthStateStore::new(Arc::new(MemoryGateway::new()))
    }

    #[tokio::test]
    async fn store_and_consume_once() {
        let store = store();
        let state = store.store("/after", Some("verifier-1")).await.unwrap();

        let record = store.consume(&state).await.unwrap().unwrap();
        assert_eq!(record.return_to, "/after");
        assert_eq!(record.code_verifier.as_deref(), Some("verifier-1"));

        assert!(store.consume(&state).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_state_is_none() {
        let store = store();
        assert!(store.consume("missing").await.unwrap().is_none());
    }
}
