//! Accounts, contact methods, and federated identity links.
//!
//! An account is a principal (`id` doubles as the OIDC `sub`). Contact
//! methods hang off it in two tables: `contact_methods` keyed by
//! `(type, value)`, where the compare-and-set insert enforces global
//! uniqueness, and `contact_methods_by_account` keyed by account for
//! the userinfo projection. `provider_accounts` links an external
//! identity `(provider, provider_sub)` to a local account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OAuthError, OAuthResult};
use crate::storage::{SharedGateway, StorageError, Table};

/// Contact method types.
pub const CONTACT_EMAIL: &str = "email";
pub const CONTACT_PHONE: &str = "phone";

/// A principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub password_hash: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for provisioning an account.
#[derive(Debug, Clone, Default)]
pub struct NewAccount {
    pub password: Option<String>,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub picture: Option<String>,
}

/// One email address or phone number attached to an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactMethod {
    pub account_id: String,
    pub contact_id: String,
    /// `email` or `phone`.
    pub kind: String,
    pub value: String,
    pub is_primary: bool,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
}

impl ContactMethod {
    pub fn is_verified(&self) -> bool {
        self.verified_at.is_some()
    }
}

/// Link from an external identity to a local account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAccount {
    pub provider: String,
    pub provider_sub: String,
    pub account_id: String,
    #[serde(default)]
    pub contact_id: Option<String>,
}

/// Typed operations over account-related tables.
#[derive(Clone)]
pub struct AccountStore {
    gateway: SharedGateway,
}

impl AccountStore {
    pub fn new(gateway: SharedGateway) -> Self {
        Self { gateway }
    }

    /// Provision a new account.
    pub async fn create(&self, input: NewAccount) -> OAuthResult<Account> {
        let now = Utc::now();
        let password_hash = match input.password.as_deref() {
            Some(password) => Some(super::hash_secret(password).map_err(OAuthError::Internal)?),
            None => None,
        };
        let account = Account {
            id: Uuid::new_v4().to_string(),
            password_hash,
            is_active: true,
            name: input.name,
            given_name: input.given_name,
            family_name: input.family_name,
            picture: input.picture,
            created_at: now,
            updated_at: now,
        };
        self.put(&account).await?;
        tracing::info!(account_id = %account.id, "provisioned account");
        Ok(account)
    }

    pub async fn get(&self, id: &str) -> OAuthResult<Option<Account>> {
        let Some(row) = self.gateway.fetch(Table::Accounts, id, "").await? else {
            return Ok(None);
        };
        let account: Account = serde_json::from_value(row)
            .map_err(|e| OAuthError::Internal(anyhow::anyhow!("corrupt account row: {e}")))?;
        Ok(Some(account))
    }

    /// Store a fully formed account (seeding, tests, updates).
    pub async fn put(&self, account: &Account) -> OAuthResult<()> {
        let row = serde_json::to_value(account).map_err(StorageError::from)?;
        self.gateway
            .upsert(Table::Accounts, &account.id, "", &row)
            .await?;
        Ok(())
    }

    /// Attach a contact method.
    ///
    /// Returns `None` when `(kind, value)` is already claimed; the
    /// compare-and-set insert into the by-value table is the uniqueness
    /// authority. A second primary email on the same account is
    /// rejected outright.
    pub async fn add_contact(
        &self,
        account_id: &str,
        kind: &str,
        value: &str,
        is_primary: bool,
        verified_at: Option<DateTime<Utc>>,
    ) -> OAuthResult<Option<ContactMethod>> {
        if is_primary && kind == CONTACT_EMAIL {
            let existing = self.contacts(account_id).await?;
            if existing
                .iter()
                .any(|c| c.kind == CONTACT_EMAIL && c.is_primary)
            {
                return Err(OAuthError::InvalidRequest(
                    "account already has a primary email".into(),
                ));
            }
        }

        let contact = ContactMethod {
            account_id: account_id.to_string(),
            contact_id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            value: value.to_string(),
            is_primary,
            verified_at,
        };
        let row = serde_json::to_value(&contact).map_err(StorageError::from)?;

        let claimed = self
            .gateway
            .insert_if_absent(Table::ContactMethods, &contact_key(kind, value), "", &row)
            .await?;
        if !claimed {
            return Ok(None);
        }

        self.gateway
            .upsert(
                Table::ContactMethodsByAccount,
                account_id,
                &contact.contact_id,
                &row,
            )
            .await?;
        Ok(Some(contact))
    }

    /// All contact methods for an account.
    pub async fn contacts(&self, account_id: &str) -> OAuthResult<Vec<ContactMethod>> {
        let rows = self
            .gateway
            .scan(Table::ContactMethodsByAccount, account_id)
            .await?;
        let mut contacts = Vec::with_capacity(rows.len());
        for row in rows {
            contacts.push(serde_json::from_value(row).map_err(|e| {
                OAuthError::Internal(anyhow::anyhow!("corrupt contact row: {e}"))
            })?);
        }
        Ok(contacts)
    }

    /// The account's primary email, falling back to any email.
    pub async fn primary_email(&self, account_id: &str) -> OAuthResult<Option<ContactMethod>> {
        let contacts = self.contacts(account_id).await?;
        let primary = contacts
            .iter()
            .find(|c| c.kind == CONTACT_EMAIL && c.is_primary)
            .or_else(|| contacts.iter().find(|c| c.kind == CONTACT_EMAIL))
            .cloned();
        Ok(primary)
    }

    /// Resolve an account by email address.
    pub async fn find_by_email(&self, email: &str) -> OAuthResult<Option<Account>> {
        let Some(row) = self
            .gateway
            .fetch(Table::ContactMethods, &contact_key(CONTACT_EMAIL, email), "")
            .await?
        else {
            return Ok(None);
        };
        let contact: ContactMethod = serde_json::from_value(row)
            .map_err(|e| OAuthError::Internal(anyhow::anyhow!("corrupt contact row: {e}")))?;
        self.get(&contact.account_id).await
    }

    /// Check a password candidate against the stored digest.
    pub fn verify_password(&self, account: &Account, candidate: &str) -> bool {
        match account.password_hash.as_deref() {
            Some(hash) => super::verify_secret(hash, candidate),
            None => false,
        }
    }

    /// Record a federated identity link.
    pub async fn link_provider(&self, link: &ProviderAccount) -> OAuthResult<()> {
        let row = serde_json::to_value(link).map_err(StorageError::from)?;
        self.gateway
            .upsert(
                Table::ProviderAccounts,
                &provider_key(&link.provider, &link.provider_sub),
                "",
                &row,
            )
            .await?;
        Ok(())
    }

    /// Resolve an account from a federated identity.
    pub async fn find_by_provider(
        &self,
        provider: &str,
        provider_sub: &str,
    ) -> OAuthResult<Option<Account>> {
        let Some(row) = self
            .gateway
            .fetch(
                Table::ProviderAccounts,
                &provider_key(provider, provider_sub),
                "",
            )
            .await?
        else {
            return Ok(None);
        };
        let link: ProviderAccount = serde_json::from_value(row)
            .map_err(|e| OAuthError::Internal(anyhow::anyhow!("corrupt provider link: {e}")))?;
        self.get(&link.account_id).await
    }
}

fn contact_key(kind: &str, value: &str) -> String {
    format!("{kind}:{value}")
}

fn provider_key(provider: &str, provider_sub: &str) -> String {
    format!("{provider}:{provider_sub}")
}
