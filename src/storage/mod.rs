//! Typed gateway over the wide-column backing store.
//!
//! Every durable row lives in a (partition, clustering) keyed table with
//! a JSONB payload and an optional absolute expiry. The gateway exposes
//! the small operation set the protocol engine needs; higher layers
//! never see the transport. `consume_once` is the single correctness
//! primitive for one-time tokens: it atomically deletes a live row and
//! returns it, so at most one caller ever observes a given row.

mod memory;
mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryGateway;
pub use postgres::PostgresGateway;

/// Storage tables, mirroring the persisted layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Clients,
    Accounts,
    ContactMethods,
    ContactMethodsByAccount,
    ProviderAccounts,
    AuthorizationCodes,
    RefreshTokens,
    RefreshTokensByUser,
    OauthState,
    MagicLinkTokens,
}

impl Table {
    /// The SQL table name.
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Clients => "clients",
            Table::Accounts => "accounts",
            Table::ContactMethods => "contact_methods",
            Table::ContactMethodsByAccount => "contact_methods_by_account",
            Table::ProviderAccounts => "provider_accounts",
            Table::AuthorizationCodes => "authorization_codes",
            Table::RefreshTokens => "refresh_tokens",
            Table::RefreshTokensByUser => "refresh_tokens_by_user",
            Table::OauthState => "oauth_state",
            Table::MagicLinkTokens => "magic_link_tokens",
        }
    }

    /// All tables, for sweeps.
    pub fn all() -> &'static [Table] {
        &[
            Table::Clients,
            Table::Accounts,
            Table::ContactMethods,
            Table::ContactMethodsByAccount,
            Table::ProviderAccounts,
            Table::AuthorizationCodes,
            Table::RefreshTokens,
            Table::RefreshTokensByUser,
            Table::OauthState,
            Table::MagicLinkTokens,
        ]
    }
}

/// Storage failures. Anything that is not a precondition miss is a
/// transport error; callers translate those to `server_error`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage transport failure")]
    Transport(#[from] sqlx::Error),

    #[error("row encoding failure")]
    Encoding(#[from] serde_json::Error),
}

/// Result type for gateway operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// The typed store gateway.
///
/// Precondition misses (absent rows, lost consume races, conflicting
/// inserts) are expressed in the return value as `None` / `false`, and
/// never as errors. An `Err` always means the transport failed.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Read a single live row.
    async fn fetch(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
    ) -> StorageResult<Option<Value>>;

    /// Read all live rows of a partition, ordered by clustering key.
    async fn scan(&self, table: Table, partition: &str) -> StorageResult<Vec<Value>>;

    /// Insert or replace a row.
    async fn upsert(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
        row: &Value,
    ) -> StorageResult<()>;

    /// Insert or replace a row with an absolute expiry `ttl` from now.
    async fn insert_ttl(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
        row: &Value,
        ttl: Duration,
    ) -> StorageResult<bool>;

    /// Compare-and-set insert: returns `false` without writing when a
    /// live row already exists under the key.
    async fn insert_if_absent(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
        row: &Value,
    ) -> StorageResult<bool>;

    /// Atomically delete a live row and return it.
    ///
    /// `None` means the row was absent, expired, or already taken by a
    /// concurrent consumer; exactly one of any set of racing callers
    /// gets `Some`.
    async fn consume_once(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
    ) -> StorageResult<Option<Value>>;

    /// Delete a row; returns whether a live row was removed.
    async fn remove(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
    ) -> StorageResult<bool>;

    /// Delete every row of a partition; returns the number removed.
    async fn remove_partition(&self, table: Table, partition: &str) -> StorageResult<u64>;

    /// Increment and return the counter for `(key, window_bucket)`.
    ///
    /// The counter row expires `ttl` after its first increment.
    async fn increment(
        &self,
        key: &str,
        window_bucket: i64,
        ttl: Duration,
    ) -> StorageResult<i64>;

    /// Remove rows whose expiry has passed; returns the number removed.
    async fn sweep_expired(&self) -> StorageResult<u64>;

    /// Transport liveness probe.
    async fn healthy(&self) -> bool;
}

/// Shared handle to the configured gateway implementation.
pub type SharedGateway = Arc<dyn Gateway>;
