//! In-memory gateway.
//!
//! Backs tests and local development. Mutations take the write lock for
//! their whole read-check-delete sequence, which gives the same
//! single-winner consume guarantee the durable store provides via
//! conditional deletes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use super::{Gateway, StorageResult, Table};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RowKey {
    table: Table,
    partition: String,
    clustering: String,
}

impl RowKey {
    fn new(table: Table, partition: &str, clustering: &str) -> Self {
        Self {
            table,
            partition: partition.to_string(),
            clustering: clustering.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredRow {
    row: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredRow {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Clone)]
struct CounterRow {
    count: i64,
    expires_at: DateTime<Utc>,
}

/// Process-memory store with the gateway's exact semantics.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    rows: RwLock<HashMap<RowKey, StoredRow>>,
    counters: RwLock<HashMap<(String, i64), CounterRow>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn fetch(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
    ) -> StorageResult<Option<Value>> {
        let now = Utc::now();
        let rows = self.rows.read();
        Ok(rows
            .get(&RowKey::new(table, partition, clustering))
            .filter(|r| r.is_live(now))
            .map(|r| r.row.clone()))
    }

    async fn scan(&self, table: Table, partition: &str) -> StorageResult<Vec<Value>> {
        let now = Utc::now();
        let rows = self.rows.read();
        let mut matched: Vec<(&String, &StoredRow)> = rows
            .iter()
            .filter(|(k, r)| k.table == table && k.partition == partition && r.is_live(now))
            .map(|(k, r)| (&k.clustering, r))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(b.0));
        Ok(matched.into_iter().map(|(_, r)| r.row.clone()).collect())
    }

    async fn upsert(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
        row: &Value,
    ) -> StorageResult<()> {
        self.rows.write().insert(
            RowKey::new(table, partition, clustering),
            StoredRow {
                row: row.clone(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn insert_ttl(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
        row: &Value,
        ttl: Duration,
    ) -> StorageResult<bool> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        self.rows.write().insert(
            RowKey::new(table, partition, clustering),
            StoredRow {
                row: row.clone(),
                expires_at: Some(expires_at),
            },
        );
        Ok(true)
    }

    async fn insert_if_absent(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
        row: &Value,
    ) -> StorageResult<bool> {
        let now = Utc::now();
        let mut rows = self.rows.write();
        let key = RowKey::new(table, partition, clustering);
        if rows.get(&key).is_some_and(|r| r.is_live(now)) {
            return Ok(false);
        }
        rows.insert(
            key,
            StoredRow {
                row: row.clone(),
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn consume_once(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
    ) -> StorageResult<Option<Value>> {
        let now = Utc::now();
        let mut rows = self.rows.write();
        let key = RowKey::new(table, partition, clustering);
        match rows.remove(&key) {
            Some(stored) if stored.is_live(now) => Ok(Some(stored.row)),
            // An expired row is gone either way; report not-applied.
            Some(_) | None => Ok(None),
        }
    }

    async fn remove(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
    ) -> StorageResult<bool> {
        let now = Utc::now();
        let mut rows = self.rows.write();
        match rows.remove(&RowKey::new(table, partition, clustering)) {
            Some(stored) => Ok(stored.is_live(now)),
            None => Ok(false),
        }
    }

    async fn remove_partition(&self, table: Table, partition: &str) -> StorageResult<u64> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|k, _| !(k.table == table && k.partition == partition));
        Ok((before - rows.len()) as u64)
    }

    async fn increment(
        &self,
        key: &str,
        window_bucket: i64,
        ttl: Duration,
    ) -> StorageResult<i64> {
        let now = Utc::now();
        let mut counters = self.counters.write();
        let entry = counters
            .entry((key.to_string(), window_bucket))
            .and_modify(|c| c.count += 1)
            .or_insert_with(|| CounterRow {
                count: 1,
                expires_at: now
                    + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            });
        Ok(entry.count)
    }

    async fn sweep_expired(&self) -> StorageResult<u64> {
        let now = Utc::now();
        let mut removed = 0u64;
        {
            let mut rows = self.rows.write();
            let before = rows.len();
            rows.retain(|_, r| r.is_live(now));
            removed += (before - rows.len()) as u64;
        }
        {
            let mut counters = self.counters.write();
            let before = counters.len();
            counters.retain(|_, c| c.expires_at > now);
            removed += (before - counters.len()) as u64;
        }
        Ok(removed)
    }

    async fn healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn fetch_upsert_roundtrip() {
        let gw = MemoryGateway::new();
        let row = json!({"a": 1});
        gw.upsert(Table::Clients, "p", "", &row).await.unwrap();
        assert_eq!(gw.fetch(Table::Clients, "p", "").await.unwrap(), Some(row));
        assert_eq!(gw.fetch(Table::Clients, "q", "").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_rows_expire() {
        let gw = MemoryGateway::new();
        let row = json!({"a": 1});
        gw.insert_ttl(Table::OauthState, "s", "", &row, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(gw.fetch(Table::OauthState, "s", "").await.unwrap(), None);
        assert_eq!(gw.consume_once(Table::OauthState, "s", "").await.unwrap(), None);
    }

    #[tokio::test]
    async fn insert_if_absent_is_cas() {
        let gw = MemoryGateway::new();
        let row = json!({"a": 1});
        assert!(gw
            .insert_if_absent(Table::ContactMethods, "email:a@b", "", &row)
            .await
            .unwrap());
        assert!(!gw
            .insert_if_absent(Table::ContactMethods, "email:a@b", "", &row)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn consume_once_single_winner() {
        let gw = Arc::new(MemoryGateway::new());
        gw.upsert(Table::AuthorizationCodes, "code1", "", &json!({"v": 1}))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gw = Arc::clone(&gw);
            handles.push(tokio::spawn(async move {
                gw.consume_once(Table::AuthorizationCodes, "code1", "")
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn partition_scan_and_removal() {
        let gw = MemoryGateway::new();
        gw.upsert(Table::RefreshTokensByUser, "u1:c1", "t1", &json!({"t": "t1"}))
            .await
            .unwrap();
        gw.upsert(Table::RefreshTokensByUser, "u1:c1", "t2", &json!({"t": "t2"}))
            .await
            .unwrap();
        gw.upsert(Table::RefreshTokensByUser, "u2:c1", "t3", &json!({"t": "t3"}))
            .await
            .unwrap();

        let rows = gw.scan(Table::RefreshTokensByUser, "u1:c1").await.unwrap();
        assert_eq!(rows.len(), 2);

        assert_eq!(
            gw.remove_partition(Table::RefreshTokensByUser, "u1:c1")
                .await
                .unwrap(),
            2
        );
        assert!(gw
            .scan(Table::RefreshTokensByUser, "u1:c1")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            gw.scan(Table::RefreshTokensByUser, "u2:c1").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn counters_are_per_window() {
        let gw = MemoryGateway::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(gw.increment("login:default:1.2.3.4", 1, ttl).await.unwrap(), 1);
        assert_eq!(gw.increment("login:default:1.2.3.4", 1, ttl).await.unwrap(), 2);
        assert_eq!(gw.increment("login:default:1.2.3.4", 2, ttl).await.unwrap(), 1);
    }
}
