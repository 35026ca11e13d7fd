//! PostgreSQL gateway.
//!
//! Tables share one shape: `(partition, clustering, row JSONB,
//! expires_at)`. Consume-once maps to a conditional `DELETE ...
//! RETURNING row`, which the database applies atomically: a losing
//! racer sees zero rows, never a duplicate read.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::Row;

use super::{Gateway, StorageResult, Table};

/// Gateway over a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PostgresGateway {
    pool: PgPool,
}

impl PostgresGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn expiry(ttl: Duration) -> chrono::DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[async_trait]
impl Gateway for PostgresGateway {
    async fn fetch(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
    ) -> StorageResult<Option<Value>> {
        let sql = format!(
            "SELECT row FROM {} \
             WHERE partition = $1 AND clustering = $2 \
             AND (expires_at IS NULL OR expires_at > now())",
            table.as_str()
        );
        let row = sqlx::query(&sql)
            .bind(partition)
            .bind(clustering)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Value, _>("row")))
    }

    async fn scan(&self, table: Table, partition: &str) -> StorageResult<Vec<Value>> {
        let sql = format!(
            "SELECT row FROM {} \
             WHERE partition = $1 \
             AND (expires_at IS NULL OR expires_at > now()) \
             ORDER BY clustering",
            table.as_str()
        );
        let rows = sqlx::query(&sql)
            .bind(partition)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<Value, _>("row")).collect())
    }

    async fn upsert(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
        row: &Value,
    ) -> StorageResult<()> {
        let sql = format!(
            "INSERT INTO {} (partition, clustering, row, expires_at) \
             VALUES ($1, $2, $3, NULL) \
             ON CONFLICT (partition, clustering) \
             DO UPDATE SET row = EXCLUDED.row, expires_at = NULL",
            table.as_str()
        );
        sqlx::query(&sql)
            .bind(partition)
            .bind(clustering)
            .bind(row)
            .execute(&self.pool)
            .await?;
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
        let sql = format!(
            "INSERT INTO {} (partition, clustering, row, expires_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (partition, clustering) \
             DO UPDATE SET row = EXCLUDED.row, expires_at = EXCLUDED.expires_at",
            table.as_str()
        );
        sqlx::query(&sql)
            .bind(partition)
            .bind(clustering)
            .bind(row)
            .bind(Self::expiry(ttl))
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    async fn insert_if_absent(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
        row: &Value,
    ) -> StorageResult<bool> {
        // Expired-but-unswept rows must not block the insert; take them
        // over in place.
        let sql = format!(
            "INSERT INTO {} (partition, clustering, row, expires_at) \
             VALUES ($1, $2, $3, NULL) \
             ON CONFLICT (partition, clustering) DO UPDATE \
             SET row = EXCLUDED.row, expires_at = NULL \
             WHERE {}.expires_at IS NOT NULL AND {}.expires_at <= now()",
            table.as_str(),
            table.as_str(),
            table.as_str()
        );
        let result = sqlx::query(&sql)
            .bind(partition)
            .bind(clustering)
            .bind(row)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn consume_once(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
    ) -> StorageResult<Option<Value>> {
        let sql = format!(
            "DELETE FROM {} \
             WHERE partition = $1 AND clustering = $2 \
             AND (expires_at IS NULL OR expires_at > now()) \
             RETURNING row",
            table.as_str()
        );
        let row = sqlx::query(&sql)
            .bind(partition)
            .bind(clustering)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Value, _>("row")))
    }

    async fn remove(
        &self,
        table: Table,
        partition: &str,
        clustering: &str,
    ) -> StorageResult<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE partition = $1 AND clustering = $2",
            table.as_str()
        );
        let result = sqlx::query(&sql)
            .bind(partition)
            .bind(clustering)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_partition(&self, table: Table, partition: &str) -> StorageResult<u64> {
        let sql = format!("DELETE FROM {} WHERE partition = $1", table.as_str());
        let result = sqlx::query(&sql)
            .bind(partition)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn increment(
        &self,
        key: &str,
        window_bucket: i64,
        ttl: Duration,
    ) -> StorageResult<i64> {
        let row = sqlx::query(
            "INSERT INTO rate_limit_counters (key, window_bucket, count, expires_at) \
             VALUES ($1, $2, 1, $3) \
             ON CONFLICT (key, window_bucket) \
             DO UPDATE SET count = rate_limit_counters.count + 1 \
             RETURNING count",
        )
        .bind(key)
        .bind(window_bucket)
        .bind(Self::expiry(ttl))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("count"))
    }

    async fn sweep_expired(&self) -> StorageResult<u64> {
        let mut removed = 0u64;
        for table in Table::all() {
            let sql = format!(
                "DELETE FROM {} WHERE expires_at IS NOT NULL AND expires_at <= now()",
                table.as_str()
            );
            removed += sqlx::query(&sql).execute(&self.pool).await?.rows_affected();
        }
        removed += sqlx::query("DELETE FROM rate_limit_counters WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    async fn healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
