use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use thred::keyed_store::Meta;
use thred::{KeyedStore, LockNode, StoreError};
use tracing::debug;

use crate::store_error;

/// PostgreSQL keyed store. Also usable as a lock replica.
#[derive(Clone)]
pub struct PgKeyedStore {
    pool: PgPool,
}

impl PgKeyedStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Delete lock rows whose ttl has passed. Expired rows never block a
    /// claim, so this only keeps the table small.
    pub async fn purge_expired_locks(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM thred_locks WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected())
    }
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl KeyedStore for PgKeyedStore {
    async fn save(&self, kind: &str, id: &str, value: Value, meta: Option<Meta>) -> Result<(), StoreError> {
        let meta = serde_json::to_value(meta.unwrap_or_default())?;
        sqlx::query(
            r#"
            INSERT INTO thred_objects (kind, id, value, meta)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (kind, id) DO UPDATE
            SET value = EXCLUDED.value,
                meta = thred_objects.meta || EXCLUDED.meta,
                updated_at = NOW()
            "#,
        )
        .bind(kind)
        .bind(id)
        .bind(value)
        .bind(meta)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn retrieve(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT value FROM thred_objects WHERE kind = $1 AND id = $2")
            .bind(kind)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn retrieve_all(&self, kind: &str, ids: &[String]) -> Result<Vec<Value>, StoreError> {
        let rows = sqlx::query("SELECT id, value FROM thred_objects WHERE kind = $1 AND id = ANY($2)")
            .bind(kind)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        let mut by_id: HashMap<String, Value> = rows
            .into_iter()
            .map(|r| (r.get("id"), r.get("value")))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM thred_objects WHERE kind = $1 AND id = $2")
            .bind(kind)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM thred_objects WHERE kind = $1 AND id = $2) AS found")
            .bind(kind)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(row.get("found"))
    }

    async fn type_ids(&self, kind: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT id FROM thred_objects WHERE kind = $1 ORDER BY id")
            .bind(kind)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    async fn set_meta_value(&self, kind: &str, id: &str, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE thred_objects
            SET meta = meta || jsonb_build_object($3::text, $4::text),
                updated_at = NOW()
            WHERE kind = $1 AND id = $2
            "#,
        )
        .bind(kind)
        .bind(id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn get_meta_value(&self, kind: &str, id: &str, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT meta ->> $3 AS value FROM thred_objects WHERE kind = $1 AND id = $2")
            .bind(kind)
            .bind(id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>("value")))
    }

    async fn add_to_set(&self, kind: &str, id: &str, members: &[String]) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO thred_sets (kind, id, member)
            SELECT $1, $2, member FROM UNNEST($3::text[]) AS member
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(kind)
        .bind(id)
        .bind(members)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(result.rows_affected())
    }

    async fn remove_from_set(&self, kind: &str, id: &str, members: &[String]) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM thred_sets WHERE kind = $1 AND id = $2 AND member = ANY($3)")
            .bind(kind)
            .bind(id)
            .bind(members)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected())
    }

    async fn retrieve_set(&self, kind: &str, id: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT member FROM thred_sets WHERE kind = $1 AND id = $2 ORDER BY member")
            .bind(kind)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(rows.into_iter().map(|r| r.get("member")).collect())
    }

    async fn set_count(&self, kind: &str, id: &str) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS members FROM thred_sets WHERE kind = $1 AND id = $2")
            .bind(kind)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(row.get::<i64, _>("members").max(0) as u64)
    }

    async fn set_ids(&self, kind: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT id FROM thred_sets WHERE kind = $1 ORDER BY id")
            .bind(kind)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait]
impl LockNode for PgKeyedStore {
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO thred_locks (lock_key, token, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3::double precision / 1000.0))
            ON CONFLICT (lock_key) DO UPDATE
            SET token = EXCLUDED.token,
                expires_at = EXCLUDED.expires_at
            WHERE thred_locks.expires_at <= NOW()
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(ttl_ms(ttl))
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM thred_locks WHERE lock_key = $1 AND token = $2")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        if result.rows_affected() == 0 {
            debug!(key, "lock already gone or taken over");
        }
        Ok(result.rows_affected() > 0)
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE thred_locks
            SET expires_at = NOW() + make_interval(secs => $3::double precision / 1000.0)
            WHERE lock_key = $1 AND token = $2 AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(ttl_ms(ttl))
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(result.rows_affected() == 1)
    }
}
