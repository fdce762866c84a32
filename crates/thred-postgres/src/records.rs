use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use thred::{RecordStore, StoreError};

use crate::store_error;

/// Durable record store on JSONB documents.
///
/// Matching uses JSONB containment (`body @> matcher`): equal to the
/// in-memory store for scalar matcher fields, looser for nested objects.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn write(&self, kind: &str, matcher: &Value, values: Value, merge: bool) -> Result<(), StoreError> {
        let update = if merge {
            "UPDATE thred_records SET body = body || $3 WHERE kind = $1 AND body @> $2"
        } else {
            "UPDATE thred_records SET body = $3 WHERE kind = $1 AND body @> $2"
        };

        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let updated = sqlx::query(update)
            .bind(kind)
            .bind(matcher_or_all(matcher))
            .bind(&values)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?
            .rows_affected();
        if updated == 0 {
            sqlx::query("INSERT INTO thred_records (kind, body) VALUES ($1, $2)")
                .bind(kind)
                .bind(&values)
                .execute(&mut *tx)
                .await
                .map_err(store_error)?;
        }
        tx.commit().await.map_err(store_error)?;
        Ok(())
    }
}

/// A null matcher matches everything, as `{}` does.
fn matcher_or_all(matcher: &Value) -> Value {
    if matcher.is_null() {
        json!({})
    } else {
        matcher.clone()
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get(&self, kind: &str, matcher: &Value) -> Result<Vec<Value>, StoreError> {
        let rows = sqlx::query("SELECT body FROM thred_records WHERE kind = $1 AND body @> $2 ORDER BY seq")
            .bind(kind)
            .bind(matcher_or_all(matcher))
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(rows.into_iter().map(|r| r.get("body")).collect())
    }

    async fn put(&self, kind: &str, values: Value) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO thred_records (kind, body) VALUES ($1, $2)")
            .bind(kind)
            .bind(values)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn upsert(&self, kind: &str, matcher: &Value, values: Value) -> Result<(), StoreError> {
        self.write(kind, matcher, values, true).await
    }

    async fn replace(&self, kind: &str, matcher: &Value, values: Value) -> Result<(), StoreError> {
        self.write(kind, matcher, values, false).await
    }

    async fn count(&self, kind: &str, matcher: &Value) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS matched FROM thred_records WHERE kind = $1 AND body @> $2")
            .bind(kind)
            .bind(matcher_or_all(matcher))
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(row.get::<i64, _>("matched").max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_matcher_matches_everything() {
        assert_eq!(matcher_or_all(&Value::Null), json!({}));
        assert_eq!(matcher_or_all(&json!({ "id": "t1" })), json!({ "id": "t1" }));
    }
}
