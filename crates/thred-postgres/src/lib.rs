//! PostgreSQL backends for the thred engine.
//!
//! - [`PgKeyedStore`]: the keyed store (objects, metadata, sets) and a lock
//!   replica in one pool
//! - [`PgRecordStore`]: the durable record store (patterns, archived threds,
//!   audit records) over JSONB documents
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE thred_objects (
//!     kind TEXT NOT NULL,
//!     id TEXT NOT NULL,
//!     value JSONB NOT NULL,
//!     meta JSONB NOT NULL DEFAULT '{}'::jsonb,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     PRIMARY KEY (kind, id)
//! );
//!
//! CREATE TABLE thred_sets (
//!     kind TEXT NOT NULL,
//!     id TEXT NOT NULL,
//!     member TEXT NOT NULL,
//!     PRIMARY KEY (kind, id, member)
//! );
//!
//! CREATE TABLE thred_locks (
//!     lock_key TEXT PRIMARY KEY,
//!     token TEXT NOT NULL,
//!     expires_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE TABLE thred_records (
//!     seq BIGSERIAL PRIMARY KEY,
//!     kind TEXT NOT NULL,
//!     body JSONB NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_thred_records_body ON thred_records USING GIN (body jsonb_path_ops);
//! ```
//!
//! The type index is the primary key of `thred_objects` and the set index is
//! the primary key of `thred_sets`; a set with no rows does not exist.
//! Lock expiry is evaluated against the database clock.
//!
//! # Usage
//!
//! ```rust,ignore
//! use thred::{EngineBuilder, LockConfig};
//! use thred_postgres::{ensure_schema, storage, PgRecordStore};
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/thred").await?;
//! ensure_schema(&pool).await?;
//!
//! let engine = EngineBuilder::new(
//!     Arc::new(storage(pool.clone(), LockConfig::default())),
//!     Arc::new(PgRecordStore::new(pool)),
//! )
//! .build();
//! ```

mod keyed;
mod records;

use std::sync::Arc;

use sqlx::PgPool;
use thred::{LockConfig, LockNode, StoreError, Storage};

pub use keyed::PgKeyedStore;
pub use records::PgRecordStore;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS thred_objects (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        value JSONB NOT NULL,
        meta JSONB NOT NULL DEFAULT '{}'::jsonb,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (kind, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS thred_sets (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        member TEXT NOT NULL,
        PRIMARY KEY (kind, id, member)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS thred_locks (
        lock_key TEXT PRIMARY KEY,
        token TEXT NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS thred_records (
        seq BIGSERIAL PRIMARY KEY,
        kind TEXT NOT NULL,
        body JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_thred_records_kind ON thred_records (kind)",
    "CREATE INDEX IF NOT EXISTS idx_thred_records_body ON thred_records USING GIN (body jsonb_path_ops)",
];

/// Create the tables and indexes if missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(store_error)?;
    }
    Ok(())
}

/// Keyed store and single lock replica on one pool.
pub fn storage(pool: PgPool, config: LockConfig) -> Storage {
    let store = Arc::new(PgKeyedStore::new(pool));
    let node: Arc<dyn LockNode> = store.clone();
    Storage::new(store, vec![node], config)
}

/// Keyed store on `pool`, with one lock replica per entry of `lock_pools`.
/// Use independent databases for the replicas.
pub fn storage_with_replicas(pool: PgPool, lock_pools: Vec<PgPool>, config: LockConfig) -> Storage {
    let nodes = lock_pools
        .into_iter()
        .map(|p| {
            let node: Arc<dyn LockNode> = Arc::new(PgKeyedStore::new(p));
            node
        })
        .collect();
    Storage::new(Arc::new(PgKeyedStore::new(pool)), nodes, config)
}

pub(crate) fn store_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolClosed => StoreError::Closed,
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            StoreError::Unavailable(err.to_string())
        }
        other => StoreError::backend(other.to_string()),
    }
}
