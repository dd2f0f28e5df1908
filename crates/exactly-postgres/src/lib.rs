//! PostgreSQL implementation of the Exactly document store.
//!
//! This crate provides a production-ready PostgreSQL implementation of the
//! `DocumentStore` trait from `exactly-core`, so receipts and business
//! documents commit in the same database transaction.
//!
//! # Features
//!
//! - `SERIALIZABLE` transactions; serialization failures surface as
//!   [`StoreError::Conflict`] and are retried by the executor
//! - Buffered writes applied in order at commit, merges via JSONB `||`
//! - Server timestamps taken from the transaction's `NOW()`
//! - Operator views of receipt health and stuck attempts
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE documents (
//!     path TEXT PRIMARY KEY,
//!     data JSONB NOT NULL,
//!     version BIGINT NOT NULL DEFAULT 1,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_documents_status ON documents ((data->>'status'))
//!     WHERE data ? 'attemptId';
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use exactly_core::Executor;
//! use exactly_postgres::PgDocumentStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let store = PgDocumentStore::new(pool);
//! store.migrate().await?;
//!
//! let executor = Executor::new(Arc::new(store));
//! ```

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exactly_core::store::{
    expect_object, resolve_server_timestamps, PendingWrite, WriteBuffer, WriteOp,
};
use exactly_core::{
    DocumentPath, DocumentStore, OperationReceipt, ReceiptLayout, StoreError, Transaction,
};
use serde_json::{Map, Value};
use sqlx::{PgConnection, PgPool, Postgres, Row};

const DEFAULT_TABLE: &str = "documents";

/// SQLSTATEs Postgres raises when a transaction lost a race.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

fn valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && name.len() <= 63
}

fn is_race(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
        ),
        _ => false,
    }
}

/// Map a driver error for an operation on `path`.
fn store_error(err: sqlx::Error, path: &str) -> StoreError {
    if is_race(&err) {
        tracing::debug!(%path, error = %err, "serialization failure");
        return StoreError::Conflict {
            path: path.to_string(),
        };
    }
    StoreError::Backend(err.to_string())
}

/// PostgreSQL document store.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    table: Arc<str>,
}

impl PgDocumentStore {
    /// Create a store over the `documents` table.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: Arc::from(DEFAULT_TABLE),
        }
    }

    /// Create a store over a custom table.
    ///
    /// The name is interpolated into SQL, so only lowercase identifiers
    /// (`[a-z_][a-z0-9_]*`) are accepted.
    pub fn with_table(pool: PgPool, table: &str) -> Result<Self, StoreError> {
        if !valid_table_name(table) {
            return Err(StoreError::Backend(format!(
                "invalid table name {table:?}"
            )));
        }
        Ok(Self {
            pool,
            table: Arc::from(table),
        })
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the table and its receipt index if they don't exist.
    pub async fn migrate(&self) -> Result<()> {
        let table = &self.table;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                path TEXT PRIMARY KEY,
                data JSONB NOT NULL,
                version BIGINT NOT NULL DEFAULT 1,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table} ((data->>'status'))
                WHERE data ? 'attemptId'
            "#
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

async fn now(conn: &mut PgConnection) -> Result<DateTime<Utc>, StoreError> {
    sqlx::query_scalar::<_, DateTime<Utc>>("SELECT NOW()")
        .fetch_one(conn)
        .await
        .map_err(|err| StoreError::Backend(err.to_string()))
}

fn resolved(fields: &Map<String, Value>, now: DateTime<Utc>) -> Value {
    let mut value = Value::Object(fields.clone());
    resolve_server_timestamps(&mut value, now);
    value
}

/// Apply one buffered write on `conn`.
async fn apply(
    conn: &mut PgConnection,
    table: &str,
    write: &PendingWrite,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let path = write.path.as_str();
    let fail = |err| store_error(err, path);

    match &write.op {
        WriteOp::Set { fields, merge } => {
            let data = if *merge {
                format!("{table}.data || EXCLUDED.data")
            } else {
                "EXCLUDED.data".to_string()
            };
            sqlx::query(&format!(
                r#"
                INSERT INTO {table} (path, data, version, updated_at)
                VALUES ($1, $2, 1, $3)
                ON CONFLICT (path) DO UPDATE
                SET data = {data},
                    version = {table}.version + 1,
                    updated_at = $3
                "#
            ))
            .bind(path)
            .bind(resolved(fields, now))
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(fail)?;
        }
        WriteOp::Update { fields } => {
            let result = sqlx::query(&format!(
                r#"
                UPDATE {table}
                SET data = data || $2,
                    version = version + 1,
                    updated_at = $3
                WHERE path = $1
                "#
            ))
            .bind(path)
            .bind(resolved(fields, now))
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(fail)?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound {
                    path: path.to_string(),
                });
            }
        }
        WriteOp::Create { fields } => {
            let result = sqlx::query(&format!(
                r#"
                INSERT INTO {table} (path, data, version, updated_at)
                VALUES ($1, $2, 1, $3)
                ON CONFLICT (path) DO NOTHING
                "#
            ))
            .bind(path)
            .bind(resolved(fields, now))
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(fail)?;
            if result.rows_affected() == 0 {
                return Err(StoreError::AlreadyExists {
                    path: path.to_string(),
                });
            }
        }
        WriteOp::Delete => {
            sqlx::query(&format!("DELETE FROM {table} WHERE path = $1"))
                .bind(path)
                .execute(&mut *conn)
                .await
                .map_err(fail)?;
        }
    }
    Ok(())
}

/// A `SERIALIZABLE` transaction with buffered writes.
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    table: Arc<str>,
    writes: WriteBuffer,
}

impl PgTransaction {
    fn buffer(&mut self, path: &DocumentPath, op: WriteOp) {
        self.writes.push(PendingWrite {
            path: path.clone(),
            op,
        });
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn get(&mut self, path: &DocumentPath) -> Result<Option<Value>, StoreError> {
        if !self.writes.is_empty() {
            return Err(StoreError::ReadAfterWrite {
                path: path.to_string(),
            });
        }
        let row = sqlx::query(&format!("SELECT data FROM {} WHERE path = $1", self.table))
            .bind(path.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|err| store_error(err, path.as_str()))?;
        match row {
            Some(row) => row
                .try_get::<Value, _>("data")
                .map(Some)
                .map_err(|err| StoreError::Backend(err.to_string())),
            None => Ok(None),
        }
    }

    fn set(&mut self, path: &DocumentPath, value: Value, merge: bool) -> Result<(), StoreError> {
        let fields = expect_object(path, value)?;
        self.buffer(path, WriteOp::Set { fields, merge });
        Ok(())
    }

    fn update(&mut self, path: &DocumentPath, fields: Value) -> Result<(), StoreError> {
        let fields = expect_object(path, fields)?;
        self.buffer(path, WriteOp::Update { fields });
        Ok(())
    }

    fn create(&mut self, path: &DocumentPath, value: Value) -> Result<(), StoreError> {
        let fields = expect_object(path, value)?;
        self.buffer(path, WriteOp::Create { fields });
        Ok(())
    }

    fn delete(&mut self, path: &DocumentPath) {
        self.buffer(path, WriteOp::Delete);
    }

    fn has_pending_writes(&self) -> bool {
        !self.writes.is_empty()
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    type Transaction = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(PgTransaction {
            tx,
            table: Arc::clone(&self.table),
            writes: WriteBuffer::new(),
        })
    }

    /// Apply the buffered writes, then commit.
    ///
    /// A failed write rolls the whole transaction back when `tx` drops.
    async fn commit(&self, tx: PgTransaction) -> Result<(), StoreError> {
        let PgTransaction {
            tx: mut inner,
            table,
            writes,
        } = tx;
        if !writes.is_empty() {
            let now = now(&mut *inner).await?;
            for write in &writes {
                apply(&mut *inner, &table, write, now).await?;
            }
        }
        let label = writes
            .first()
            .map_or_else(|| table.to_string(), |write| write.path.to_string());
        inner
            .commit()
            .await
            .map_err(|err| store_error(err, &label))
    }

    async fn rollback(&self, tx: PgTransaction) -> Result<(), StoreError> {
        tx.tx
            .rollback()
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    async fn get(&self, path: &DocumentPath) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query(&format!("SELECT data FROM {} WHERE path = $1", self.table))
            .bind(path.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| store_error(err, path.as_str()))?;
        match row {
            Some(row) => row
                .try_get::<Value, _>("data")
                .map(Some)
                .map_err(|err| StoreError::Backend(err.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, path: &DocumentPath, value: Value, merge: bool) -> Result<(), StoreError> {
        let fields = expect_object(path, value)?;
        let mut tx = self.begin().await?;
        tx.buffer(path, WriteOp::Set { fields, merge });
        self.commit(tx).await
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        now(&mut *conn).await
    }
}

/// Operator views over the receipt documents.
impl PgDocumentStore {
    /// Count receipts by status.
    pub async fn receipt_stats(&self, layout: &ReceiptLayout) -> Result<ReceiptStats> {
        let row = sqlx::query(&format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE data->>'status' = 'in_progress') as in_progress,
                COUNT(*) FILTER (WHERE data->>'status' = 'completed') as completed,
                COUNT(*) FILTER (WHERE data->>'status' = 'failed') as failed
            FROM {}
            WHERE path ~ $1
            "#,
            self.table
        ))
        .bind(receipt_pattern(layout))
        .fetch_one(&self.pool)
        .await?;

        Ok(ReceiptStats {
            in_progress: row.get("in_progress"),
            completed: row.get("completed"),
            failed: row.get("failed"),
        })
    }

    /// List `in_progress` receipts created before `older_than`.
    ///
    /// Read-only: an expired attempt is reclaimed by the next call for its
    /// key, not by this query.
    pub async fn stale_in_progress(
        &self,
        layout: &ReceiptLayout,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<StaleReceipt>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT path, data
            FROM {}
            WHERE path ~ $1
              AND data->>'status' = 'in_progress'
              AND (data->>'createdAt')::timestamptz < $2
            ORDER BY path
            "#,
            self.table
        ))
        .bind(receipt_pattern(layout))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<StaleReceipt> {
                let path: String = row.get("path");
                let data: Value = row.get("data");
                Ok(StaleReceipt {
                    path,
                    receipt: OperationReceipt::from_document(data)?,
                })
            })
            .collect()
    }
}

/// Anchored regex matching exactly the receipt paths of `layout`, and not
/// documents nested below a receipt.
fn receipt_pattern(layout: &ReceiptLayout) -> String {
    format!(
        "^{}/[^/]+/{}/[^/]+$",
        regex_literal(&layout.actor_collection),
        regex_literal(&layout.receipt_collection)
    )
}

fn regex_literal(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if r"\.^$*+?()[]{}|".contains(ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Receipt counts by status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptStats {
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
}

/// An `in_progress` receipt older than the requested cutoff.
#[derive(Debug, Clone)]
pub struct StaleReceipt {
    pub path: String,
    pub receipt: OperationReceipt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_plain_identifiers() {
        assert!(valid_table_name("documents"));
        assert!(valid_table_name("_exactly_test_01"));
        assert!(!valid_table_name("Documents"));
        assert!(!valid_table_name("docs; DROP TABLE x"));
        assert!(!valid_table_name("1docs"));
        assert!(!valid_table_name(""));
    }

    #[test]
    fn receipt_pattern_follows_layout() {
        assert_eq!(
            receipt_pattern(&ReceiptLayout::default()),
            "^players/[^/]+/receipts/[^/]+$"
        );
        assert_eq!(
            receipt_pattern(&ReceiptLayout::new("accounts", "ops")),
            "^accounts/[^/]+/ops/[^/]+$"
        );
    }

    #[test]
    fn receipt_pattern_escapes_collection_names() {
        assert_eq!(
            receipt_pattern(&ReceiptLayout::new("team.v2", "ops+log")),
            r"^team\.v2/[^/]+/ops\+log/[^/]+$"
        );
        assert_eq!(
            receipt_pattern(&ReceiptLayout::new("game_players", "receipts")),
            "^game_players/[^/]+/receipts/[^/]+$"
        );
    }

    #[test]
    fn non_database_errors_are_backend_failures() {
        let err = store_error(sqlx::Error::RowNotFound, "players/p1");
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
