//! The transactional document store seam.
//!
//! A [`DocumentStore`] holds JSON object documents addressed by
//! [`DocumentPath`]. Work runs inside a [`Transaction`]:
//!
//! 1. `begin()` returns a transaction
//! 2. transactional reads are recorded in a read set; writes are buffered
//! 3. `commit(tx)` validates the read set and applies every buffered write
//!    atomically, or fails with [`StoreError::Conflict`]
//!
//! Conflicts are detected on the READ set (first committer wins). Blind
//! writes never conflict. All reads must precede the first write.

mod memory;

pub use memory::{MemoryStore, MemoryTransaction};

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use smallvec::SmallVec;

use crate::error::{is_conflict, ExactlyError, StoreError};
use crate::retry::RetryConfig;

/// Future returned by callbacks that run inside a transaction.
pub type TxFuture<'t, T> = BoxFuture<'t, anyhow::Result<T>>;

/// Field name of the server timestamp sentinel object.
pub const SERVER_TIMESTAMP_KEY: &str = "$serverTimestamp";

/// Sentinel replaced by the store's clock when the write is applied.
pub fn server_timestamp() -> Value {
    json!({ SERVER_TIMESTAMP_KEY: true })
}

/// Format used for every resolved server timestamp.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_server_timestamp(value: &Value) -> bool {
    matches!(
        value.as_object(),
        Some(map) if map.len() == 1 && map.get(SERVER_TIMESTAMP_KEY) == Some(&Value::Bool(true))
    )
}

/// Replace every server timestamp sentinel inside `value` with `now`.
pub fn resolve_server_timestamps(value: &mut Value, now: DateTime<Utc>) {
    if is_server_timestamp(value) {
        *value = Value::String(format_timestamp(now));
        return;
    }
    match value {
        Value::Object(map) => {
            for field in map.values_mut() {
                resolve_server_timestamps(field, now);
            }
        }
        Value::Array(items) => {
            for item in items {
                resolve_server_timestamps(item, now);
            }
        }
        _ => {}
    }
}

/// Shallow merge: top-level fields of `patch` replace those of `base`.
pub fn merge_fields(base: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (field, value) in patch {
        base.insert(field, value);
    }
}

/// Slash-separated address of a document: `collection/id[/collection/id...]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentPath(String);

impl DocumentPath {
    pub fn new(collection: &str, id: &str) -> Result<Self, StoreError> {
        check_segment(collection)?;
        check_segment(id)?;
        Ok(Self(format!("{collection}/{id}")))
    }

    /// Address a document in a subcollection of this one.
    pub fn child(&self, collection: &str, id: &str) -> Result<Self, StoreError> {
        check_segment(collection)?;
        check_segment(id)?;
        Ok(Self(format!("{}/{collection}/{id}", self.0)))
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let mut count = 0usize;
        for segment in raw.split('/') {
            check_segment(segment)?;
            count += 1;
        }
        if count % 2 != 0 {
            return Err(StoreError::InvalidPath(format!(
                "{raw:?} does not name a document"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn check_segment(segment: &str) -> Result<(), StoreError> {
    if segment.is_empty() || segment.contains('/') {
        return Err(StoreError::InvalidPath(format!(
            "invalid path segment {segment:?}"
        )));
    }
    Ok(())
}

/// Require a document body to be a JSON object.
pub fn expect_object(path: &DocumentPath, value: Value) -> Result<Map<String, Value>, StoreError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidDocument {
            path: path.to_string(),
            reason: format!("expected an object, got {other}"),
        }),
    }
}

/// A write buffered by a transaction until commit.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set { fields: Map<String, Value>, merge: bool },
    Update { fields: Map<String, Value> },
    Create { fields: Map<String, Value> },
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub path: DocumentPath,
    pub op: WriteOp,
}

/// Most transactions touch a business document or two plus a receipt.
pub type WriteBuffer = SmallVec<[PendingWrite; 4]>;

/// Compute the document that results from applying `op` to `current`.
///
/// `None` means the document does not exist. Server timestamp sentinels in
/// the written fields are resolved to `now`.
pub fn apply_write(
    path: &DocumentPath,
    current: Option<Map<String, Value>>,
    op: &WriteOp,
    now: DateTime<Utc>,
) -> Result<Option<Map<String, Value>>, StoreError> {
    let resolve = |fields: &Map<String, Value>| {
        let mut value = Value::Object(fields.clone());
        resolve_server_timestamps(&mut value, now);
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    };

    match op {
        WriteOp::Set {
            fields,
            merge: false,
        } => Ok(Some(resolve(fields))),
        WriteOp::Set {
            fields,
            merge: true,
        } => {
            let mut base = current.unwrap_or_default();
            merge_fields(&mut base, resolve(fields));
            Ok(Some(base))
        }
        WriteOp::Update { fields } => {
            let Some(mut base) = current else {
                return Err(StoreError::NotFound {
                    path: path.to_string(),
                });
            };
            merge_fields(&mut base, resolve(fields));
            Ok(Some(base))
        }
        WriteOp::Create { fields } => {
            if current.is_some() {
                return Err(StoreError::AlreadyExists {
                    path: path.to_string(),
                });
            }
            Ok(Some(resolve(fields)))
        }
        WriteOp::Delete => Ok(None),
    }
}

/// A transactional document store with optimistic concurrency control.
///
/// Implementations must be `Send + Sync + 'static` so one instance can be
/// shared by every request handler.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    type Transaction: Transaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError>;

    /// Validate the read set and apply all buffered writes atomically.
    async fn commit(&self, tx: Self::Transaction) -> Result<(), StoreError>;

    /// Discard the transaction. Dropping it has the same effect.
    async fn rollback(&self, tx: Self::Transaction) -> Result<(), StoreError>;

    /// Read a document outside any transaction.
    async fn get(&self, path: &DocumentPath) -> Result<Option<Value>, StoreError>;

    /// Write a document outside any transaction.
    async fn set(&self, path: &DocumentPath, value: Value, merge: bool) -> Result<(), StoreError>;

    /// The store's notion of "now", used for every server timestamp.
    async fn server_time(&self) -> Result<DateTime<Utc>, StoreError>;
}

/// One in-flight transaction.
#[async_trait]
pub trait Transaction: Send + 'static {
    /// Read a document and add it to the read set.
    async fn get(&mut self, path: &DocumentPath) -> Result<Option<Value>, StoreError>;

    /// Replace (or with `merge`, shallow-merge into) a document.
    fn set(&mut self, path: &DocumentPath, value: Value, merge: bool) -> Result<(), StoreError>;

    /// Shallow-merge into a document that must exist at commit.
    fn update(&mut self, path: &DocumentPath, fields: Value) -> Result<(), StoreError>;

    /// Create a document that must not exist at commit.
    fn create(&mut self, path: &DocumentPath, value: Value) -> Result<(), StoreError>;

    fn delete(&mut self, path: &DocumentPath);

    fn has_pending_writes(&self) -> bool;
}

/// Commit `tx` if `outcome` succeeded, roll it back otherwise.
pub(crate) async fn settle<S, T>(
    store: &S,
    tx: S::Transaction,
    outcome: anyhow::Result<T>,
) -> anyhow::Result<T>
where
    S: DocumentStore,
{
    match outcome {
        Ok(value) => {
            store.commit(tx).await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = store.rollback(tx).await {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}

/// Tracks attempts of one transaction body across conflict retries.
pub(crate) struct ConflictRetry<'a> {
    config: &'a RetryConfig,
    attempts: usize,
}

impl<'a> ConflictRetry<'a> {
    pub(crate) fn new(config: &'a RetryConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Decide whether the failed attempt is re-run. Non-conflict errors are
    /// handed back unchanged.
    pub(crate) async fn again(&mut self, err: anyhow::Error) -> anyhow::Result<()> {
        self.attempts += 1;
        if !is_conflict(&err) {
            return Err(err);
        }
        if self.attempts >= self.config.max_attempts() {
            tracing::warn!(attempts = self.attempts, "transaction retry budget exhausted");
            return Err(ExactlyError::ContentionExhausted {
                attempts: self.attempts,
            }
            .into());
        }
        tracing::warn!(attempt = self.attempts, error = %err, "transaction conflict, retrying");
        self.config.backoff(self.attempts - 1).await;
        Ok(())
    }
}

/// Run `f` in a transaction, re-running the whole closure on conflict.
///
/// `f` may be invoked more than once and must not have effects outside the
/// transaction it is given.
pub async fn run_transaction<S, T, F>(store: &S, retry: &RetryConfig, mut f: F) -> anyhow::Result<T>
where
    S: DocumentStore,
    T: Send,
    F: for<'t> FnMut(&'t mut S::Transaction) -> TxFuture<'t, T> + Send,
{
    let mut conflicts = ConflictRetry::new(retry);
    loop {
        let mut tx = store.begin().await?;
        let outcome = f(&mut tx).await;
        match settle(store, tx, outcome).await {
            Ok(value) => return Ok(value),
            Err(err) => conflicts.again(err).await?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn document_paths_validate_segments() {
        let player = DocumentPath::new("players", "p1").unwrap();
        let receipt = player.child("receipts", "op-1").unwrap();
        assert_eq!(receipt.as_str(), "players/p1/receipts/op-1");
        assert_eq!(DocumentPath::parse("players/p1/receipts/op-1").unwrap(), receipt);

        assert!(DocumentPath::new("players", "").is_err());
        assert!(DocumentPath::parse("players").is_err());
        assert!(DocumentPath::parse("players//x").is_err());
    }

    #[test]
    fn server_timestamps_resolve_recursively() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut doc = json!({
            "createdAt": server_timestamp(),
            "nested": { "at": server_timestamp(), "keep": 1 },
            "list": [server_timestamp()],
            "lookalike": { "$serverTimestamp": true, "other": 1 },
        });
        resolve_server_timestamps(&mut doc, now);

        assert_eq!(doc["createdAt"], "2026-03-01T12:00:00.000Z");
        assert_eq!(doc["nested"]["at"], "2026-03-01T12:00:00.000Z");
        assert_eq!(doc["nested"]["keep"], 1);
        assert_eq!(doc["list"][0], "2026-03-01T12:00:00.000Z");
        assert!(doc["lookalike"].is_object());
    }

    #[test]
    fn apply_write_follows_document_semantics() {
        let path = DocumentPath::new("wallets", "p1").unwrap();
        let now = Utc::now();
        let existing = expect_object(&path, json!({ "coins": 10, "gems": 2 })).unwrap();

        let merged = apply_write(
            &path,
            Some(existing.clone()),
            &WriteOp::Set {
                fields: expect_object(&path, json!({ "coins": 20 })).unwrap(),
                merge: true,
            },
            now,
        )
        .unwrap()
        .unwrap();
        assert_eq!(Value::Object(merged), json!({ "coins": 20, "gems": 2 }));

        let missing = apply_write(
            &path,
            None,
            &WriteOp::Update {
                fields: Map::new(),
            },
            now,
        );
        assert_eq!(
            missing,
            Err(StoreError::NotFound {
                path: "wallets/p1".into()
            })
        );

        let duplicate = apply_write(
            &path,
            Some(existing),
            &WriteOp::Create {
                fields: Map::new(),
            },
            now,
        );
        assert!(matches!(duplicate, Err(StoreError::AlreadyExists { .. })));
    }
}
