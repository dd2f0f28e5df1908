//! In-process [`DocumentStore`] with versioned documents.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::{
    apply_write, expect_object, DocumentPath, DocumentStore, PendingWrite, Transaction,
    WriteBuffer, WriteOp,
};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// Version recorded for a document that does not exist.
const ABSENT: u64 = 0;

struct Versioned {
    version: u64,
    fields: Map<String, Value>,
}

#[derive(Default)]
struct Documents {
    docs: BTreeMap<DocumentPath, Versioned>,
    /// Version stamped on the next commit.
    next_version: u64,
}

impl Documents {
    fn version_of(&self, path: &DocumentPath) -> u64 {
        self.docs.get(path).map_or(ABSENT, |doc| doc.version)
    }

    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Apply `writes` all-or-nothing.
    fn apply(&mut self, writes: &[PendingWrite], now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut staged: HashMap<&DocumentPath, Option<Map<String, Value>>> = HashMap::new();
        let mut order: Vec<&DocumentPath> = Vec::new();
        for write in writes {
            let current = match staged.get(&write.path) {
                Some(pending) => pending.clone(),
                None => self.docs.get(&write.path).map(|doc| doc.fields.clone()),
            };
            let next = apply_write(&write.path, current, &write.op, now)?;
            if staged.insert(&write.path, next).is_none() {
                order.push(&write.path);
            }
        }

        let version = self.bump();
        for path in order {
            match staged.remove(path).flatten() {
                Some(fields) => {
                    self.docs.insert(path.clone(), Versioned { version, fields });
                }
                None => {
                    self.docs.remove(path);
                }
            }
        }
        Ok(())
    }
}

struct Shared {
    documents: Mutex<Documents>,
    clock: Arc<dyn Clock>,
}

/// Thread-safe in-memory store. Clones share the same documents.
///
/// Every committed document carries a version; a transaction remembers the
/// version of each document it read and its commit fails with
/// [`StoreError::Conflict`] if any of them moved in the meantime.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` for every server timestamp.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                documents: Mutex::new(Documents::default()),
                clock,
            }),
        }
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.shared.documents.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction over a [`MemoryStore`].
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    reads: HashMap<DocumentPath, u64>,
    writes: WriteBuffer,
}

impl MemoryTransaction {
    fn buffer(&mut self, path: &DocumentPath, op: WriteOp) {
        self.writes.push(PendingWrite {
            path: path.clone(),
            op,
        });
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, path: &DocumentPath) -> Result<Option<Value>, StoreError> {
        if !self.writes.is_empty() {
            return Err(StoreError::ReadAfterWrite {
                path: path.to_string(),
            });
        }
        let documents = self.shared.documents.lock();
        let version = documents.version_of(path);
        let seen = *self.reads.entry(path.clone()).or_insert(version);
        if seen != version {
            return Err(StoreError::Conflict {
                path: path.to_string(),
            });
        }
        Ok(documents
            .docs
            .get(path)
            .map(|doc| Value::Object(doc.fields.clone())))
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
impl DocumentStore for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            reads: HashMap::new(),
            writes: WriteBuffer::new(),
        })
    }

    async fn commit(&self, tx: MemoryTransaction) -> Result<(), StoreError> {
        if !Arc::ptr_eq(&tx.shared, &self.shared) {
            return Err(StoreError::Backend(
                "transaction belongs to a different store".into(),
            ));
        }
        let mut documents = self.shared.documents.lock();
        for (path, seen) in &tx.reads {
            if documents.version_of(path) != *seen {
                return Err(StoreError::Conflict {
                    path: path.to_string(),
                });
            }
        }
        if tx.writes.is_empty() {
            return Ok(());
        }
        documents.apply(&tx.writes, self.shared.clock.now())
    }

    async fn rollback(&self, _tx: MemoryTransaction) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, path: &DocumentPath) -> Result<Option<Value>, StoreError> {
        let documents = self.shared.documents.lock();
        Ok(documents
            .docs
            .get(path)
            .map(|doc| Value::Object(doc.fields.clone())))
    }

    async fn set(&self, path: &DocumentPath, value: Value, merge: bool) -> Result<(), StoreError> {
        let fields = expect_object(path, value)?;
        let write = PendingWrite {
            path: path.clone(),
            op: WriteOp::Set { fields, merge },
        };
        let mut documents = self.shared.documents.lock();
        documents.apply(std::slice::from_ref(&write), self.shared.clock.now())
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, StoreError> {
        Ok(self.shared.clock.now())
    }
}
