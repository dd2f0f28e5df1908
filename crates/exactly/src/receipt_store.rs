//! Keyed access to receipt documents, inside or outside a transaction.

use std::sync::Arc;

use serde_json::Value;

use crate::config::ReceiptLayout;
use crate::error::ExactlyError;
use crate::key::OperationKey;
use crate::receipt::OperationReceipt;
use crate::store::{DocumentPath, DocumentStore, Transaction};

/// Reads and writes the receipt for an [`OperationKey`].
///
/// Pure data access; deciding what to write is the guard's and executor's job.
pub struct ReceiptStore<S> {
    store: Arc<S>,
    layout: ReceiptLayout,
}

impl<S> Clone for ReceiptStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            layout: self.layout.clone(),
        }
    }
}

impl<S: DocumentStore> ReceiptStore<S> {
    pub fn new(store: Arc<S>, layout: ReceiptLayout) -> Self {
        Self { store, layout }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn path(&self, key: &OperationKey) -> Result<DocumentPath, ExactlyError> {
        Ok(self.layout.path(key)?)
    }

    pub async fn get(&self, key: &OperationKey) -> Result<Option<OperationReceipt>, ExactlyError> {
        let path = self.path(key)?;
        match self.store.get(&path).await? {
            Some(doc) => Ok(Some(OperationReceipt::from_document(doc)?)),
            None => Ok(None),
        }
    }

    /// Write receipt fields outside any transaction.
    pub async fn put(
        &self,
        key: &OperationKey,
        fields: Value,
        merge: bool,
    ) -> Result<(), ExactlyError> {
        let path = self.path(key)?;
        self.store.set(&path, fields, merge).await?;
        Ok(())
    }

    /// Read the receipt as part of `tx`'s read set.
    pub async fn get_in(
        &self,
        tx: &mut S::Transaction,
        key: &OperationKey,
    ) -> Result<Option<OperationReceipt>, ExactlyError> {
        let path = self.path(key)?;
        match tx.get(&path).await? {
            Some(doc) => Ok(Some(OperationReceipt::from_document(doc)?)),
            None => Ok(None),
        }
    }

    /// Buffer a receipt write in `tx`.
    pub fn put_in(
        &self,
        tx: &mut S::Transaction,
        key: &OperationKey,
        fields: Value,
        merge: bool,
    ) -> Result<(), ExactlyError> {
        let path = self.path(key)?;
        tx.set(&path, fields, merge)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipt::{in_progress_document, AttemptId, ReceiptMetadata, ReceiptStatus};
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_round_trips_outside_transactions() {
        let receipts = ReceiptStore::new(Arc::new(MemoryStore::new()), ReceiptLayout::default());
        let key = OperationKey::new("p1", "op-1").unwrap();
        assert!(receipts.get(&key).await.unwrap().is_none());

        let attempt = AttemptId::new();
        receipts
            .put(
                &key,
                in_progress_document("grantCoins", attempt, &ReceiptMetadata::none()),
                false,
            )
            .await
            .unwrap();

        let receipt = receipts.get(&key).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::InProgress);
        assert_eq!(receipt.reason, "grantCoins");
        assert!(receipt.is_owned_by(attempt));
        assert!(receipt.created_at.is_some());
    }

    #[tokio::test]
    async fn transactional_writes_land_on_commit() {
        let store = Arc::new(MemoryStore::new());
        let receipts = ReceiptStore::new(Arc::clone(&store), ReceiptLayout::default());
        let key = OperationKey::new("p1", "op-2").unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(receipts.get_in(&mut tx, &key).await.unwrap().is_none());
        receipts
            .put_in(&mut tx, &key, json!({ "status": "failed", "error": "boom" }), true)
            .unwrap();
        assert!(receipts.get(&key).await.unwrap().is_none());

        store.commit(tx).await.unwrap();
        let receipt = receipts.get(&key).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Failed);
        assert_eq!(receipt.error.as_deref(), Some("boom"));
    }
}
