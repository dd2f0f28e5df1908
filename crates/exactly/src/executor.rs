//! The transactional executor: business work and its completed receipt in one
//! atomic commit.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::ExecutorConfig;
use crate::error::ExactlyError;
use crate::guard::{Claim, IdempotencyGuard};
use crate::key::OperationKey;
use crate::receipt::{completed_fields, failed_fields, AttemptId, ReceiptMetadata};
use crate::receipt_store::ReceiptStore;
use crate::store::{
    resolve_server_timestamps, run_transaction, settle, ConflictRetry, DocumentStore, TxFuture,
};

/// Business logic of one transactional attempt.
///
/// `run` may be invoked several times for one operation (once per conflict
/// retry) and must only touch state through the transaction it is given.
#[async_trait]
pub(crate) trait AttemptBody<S: DocumentStore>: Send {
    type Output: Send;

    async fn run(&mut self, tx: &mut S::Transaction) -> anyhow::Result<Self::Output>;
}

struct Work<F, T> {
    work: F,
    _output: PhantomData<fn() -> T>,
}

#[async_trait]
impl<S, T, F> AttemptBody<S> for Work<F, T>
where
    S: DocumentStore,
    T: Send,
    F: for<'t> FnMut(&'t mut S::Transaction) -> TxFuture<'t, T> + Send,
{
    type Output = T;

    async fn run(&mut self, tx: &mut S::Transaction) -> anyhow::Result<T> {
        (self.work)(tx).await
    }
}

pub(crate) enum Start<T> {
    Replay(T),
    Run(AttemptId),
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ExactlyError> {
    Ok(serde_json::from_value(value)?)
}

/// Runs operations exactly once per [`OperationKey`].
///
/// # Example
///
/// ```ignore
/// let executor = Executor::new(Arc::new(MemoryStore::new()));
/// let key = OperationKey::new("p1", request.op_id)?;
/// let wallet = DocumentPath::new("wallets", "p1")?;
///
/// let granted: Grant = executor
///     .run_with_receipt(&key, "grantCoins", &ReceiptMetadata::none(), move |tx| {
///         let wallet = wallet.clone();
///         Box::pin(async move {
///             let coins = tx.get(&wallet).await?.and_then(|w| w["coins"].as_i64()).unwrap_or(0);
///             tx.set(&wallet, json!({ "coins": coins + 100 }), true)?;
///             Ok(Grant { coins: coins + 100 })
///         })
///     })
///     .await?;
/// ```
pub struct Executor<S> {
    store: Arc<S>,
    guard: IdempotencyGuard<S>,
    config: ExecutorConfig,
}

impl<S> Clone for Executor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            guard: self.guard.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: DocumentStore> Executor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, ExecutorConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: ExecutorConfig) -> Self {
        Self {
            guard: IdempotencyGuard::new(Arc::clone(&store), &config),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn guard(&self) -> &IdempotencyGuard<S> {
        &self.guard
    }

    pub fn receipts(&self) -> &ReceiptStore<S> {
        self.guard.receipts()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// See [`IdempotencyGuard::check_idempotency`].
    pub async fn check_idempotency(
        &self,
        key: &OperationKey,
    ) -> Result<Option<Value>, ExactlyError> {
        self.guard.check_idempotency(key).await
    }

    /// See [`IdempotencyGuard::create_in_progress_receipt`].
    pub async fn create_in_progress_receipt(
        &self,
        key: &OperationKey,
        reason: &str,
        metadata: &ReceiptMetadata,
    ) -> Result<AttemptId, ExactlyError> {
        self.guard
            .create_in_progress_receipt(key, reason, metadata)
            .await
    }

    /// Run `work` at most once per key and return its result.
    ///
    /// 1. A completed key returns its stored result without running `work`.
    /// 2. Otherwise the key is claimed with a fresh `in_progress` receipt.
    /// 3. `work` runs inside a transaction; in the same transaction the
    ///    receipt is re-read (it must still belong to this attempt) and then
    ///    marked `completed` with the serialized result. Conflicts re-run
    ///    this step.
    /// 4. On error the receipt is marked `failed` (best effort) and the
    ///    error is returned unchanged.
    #[tracing::instrument(
        name = "exactly.run",
        skip_all,
        fields(actor = %key.actor(), op_id = %key.op_id(), reason = %reason)
    )]
    pub async fn run_with_receipt<T, F>(
        &self,
        key: &OperationKey,
        reason: &str,
        metadata: &ReceiptMetadata,
        work: F,
    ) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: for<'t> FnMut(&'t mut S::Transaction) -> TxFuture<'t, T> + Send,
    {
        let attempt = match self.begin_attempt(key, reason, metadata).await? {
            Start::Replay(value) => return Ok(value),
            Start::Run(attempt) => attempt,
        };
        let mut body = Work {
            work,
            _output: PhantomData,
        };
        let outcome = self.drive(key, attempt, &mut body).await;
        self.finish(key, attempt, outcome).await
    }

    /// Validate the call, replay a completed key, or claim it.
    pub(crate) async fn begin_attempt<T: DeserializeOwned>(
        &self,
        key: &OperationKey,
        reason: &str,
        metadata: &ReceiptMetadata,
    ) -> Result<Start<T>, ExactlyError> {
        if reason.trim().is_empty() {
            return Err(ExactlyError::InvalidArgument(
                "reason must not be empty".into(),
            ));
        }
        if let Some(cached) = self.guard.check_idempotency_with(key, metadata).await? {
            tracing::debug!("replaying completed operation");
            return Ok(Start::Replay(decode(cached)?));
        }
        match self.guard.claim(key, reason, metadata).await? {
            Claim::Acquired(attempt) => Ok(Start::Run(attempt)),
            Claim::Completed(cached) => {
                tracing::debug!("operation completed while claiming; replaying");
                Ok(Start::Replay(decode(cached)?))
            }
        }
    }

    /// Run `body` and the completed receipt in one transaction, retrying on
    /// conflict.
    pub(crate) async fn drive<B>(
        &self,
        key: &OperationKey,
        attempt: AttemptId,
        body: &mut B,
    ) -> anyhow::Result<B::Output>
    where
        B: AttemptBody<S>,
        B::Output: Serialize + DeserializeOwned,
    {
        let mut conflicts = ConflictRetry::new(&self.config.retry);
        loop {
            let result = match self.store.begin().await {
                Ok(mut tx) => {
                    let outcome = self.attempt_once(&mut tx, key, attempt, body).await;
                    settle(self.store.as_ref(), tx, outcome).await
                }
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) => conflicts.again(err).await?,
            }
        }
    }

    async fn attempt_once<B>(
        &self,
        tx: &mut S::Transaction,
        key: &OperationKey,
        attempt: AttemptId,
        body: &mut B,
    ) -> anyhow::Result<B::Output>
    where
        B: AttemptBody<S>,
        B::Output: Serialize + DeserializeOwned,
    {
        // Read first: transactional reads must precede the body's writes.
        match self.receipts().get_in(tx, key).await? {
            Some(receipt) if receipt.is_owned_by(attempt) => {}
            _ => return Err(ExactlyError::superseded(key).into()),
        }
        let value = body.run(tx).await?;

        let mut stored = serde_json::to_value(&value).map_err(ExactlyError::from)?;
        // Sentinels in the result are pinned here, not at commit, so the
        // first caller and every replay see the same timestamp.
        resolve_server_timestamps(&mut stored, self.store.server_time().await?);
        // Replays decode the stored form, so the first caller gets it too.
        let value = decode(stored.clone())?;
        self.receipts()
            .put_in(tx, key, completed_fields(stored), true)?;
        Ok(value)
    }

    /// Failure bookkeeping after the last attempt.
    pub(crate) async fn finish<T: DeserializeOwned>(
        &self,
        key: &OperationKey,
        attempt: AttemptId,
        outcome: anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let err = match outcome {
            Ok(value) => {
                tracing::info!(%attempt, "operation completed");
                return Ok(value);
            }
            Err(err) => err,
        };

        if let Some(ExactlyError::AttemptSuperseded { .. }) = err.downcast_ref::<ExactlyError>() {
            // The key changed hands; the new owner may already have finished.
            if let Ok(Some(cached)) = self.guard.check_idempotency(key).await {
                tracing::debug!(%attempt, "superseded attempt replaying newer result");
                return Ok(decode(cached)?);
            }
            return Err(err);
        }

        self.record_failure(key, attempt, &err).await;
        Err(err)
    }

    /// Mark the receipt `failed` if this attempt still owns it. Never fails.
    async fn record_failure(&self, key: &OperationKey, attempt: AttemptId, err: &anyhow::Error) {
        let message = format!("{err:#}");
        let receipts = self.receipts().clone();
        let owned_key = key.clone();

        let written = run_transaction(self.store.as_ref(), &self.config.retry, move |tx| {
            let receipts = receipts.clone();
            let key = owned_key.clone();
            let message = message.clone();
            Box::pin(async move {
                match receipts.get_in(tx, &key).await? {
                    Some(receipt) if receipt.is_owned_by(attempt) => {
                        receipts.put_in(tx, &key, failed_fields(&message), true)?;
                        anyhow::Ok(true)
                    }
                    _ => anyhow::Ok(false),
                }
            })
        })
        .await;

        match written {
            Ok(true) => tracing::debug!(%attempt, error = %err, "operation failed"),
            Ok(false) => {
                tracing::debug!(%attempt, "receipt changed hands; failure not recorded")
            }
            Err(write_err) => tracing::warn!(
                %attempt,
                error = %err,
                write_error = %write_err,
                "could not record failure receipt"
            ),
        }
    }
}
