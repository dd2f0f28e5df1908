//! Read-then-write composition on top of the executor.
//!
//! Business logic that needs to look something up before it writes (a
//! catalog entry, a balance) is split into two callbacks. Both run inside
//! the same transaction as the receipt bookkeeping, and on conflict the pair
//! is re-run as a unit.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ExactlyError;
use crate::executor::{AttemptBody, Executor, Start};
use crate::key::OperationKey;
use crate::receipt::ReceiptMetadata;
use crate::store::{DocumentStore, Transaction, TxFuture};

struct ReadThenWrite<RF, WF, R, T> {
    read: RF,
    write: WF,
    _phases: PhantomData<fn(R) -> T>,
}

#[async_trait]
impl<S, R, T, RF, WF> AttemptBody<S> for ReadThenWrite<RF, WF, R, T>
where
    S: DocumentStore,
    R: Send + 'static,
    T: Send,
    RF: for<'t> FnMut(&'t mut S::Transaction) -> TxFuture<'t, R> + Send,
    WF: for<'t> FnMut(&'t mut S::Transaction, R) -> TxFuture<'t, T> + Send,
{
    type Output = T;

    async fn run(&mut self, tx: &mut S::Transaction) -> anyhow::Result<T> {
        let reads = (self.read)(tx).await?;
        if tx.has_pending_writes() {
            return Err(ExactlyError::InvalidArgument(
                "read phase must not write; move writes into the write phase".into(),
            )
            .into());
        }
        (self.write)(tx, reads).await
    }
}

impl<S: DocumentStore> Executor<S> {
    /// Like [`run_with_receipt`](Self::run_with_receipt), with the business
    /// logic split into a read phase and a write phase.
    ///
    /// The read phase may only read; its result is handed to the write
    /// phase. A read phase that buffers a write fails the operation with
    /// [`ExactlyError::InvalidArgument`].
    #[tracing::instrument(
        name = "exactly.compose",
        skip_all,
        fields(actor = %key.actor(), op_id = %key.op_id(), reason = %reason)
    )]
    pub async fn run_read_then_write_with_receipt<R, T, RF, WF>(
        &self,
        key: &OperationKey,
        reason: &str,
        metadata: &ReceiptMetadata,
        read_phase: RF,
        write_phase: WF,
    ) -> anyhow::Result<T>
    where
        R: Send + 'static,
        T: Serialize + DeserializeOwned + Send,
        RF: for<'t> FnMut(&'t mut S::Transaction) -> TxFuture<'t, R> + Send,
        WF: for<'t> FnMut(&'t mut S::Transaction, R) -> TxFuture<'t, T> + Send,
    {
        let attempt = match self.begin_attempt(key, reason, metadata).await? {
            Start::Replay(value) => return Ok(value),
            Start::Run(attempt) => attempt,
        };
        let mut body = ReadThenWrite {
            read: read_phase,
            write: write_phase,
            _phases: PhantomData,
        };
        let outcome = self.drive(key, attempt, &mut body).await;
        self.finish(key, attempt, outcome).await
    }
}
