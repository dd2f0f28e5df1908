//! The idempotency guard: replay, reject, or let an attempt proceed.
//!
//! A caller first asks [`IdempotencyGuard::check_idempotency`] whether the key
//! already has an outcome, then claims the key with
//! [`IdempotencyGuard::create_in_progress_receipt`]. The claim is a
//! compare-and-set executed as its own optimistic transaction, so two
//! concurrent claimants of one key cannot both obtain an attempt: the loser
//! conflicts, re-reads, and finds the winner's live `in_progress` receipt.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::ExecutorConfig;
use crate::error::{into_exactly, ExactlyError};
use crate::key::OperationKey;
use crate::receipt::{
    in_progress_document, AttemptId, OperationReceipt, ReceiptMetadata, ReceiptStatus,
};
use crate::receipt_store::ReceiptStore;
use crate::retry::RetryConfig;
use crate::store::{run_transaction, DocumentStore};

/// Outcome of claiming a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The caller now owns a fresh `in_progress` receipt.
    Acquired(AttemptId),
    /// The key completed before the claim; carries the stored result.
    Completed(Value),
}

#[derive(Debug, Clone, PartialEq)]
enum Verdict {
    Proceed,
    /// Stale `in_progress` receipt that may be taken over.
    Reclaim,
    Replay(Value),
    InFlight,
    Mismatch,
}

#[derive(Debug, Clone, Copy)]
struct ReplayPolicy {
    ttl: Option<Duration>,
    verify_inputs: bool,
}

impl ReplayPolicy {
    fn evaluate(
        &self,
        receipt: &OperationReceipt,
        metadata: &ReceiptMetadata,
        now: DateTime<Utc>,
    ) -> Verdict {
        let mismatch = self.verify_inputs && metadata.conflicts_with(&receipt.metadata);
        match receipt.status {
            ReceiptStatus::Failed => Verdict::Proceed,
            ReceiptStatus::Completed if mismatch => Verdict::Mismatch,
            ReceiptStatus::Completed => {
                Verdict::Replay(receipt.result.clone().unwrap_or(Value::Null))
            }
            ReceiptStatus::InProgress if receipt.is_stale(now, self.ttl) => Verdict::Reclaim,
            ReceiptStatus::InProgress if mismatch => Verdict::Mismatch,
            ReceiptStatus::InProgress => Verdict::InFlight,
        }
    }
}

/// Decides whether a call short-circuits, is rejected, or may run.
pub struct IdempotencyGuard<S> {
    receipts: ReceiptStore<S>,
    policy: ReplayPolicy,
    retry: RetryConfig,
}

impl<S> Clone for IdempotencyGuard<S> {
    fn clone(&self) -> Self {
        Self {
            receipts: self.receipts.clone(),
            policy: self.policy,
            retry: self.retry.clone(),
        }
    }
}

impl<S: DocumentStore> IdempotencyGuard<S> {
    pub fn new(store: Arc<S>, config: &ExecutorConfig) -> Self {
        Self {
            receipts: ReceiptStore::new(store, config.layout.clone()),
            policy: ReplayPolicy {
                ttl: config.in_progress_ttl,
                verify_inputs: config.verify_inputs,
            },
            retry: config.retry.clone(),
        }
    }

    pub fn receipts(&self) -> &ReceiptStore<S> {
        &self.receipts
    }

    /// Return the cached result of a completed operation, or `None` if the
    /// caller may proceed.
    ///
    /// Fails with [`ExactlyError::OperationInProgress`] while another attempt
    /// holds a live `in_progress` receipt.
    pub async fn check_idempotency(
        &self,
        key: &OperationKey,
    ) -> Result<Option<Value>, ExactlyError> {
        self.check_idempotency_with(key, &ReceiptMetadata::none())
            .await
    }

    /// [`check_idempotency`](Self::check_idempotency), additionally failing with
    /// [`ExactlyError::InputsMismatch`] if `metadata` carries an inputs hash
    /// that differs from the stored one.
    pub async fn check_idempotency_with(
        &self,
        key: &OperationKey,
        metadata: &ReceiptMetadata,
    ) -> Result<Option<Value>, ExactlyError> {
        let Some(receipt) = self.receipts.get(key).await? else {
            return Ok(None);
        };
        let now = self.receipts.store().server_time().await?;
        match self.policy.evaluate(&receipt, metadata, now) {
            Verdict::Proceed => Ok(None),
            Verdict::Reclaim => {
                tracing::warn!(
                    actor = %key.actor(),
                    op_id = %key.op_id(),
                    created_at = ?receipt.created_at,
                    "in-progress receipt expired; treating as reclaimable"
                );
                Ok(None)
            }
            Verdict::Replay(result) => Ok(Some(result)),
            Verdict::InFlight => Err(ExactlyError::in_progress(key)),
            Verdict::Mismatch => Err(ExactlyError::inputs_mismatch(key)),
        }
    }

    /// Write a fresh `in_progress` receipt and return the new attempt's id.
    ///
    /// Only succeeds if the key has no receipt, a `failed` one, or an expired
    /// `in_progress` one. A completed key fails with
    /// [`ExactlyError::AlreadyCompleted`].
    pub async fn create_in_progress_receipt(
        &self,
        key: &OperationKey,
        reason: &str,
        metadata: &ReceiptMetadata,
    ) -> Result<AttemptId, ExactlyError> {
        match self.claim(key, reason, metadata).await? {
            Claim::Acquired(attempt) => Ok(attempt),
            Claim::Completed(_) => Err(ExactlyError::already_completed(key)),
        }
    }

    /// Conditionally create the `in_progress` receipt in one transaction.
    pub async fn claim(
        &self,
        key: &OperationKey,
        reason: &str,
        metadata: &ReceiptMetadata,
    ) -> Result<Claim, ExactlyError> {
        let policy = self.policy;
        let receipts = self.receipts.clone();
        let owned_key = key.clone();
        let reason = reason.to_string();
        let metadata = metadata.clone();

        let claim = run_transaction(self.receipts.store().as_ref(), &self.retry, move |tx| {
            let receipts = receipts.clone();
            let key = owned_key.clone();
            let reason = reason.clone();
            let metadata = metadata.clone();
            Box::pin(async move {
                // Each retry judges staleness against the clock at that retry.
                let now = receipts.store().server_time().await?;
                let existing = receipts.get_in(tx, &key).await?;
                if let Some(receipt) = existing {
                    match policy.evaluate(&receipt, &metadata, now) {
                        Verdict::Proceed => {}
                        Verdict::Reclaim => {
                            tracing::warn!(
                                actor = %key.actor(),
                                op_id = %key.op_id(),
                                stale_attempt = ?receipt.attempt_id,
                                "reclaiming expired in-progress receipt"
                            );
                        }
                        Verdict::Replay(result) => return Ok(Claim::Completed(result)),
                        Verdict::InFlight => return Err(ExactlyError::in_progress(&key).into()),
                        Verdict::Mismatch => {
                            return Err(ExactlyError::inputs_mismatch(&key).into())
                        }
                    }
                }
                let attempt = AttemptId::new();
                receipts.put_in(
                    tx,
                    &key,
                    in_progress_document(&reason, attempt, &metadata),
                    false,
                )?;
                anyhow::Ok(Claim::Acquired(attempt))
            })
        })
        .await
        .map_err(into_exactly)?;

        if let Claim::Acquired(attempt) = &claim {
            tracing::debug!(actor = %key.actor(), op_id = %key.op_id(), %attempt, "claimed operation");
        }
        Ok(claim)
    }
}
