//! # Exactly
//!
//! Exactly-once effects for client-retried operations, built on an
//! optimistic transactional document store.
//!
//! ## Core Concepts
//!
//! Every state-changing request carries a client-generated operation id.
//! Together with the acting principal it forms an [`OperationKey`], and each
//! key owns one [`OperationReceipt`] document:
//!
//! - `in_progress` - an attempt has claimed the key
//! - `completed` - terminal; stores the serialized result for replay
//! - `failed` - terminal, but a fresh attempt under the same key may run
//!
//! The key principle: **the business writes and the `completed` receipt
//! commit in the same transaction**. Either both are visible or neither is.
//!
//! ## Architecture
//!
//! ```text
//! Request handler
//!     │
//!     ▼ run_with_receipt(key, reason, work)
//! Executor
//!     │
//!     ├─► IdempotencyGuard.check_idempotency() ─► completed? ─► replay result
//!     │
//!     ├─► IdempotencyGuard.claim() ─────────────► in_progress (attempt A)
//!     │
//!     ├─► DocumentStore transaction ─────────────┐
//!     │       receipt still owned by A?          │ conflict:
//!     │       work(tx)                           │ re-run the
//!     │       receipt := completed(result)       │ whole body
//!     │   commit ◄───────────────────────────────┘
//!     │
//!     └─► on error: receipt := failed (if still owned by A), error returned
//! ```
//!
//! ## Key Invariants
//!
//! 1. **At most one effect per key** - the effect commits only together
//!    with the `completed` receipt, and only while the attempt owns the key
//! 2. **Completed is final** - a completed receipt is never modified
//! 3. **Replays are faithful** - a replay returns the stored result, decoded
//!    exactly as the first caller received it
//! 4. **Failures don't poison keys** - a failed receipt lets the client retry
//! 5. **Work is re-runnable** - under contention the work callback runs more
//!    than once and must only act through the transaction it is given
//!
//! ## Guarantees
//!
//! - **Exactly-once effect** for every key whose attempts go through the
//!   executor, including concurrent duplicates
//! - **Bounded waiting**: conflicts retry with jittered backoff up to
//!   [`RetryConfig::max_retries`], then fail with
//!   [`ExactlyError::ContentionExhausted`]
//! - **Crash recovery**: an `in_progress` receipt older than
//!   [`ExecutorConfig::in_progress_ttl`] may be reclaimed
//!
//! ## Example
//!
//! ```ignore
//! use exactly_core::{json, DocumentPath, Executor, MemoryStore, OperationKey, ReceiptMetadata};
//! use std::sync::Arc;
//!
//! let executor = Executor::new(Arc::new(MemoryStore::new()));
//! let key = OperationKey::new("player-1", "4f1c...")?;
//! let counter = DocumentPath::new("counters", "player-1")?;
//!
//! let result: serde_json::Value = executor
//!     .run_with_receipt(&key, "increment", &ReceiptMetadata::none(), move |tx| {
//!         let counter = counter.clone();
//!         Box::pin(async move {
//!             let count = tx
//!                 .get(&counter)
//!                 .await?
//!                 .and_then(|doc| doc["count"].as_i64())
//!                 .unwrap_or(0);
//!             tx.set(&counter, json!({ "count": count + 1 }), true)?;
//!             Ok(json!({ "count": count + 1 }))
//!         })
//!     })
//!     .await?;
//!
//! // Same key again: the stored result, no second increment.
//! ```
//!
//! ## What This Is Not
//!
//! Exactly is **not**:
//! - A distributed lock
//! - A general-purpose database
//! - A job queue or saga engine
//!
//! Exactly **is**:
//! > A receipt protocol that makes client retries safe.

// Core modules
mod clock;
mod compose;
mod config;
mod error;
mod executor;
mod guard;
mod key;
mod receipt;
mod receipt_store;
mod retry;

// Store seam and the in-memory backend
pub mod store;


// Concurrent duplicate tests (test-only)
#[cfg(test)]
mod race_tests;

// Re-export keys
pub use key::{ActorId, OperationId, OperationKey, MAX_ID_LEN};

// Re-export receipt types
pub use receipt::{inputs_hash, AttemptId, OperationReceipt, ReceiptMetadata, ReceiptStatus};

// Re-export error types
pub use error::{classify, ErrorClass, ExactlyError, StoreError};

// Re-export configuration
pub use config::{ExecutorConfig, ReceiptLayout, DEFAULT_IN_PROGRESS_TTL};
pub use retry::RetryConfig;

// Re-export clocks
pub use clock::{Clock, ManualClock, SystemClock};

// Re-export store types
pub use store::{
    run_transaction, server_timestamp, DocumentPath, DocumentStore, MemoryStore, Transaction,
    TxFuture,
};

// Re-export the envelope
pub use executor::Executor;
pub use guard::{Claim, IdempotencyGuard};
pub use receipt_store::ReceiptStore;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use serde_json::json;
