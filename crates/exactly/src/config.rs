//! Executor configuration.

use std::time::Duration;

use crate::error::StoreError;
use crate::key::OperationKey;
use crate::retry::RetryConfig;
use crate::store::DocumentPath;

/// Default lifetime of an `in_progress` receipt before it may be reclaimed.
pub const DEFAULT_IN_PROGRESS_TTL: Duration = Duration::from_secs(120);

/// Where receipts live: `{actor_collection}/{actor}/{receipt_collection}/{op_id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptLayout {
    pub actor_collection: String,
    pub receipt_collection: String,
}

impl Default for ReceiptLayout {
    fn default() -> Self {
        Self {
            actor_collection: "players".into(),
            receipt_collection: "receipts".into(),
        }
    }
}

impl ReceiptLayout {
    pub fn new(actor_collection: impl Into<String>, receipt_collection: impl Into<String>) -> Self {
        Self {
            actor_collection: actor_collection.into(),
            receipt_collection: receipt_collection.into(),
        }
    }

    pub fn path(&self, key: &OperationKey) -> Result<DocumentPath, StoreError> {
        DocumentPath::new(&self.actor_collection, key.actor().as_str())?
            .child(&self.receipt_collection, key.op_id().as_str())
    }
}

/// Settings shared by the guard, the executor, and the composer.
///
/// # Defaults
///
/// - Conflict retry: [`RetryConfig::default`]
/// - `in_progress` TTL: 120 seconds
/// - Inputs verification: on
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub retry: RetryConfig,
    /// `None` keeps `in_progress` receipts live forever.
    pub in_progress_ttl: Option<Duration>,
    /// Reject a reused key whose `inputs_hash` differs from the stored one.
    pub verify_inputs: bool,
    pub layout: ReceiptLayout,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            in_progress_ttl: Some(DEFAULT_IN_PROGRESS_TTL),
            verify_inputs: true,
            layout: ReceiptLayout::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_in_progress_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.in_progress_ttl = ttl;
        self
    }

    pub fn with_verify_inputs(mut self, verify: bool) -> Self {
        self.verify_inputs = verify;
        self
    }

    pub fn with_layout(mut self, layout: ReceiptLayout) -> Self {
        self.layout = layout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipts_nest_under_the_actor() {
        let key = OperationKey::new("p1", "op-1").unwrap();
        let path = ReceiptLayout::default().path(&key).unwrap();
        assert_eq!(path.as_str(), "players/p1/receipts/op-1");

        let custom = ReceiptLayout::new("accounts", "ops").path(&key).unwrap();
        assert_eq!(custom.as_str(), "accounts/p1/ops/op-1");
    }
}
