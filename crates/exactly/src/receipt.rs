//! The operation receipt record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::store::server_timestamp;

/// Lifecycle state of a receipt.
///
/// `Completed` is terminal and immutable. `Failed` is terminal but does not
/// block a fresh attempt under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    InProgress,
    Completed,
    Failed,
}

/// Identifies the attempt that owns an `in_progress` receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(pub Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Optional audit metadata stored alongside a receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_hash: Option<String>,
}

impl ReceiptMetadata {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            inputs_hash: None,
        }
    }

    /// Metadata whose `inputs_hash` fingerprints `inputs`.
    pub fn for_inputs<I: Serialize>(
        kind: impl Into<String>,
        inputs: &I,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: Some(kind.into()),
            inputs_hash: Some(inputs_hash(inputs)?),
        })
    }

    /// True when both sides carry a hash and the hashes differ.
    pub fn conflicts_with(&self, stored: &ReceiptMetadata) -> bool {
        match (&self.inputs_hash, &stored.inputs_hash) {
            (Some(incoming), Some(stored)) => incoming != stored,
            _ => false,
        }
    }
}

/// SHA-256 (lowercase hex) of the canonical JSON encoding of `inputs`.
///
/// Object keys are sorted, so field order in the caller's struct does not
/// change the hash.
pub fn inputs_hash<I: Serialize>(inputs: &I) -> Result<String, serde_json::Error> {
    // serde_json::Map is ordered by key unless preserve_order is enabled
    let canonical = serde_json::to_vec(&serde_json::to_value(inputs)?)?;
    let digest = Sha256::digest(&canonical);
    Ok(digest.iter().map(|byte| format!("{byte:02x}")).collect())
}

/// A persisted operation receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReceipt {
    pub status: ReceiptStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<AttemptId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub metadata: ReceiptMetadata,
}

impl OperationReceipt {
    pub fn from_document(doc: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(doc)
    }

    pub fn is_owned_by(&self, attempt: AttemptId) -> bool {
        self.status == ReceiptStatus::InProgress && self.attempt_id == Some(attempt)
    }

    /// An `in_progress` receipt whose `created_at` is older than `ttl`.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Option<std::time::Duration>) -> bool {
        let (Some(ttl), Some(created_at)) = (ttl, self.created_at) else {
            return false;
        };
        if self.status != ReceiptStatus::InProgress {
            return false;
        }
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => created_at + ttl <= now,
            Err(_) => false,
        }
    }
}

/// Document body of a fresh `in_progress` receipt. Replaces whatever was there.
pub(crate) fn in_progress_document(
    reason: &str,
    attempt: AttemptId,
    metadata: &ReceiptMetadata,
) -> Value {
    let mut doc = json!({
        "status": ReceiptStatus::InProgress,
        "reason": reason,
        "attemptId": attempt,
        "createdAt": server_timestamp(),
    });
    append_metadata(&mut doc, metadata);
    doc
}

/// Fields merged into an owned `in_progress` receipt on success.
pub(crate) fn completed_fields(result: Value) -> Value {
    json!({
        "status": ReceiptStatus::Completed,
        "result": result,
        "completedAt": server_timestamp(),
    })
}

/// Fields merged into an owned `in_progress` receipt on failure.
pub(crate) fn failed_fields(error: &str) -> Value {
    json!({
        "status": ReceiptStatus::Failed,
        "error": error,
        "failedAt": server_timestamp(),
    })
}

fn append_metadata(doc: &mut Value, metadata: &ReceiptMetadata) {
    let Value::Object(fields) = doc else {
        return;
    };
    if let Ok(Value::Object(extra)) = serde_json::to_value(metadata) {
        fields.extend(extra);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn wire_format_uses_camel_case_and_snake_status() {
        let doc = json!({
            "status": "completed",
            "reason": "grantCoins",
            "result": { "count": 1 },
            "attemptId": "6f9619ff-8b86-4011-b42d-00cf4fc964ff",
            "createdAt": "2026-01-01T00:00:00.000Z",
            "completedAt": "2026-01-01T00:00:01.000Z",
            "kind": "economy",
            "inputsHash": "abc",
        });
        let receipt = OperationReceipt::from_document(doc).unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Completed);
        assert_eq!(receipt.result, Some(json!({ "count": 1 })));
        assert_eq!(receipt.metadata.kind.as_deref(), Some("economy"));
        assert_eq!(receipt.metadata.inputs_hash.as_deref(), Some("abc"));

        let back = serde_json::to_value(&receipt).unwrap();
        assert_eq!(back["inputsHash"], "abc");
        assert!(back.get("error").is_none());
    }

    #[test]
    fn inputs_hash_ignores_field_order() {
        let a = inputs_hash(&json!({ "amount": 100, "currency": "coins" })).unwrap();
        let b = inputs_hash(&json!({ "currency": "coins", "amount": 100 })).unwrap();
        let c = inputs_hash(&json!({ "currency": "coins", "amount": 101 })).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn metadata_conflict_requires_both_hashes() {
        let first = ReceiptMetadata::for_inputs("grant", &json!({ "amount": 1 })).unwrap();
        let second = ReceiptMetadata::for_inputs("grant", &json!({ "amount": 2 })).unwrap();
        assert!(second.conflicts_with(&first));
        assert!(!first.conflicts_with(&first.clone()));
        assert!(!ReceiptMetadata::none().conflicts_with(&first));
        assert!(!first.conflicts_with(&ReceiptMetadata::none()));
    }

    #[test]
    fn staleness_only_applies_to_in_progress() {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut receipt = OperationReceipt {
            status: ReceiptStatus::InProgress,
            reason: "openCrate".into(),
            result: None,
            error: None,
            attempt_id: Some(AttemptId::new()),
            created_at: Some(created),
            completed_at: None,
            failed_at: None,
            metadata: ReceiptMetadata::none(),
        };
        let ttl = Some(Duration::from_secs(60));
        let later = created + chrono::Duration::seconds(61);

        assert!(!receipt.is_stale(created + chrono::Duration::seconds(59), ttl));
        assert!(receipt.is_stale(later, ttl));
        assert!(!receipt.is_stale(later, None));

        receipt.status = ReceiptStatus::Completed;
        assert!(!receipt.is_stale(later, ttl));
    }
}
