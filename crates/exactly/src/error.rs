//! Error types for the store substrate and the exactly-once envelope.

/// Errors returned by a [`DocumentStore`](crate::DocumentStore) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency conflict: a document in the read set changed
    /// before the transaction committed.
    #[error("concurrent conflict on {path}")]
    Conflict { path: String },

    /// `update` targeted a document that does not exist at commit time.
    #[error("document not found: {path}")]
    NotFound { path: String },

    /// `create` targeted a document that already exists at commit time.
    #[error("document already exists: {path}")]
    AlreadyExists { path: String },

    /// A transactional read was issued after the transaction buffered a write.
    #[error("read of {path} after a buffered write")]
    ReadAfterWrite { path: String },

    /// A path the store cannot address.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A document body that is not a JSON object.
    #[error("invalid document at {path}: {reason}")]
    InvalidDocument { path: String, reason: String },

    /// A backend-specific failure (connection, encoding, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Errors raised by the receipt store, the guard, and the executor itself.
///
/// Errors produced by a work callback are never wrapped in this type; they
/// reach the caller as the same `anyhow::Error` the callback returned.
#[derive(Debug, thiserror::Error)]
pub enum ExactlyError {
    /// Bad or missing actor, operation id, or reason. Nothing is written.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Another attempt holds a live `in_progress` receipt for this key.
    #[error("operation {op_id} for {actor} is already in progress")]
    OperationInProgress { actor: String, op_id: String },

    /// The key was reused with different semantic inputs.
    #[error("operation {op_id} for {actor} was already submitted with different inputs")]
    InputsMismatch { actor: String, op_id: String },

    /// A new attempt was requested for a key whose receipt is already completed.
    #[error("operation {op_id} for {actor} has already completed")]
    AlreadyCompleted { actor: String, op_id: String },

    /// The attempt's `in_progress` receipt was reclaimed by a newer attempt.
    #[error("attempt for operation {op_id} of {actor} was superseded")]
    AttemptSuperseded { actor: String, op_id: String },

    /// The store kept reporting conflicts until the retry budget ran out.
    #[error("transaction gave up after {attempts} conflicting attempts")]
    ContentionExhausted { attempts: usize },

    /// The result could not be stored, or a stored result could not be decoded.
    #[error("result serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExactlyError {
    pub(crate) fn in_progress(key: &crate::OperationKey) -> Self {
        Self::OperationInProgress {
            actor: key.actor().to_string(),
            op_id: key.op_id().to_string(),
        }
    }

    pub(crate) fn inputs_mismatch(key: &crate::OperationKey) -> Self {
        Self::InputsMismatch {
            actor: key.actor().to_string(),
            op_id: key.op_id().to_string(),
        }
    }

    pub(crate) fn already_completed(key: &crate::OperationKey) -> Self {
        Self::AlreadyCompleted {
            actor: key.actor().to_string(),
            op_id: key.op_id().to_string(),
        }
    }

    pub(crate) fn superseded(key: &crate::OperationKey) -> Self {
        Self::AttemptSuperseded {
            actor: key.actor().to_string(),
            op_id: key.op_id().to_string(),
        }
    }
}

impl From<serde_json::Error> for ExactlyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Coarse classification used by request handlers to pick a client response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request itself is malformed or reuses a key with other inputs.
    InvalidRequest,
    /// Another attempt is running; the client should retry later.
    InFlight,
    /// Business failure, contention exhaustion, or a backend failure.
    Failed,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::InFlight)
    }
}

/// Classify an error returned by the executor or composer.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    match err.downcast_ref::<ExactlyError>() {
        Some(ExactlyError::InvalidArgument(_))
        | Some(ExactlyError::InputsMismatch { .. })
        | Some(ExactlyError::AlreadyCompleted { .. }) => ErrorClass::InvalidRequest,
        Some(ExactlyError::OperationInProgress { .. })
        | Some(ExactlyError::AttemptSuperseded { .. }) => ErrorClass::InFlight,
        _ => ErrorClass::Failed,
    }
}

/// Recover the typed error from an `anyhow::Error` produced inside a
/// transaction body that only raises store or core errors.
pub(crate) fn into_exactly(err: anyhow::Error) -> ExactlyError {
    let err = match err.downcast::<ExactlyError>() {
        Ok(err) => return err,
        Err(err) => err,
    };
    match err.downcast::<StoreError>() {
        Ok(err) => ExactlyError::Store(err),
        Err(err) => ExactlyError::Store(StoreError::Backend(format!("{err:#}"))),
    }
}

/// True if `err` is an optimistic concurrency conflict, however it was wrapped.
pub(crate) fn is_conflict(err: &anyhow::Error) -> bool {
    if let Some(store) = err.downcast_ref::<StoreError>() {
        return store.is_conflict();
    }
    matches!(
        err.downcast_ref::<ExactlyError>(),
        Some(ExactlyError::Store(StoreError::Conflict { .. }))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_core_errors() {
        let in_flight = anyhow::Error::new(ExactlyError::OperationInProgress {
            actor: "p1".into(),
            op_id: "op-1".into(),
        });
        assert_eq!(classify(&in_flight), ErrorClass::InFlight);
        assert!(classify(&in_flight).is_retryable());

        let bad = anyhow::Error::new(ExactlyError::InvalidArgument("empty op id".into()));
        assert_eq!(classify(&bad), ErrorClass::InvalidRequest);

        let business = anyhow::anyhow!("insufficient funds");
        assert_eq!(classify(&business), ErrorClass::Failed);
    }

    #[test]
    fn conflict_detected_through_both_wrappers() {
        let raw = anyhow::Error::new(StoreError::Conflict { path: "a/b".into() });
        assert!(is_conflict(&raw));

        let wrapped = anyhow::Error::new(ExactlyError::Store(StoreError::Conflict {
            path: "a/b".into(),
        }));
        assert!(is_conflict(&wrapped));

        let other = anyhow::Error::new(StoreError::NotFound { path: "a/b".into() });
        assert!(!is_conflict(&other));
    }
}
