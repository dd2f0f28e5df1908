//! Actor and operation identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ExactlyError;

/// Longest accepted identifier, in bytes.
pub const MAX_ID_LEN: usize = 512;

fn validate_id(kind: &str, raw: &str) -> Result<(), ExactlyError> {
    if raw.is_empty() {
        return Err(ExactlyError::InvalidArgument(format!("{kind} must not be empty")));
    }
    if raw.len() > MAX_ID_LEN {
        return Err(ExactlyError::InvalidArgument(format!(
            "{kind} exceeds {MAX_ID_LEN} bytes"
        )));
    }
    if raw.contains('/') || raw == "." || raw == ".." {
        return Err(ExactlyError::InvalidArgument(format!(
            "{kind} {raw:?} is not a valid document id"
        )));
    }
    Ok(())
}

/// The player or account an operation is performed on behalf of.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActorId(Box<str>);

impl ActorId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ExactlyError> {
        let raw = raw.into();
        validate_id("actor id", &raw)?;
        Ok(Self(raw.into_boxed_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ActorId {
    type Error = ExactlyError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<ActorId> for String {
    fn from(id: ActorId) -> Self {
        id.0.into()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied idempotency key, unique per actor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperationId(Box<str>);

impl OperationId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ExactlyError> {
        let raw = raw.into();
        validate_id("operation id", &raw)?;
        Ok(Self(raw.into_boxed_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OperationId {
    type Error = ExactlyError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<OperationId> for String {
    fn from(id: OperationId) -> Self {
        id.0.into()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one receipt: `(actor, op_id)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OperationKey {
    actor: ActorId,
    op_id: OperationId,
}

impl OperationKey {
    /// Validate both identifiers. Rejected keys never produce a receipt.
    pub fn new(actor: impl Into<String>, op_id: impl Into<String>) -> Result<Self, ExactlyError> {
        Ok(Self {
            actor: ActorId::new(actor)?,
            op_id: OperationId::new(op_id)?,
        })
    }

    pub fn from_parts(actor: ActorId, op_id: OperationId) -> Self {
        Self { actor, op_id }
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn op_id(&self) -> &OperationId {
        &self.op_id
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.actor, self.op_id)
    }
}
