//! Qualified keys and identifier validation

use crate::IdempotencyError;
use serde::{Deserialize, Serialize};

/// Record id reserved for the process-level lock
pub const PROCESS_LOCK_RECORD_ID: &str = "_PROCESS_LOCK";

/// Human readable form of the identifier grammar, used in error messages
pub const IDENTIFIER_GRAMMAR: &str = "[_a-zA-Z][-.a-zA-Z0-9_]*";

/// Address of a single idempotency record or lock.
///
/// `record_id` is a phase id, or [`PROCESS_LOCK_RECORD_ID`] for the lock
/// guarding the whole process instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedKey {
    /// Process kind
    pub process_id: Box<str>,
    /// Attempt series within the process kind
    pub idempotency_key: Box<str>,
    /// Phase id, or the process lock marker
    pub record_id: Box<str>,
}

impl QualifiedKey {
    /// Create a key for a phase record
    pub fn new(process_id: &str, idempotency_key: &str, record_id: &str) -> Self {
        Self {
            process_id: process_id.into(),
            idempotency_key: idempotency_key.into(),
            record_id: record_id.into(),
        }
    }

    /// Create the key of the process-level lock
    pub fn process_lock(process_id: &str, idempotency_key: &str) -> Self {
        Self::new(process_id, idempotency_key, PROCESS_LOCK_RECORD_ID)
    }

    /// Whether this key addresses the process-level lock
    pub fn is_process_lock(&self) -> bool {
        &*self.record_id == PROCESS_LOCK_RECORD_ID
    }

    /// Whether both keys belong to the same process instance
    pub fn same_process(&self, process_id: &str, idempotency_key: &str) -> bool {
        &*self.process_id == process_id && &*self.idempotency_key == idempotency_key
    }
}

impl std::fmt::Display for QualifiedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.process_id, self.idempotency_key, self.record_id)
    }
}

/// Check `id` against the identifier grammar.
///
/// Identifiers start with an ASCII letter or underscore, followed by ASCII
/// letters, digits, `-`, `.` or `_`. Identifiers starting with an underscore
/// are reserved for this crate.
pub fn is_valid_identifier(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
}

/// Validate an identifier, failing with an assertion error naming its `kind`
pub fn validate_identifier(kind: &str, id: &str) -> Result<(), IdempotencyError> {
    if is_valid_identifier(id) {
        Ok(())
    } else {
        Err(IdempotencyError::Assertion(
            format!("Invalid identifier {kind}: {id:?}. Must match {IDENTIFIER_GRAMMAR}.").into(),
        ))
    }
}
