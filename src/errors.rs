//! Error types for idempotent process execution

use crate::QualifiedKey;
use chrono::{DateTime, Utc};

/// Error code for unexpected server side failures
pub const ERR_SYS_SERVER_ERROR: &str = "ERR_SYS_001";
/// Error code for [`IdempotencyError::ProcessLocked`]
pub const ERR_SYS_IDEMPOTENT_PROCESS_LOCKED: &str = "ERR_SYS_011";
/// Error code for [`IdempotencyError::InputConflict`]
pub const ERR_SYS_IDEMPOTENT_INPUT_DOES_NOT_MATCH: &str = "ERR_SYS_012";
/// Error code for [`IdempotencyError::Assertion`]
pub const ERR_SYS_IDEMPOTENCY_ASSERTION_ERROR: &str = "ERR_SYS_013";
/// Error code for [`IdempotencyError::MissingIdempotencyKey`]
pub const ERR_SYS_IDEMPOTENCY_KEY_MISSING: &str = "ERR_SYS_014";
/// Error code for [`PublishError::TombstoneToNonSnapshotTopic`]
pub const ERR_SYS_CANNOT_SEND_TOMBSTONE_TO_NOT_SNAPSHOT_TOPIC: &str = "ERR_SYS_016";

/// Main error type of the idempotency engine.
///
/// Variants fall into the classes transports care about:
/// - misuse of the API ([`Assertion`](Self::Assertion)), expected only in development,
/// - contention ([`ProcessLocked`](Self::ProcessLocked)), expected and retryable,
/// - conflicts with recorded history ([`InputConflict`](Self::InputConflict)),
/// - infrastructure failures (store, lock, serialization, publishing).
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    /// The idempotency API was used in an improper way
    #[error("Idempotency assertion failed: {0}")]
    Assertion(Box<str>),

    /// Another execution of the same process instance holds the lock
    #[error("There is an active lock of idempotent process {process_id}:{idempotency_key}. Retry at {try_at}")]
    ProcessLocked {
        /// Time when the lock expires
        try_at: DateTime<Utc>,
        /// Process kind
        process_id: Box<str>,
        /// Attempt series
        idempotency_key: Box<str>,
    },

    /// Inputs differ from the inputs recorded by a previous attempt
    #[error(
        "Some inputs of an idempotent operation differ from previously used inputs with the same idempotency key. Conflicting input ids: {}",
        .conflicting_input_ids.join(", ")
    )]
    InputConflict {
        /// Sorted ids of the conflicting inputs
        conflicting_input_ids: Vec<String>,
    },

    /// An inbound request carried no idempotency key
    #[error("Idempotency key not specified")]
    MissingIdempotencyKey,

    /// Phase output could not be serialized or deserialized
    #[error("Phase output serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Result store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Lock store failure
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Outbound message could not be published
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// The caller's phase body failed; the caller receives its own error instead
    #[error("Body of phase {phase_id} failed")]
    PhaseBody {
        /// Phase whose body failed
        phase_id: Box<str>,
    },

    /// One or more interceptors failed while the context was closing
    #[error("Exceptions occurred when closing idempotency context ({} errors)", .errors.len())]
    ContextClose {
        /// Collected interceptor errors, in the order they occurred
        errors: Vec<IdempotencyError>,
    },
}

impl IdempotencyError {
    /// Build an assertion error
    pub fn assertion(message: impl Into<Box<str>>) -> Self {
        Self::Assertion(message.into())
    }

    /// Check if this error signals API misuse
    pub fn is_assertion(&self) -> bool {
        matches!(self, Self::Assertion(_))
    }

    /// Check if this error signals lock contention
    pub fn is_process_locked(&self) -> bool {
        matches!(self, Self::ProcessLocked { .. })
    }

    /// Check if the caller should retry the whole process later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProcessLocked { .. } => true,
            Self::Store(e) => e.is_duplicate_record(),
            _ => false,
        }
    }

    /// Stable error code for transports
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Assertion(_) => ERR_SYS_IDEMPOTENCY_ASSERTION_ERROR,
            Self::ProcessLocked { .. } => ERR_SYS_IDEMPOTENT_PROCESS_LOCKED,
            Self::InputConflict { .. } => ERR_SYS_IDEMPOTENT_INPUT_DOES_NOT_MATCH,
            Self::MissingIdempotencyKey => ERR_SYS_IDEMPOTENCY_KEY_MISSING,
            Self::Publish(PublishError::TombstoneToNonSnapshotTopic { .. }) => {
                ERR_SYS_CANNOT_SEND_TOMBSTONE_TO_NOT_SNAPSHOT_TOPIC
            }
            _ => ERR_SYS_SERVER_ERROR,
        }
    }
}

/// Error from a [`StoreAdapter`](crate::StoreAdapter)
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A record for the key already exists
    #[error("Duplicate idempotency record: {0}")]
    DuplicateRecord(QualifiedKey),

    /// Backend failure
    #[error("Storage error: {0}")]
    Storage(Box<str>),

    /// Stored bytes could not be decoded
    #[error("Record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// LMDB failure
    #[cfg(feature = "lmdb")]
    #[error("LMDB error: {0}")]
    Lmdb(#[from] heed::Error),
}

impl StoreError {
    /// Check if this error was caused by a concurrent insert of the same key
    pub fn is_duplicate_record(&self) -> bool {
        matches!(self, Self::DuplicateRecord(_))
    }
}

/// Error from a [`LockAdapter`](crate::LockAdapter) or a held lock
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Backend failure
    #[error("Lock storage error: {0}")]
    Storage(Box<str>),

    /// Stored lock could not be decoded
    #[error("Lock encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// LMDB failure
    #[cfg(feature = "lmdb")]
    #[error("LMDB error: {0}")]
    Lmdb(#[from] heed::Error),
}

/// Error from publishing an outbound message
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Tombstones are only allowed on snapshot topics
    #[error("Cannot send tombstone to other than snapshot topic: {topic}")]
    TombstoneToNonSnapshotTopic {
        /// Offending topic
        topic: Box<str>,
    },

    /// The message sink failed
    #[error("Message sink error: {0}")]
    Sink(Box<str>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let locked = IdempotencyError::ProcessLocked {
            try_at: Utc::now(),
            process_id: "change-phone".into(),
            idempotency_key: "req-42".into(),
        };
        assert!(locked.is_retryable());
        assert!(locked.is_process_locked());
        assert_eq!(locked.error_code(), ERR_SYS_IDEMPOTENT_PROCESS_LOCKED);

        let misuse = IdempotencyError::assertion("Duplicate phaseId: validate.");
        assert!(misuse.is_assertion());
        assert!(!misuse.is_retryable());
        assert_eq!(misuse.error_code(), ERR_SYS_IDEMPOTENCY_ASSERTION_ERROR);

        let dup: IdempotencyError =
            StoreError::DuplicateRecord(QualifiedKey::new("p", "k", "r")).into();
        assert!(dup.is_retryable());
        assert_eq!(dup.error_code(), ERR_SYS_SERVER_ERROR);
    }

    #[test]
    fn test_input_conflict_message_lists_ids() {
        let err = IdempotencyError::InputConflict {
            conflicting_input_ids: vec!["amount".into(), "phone".into()],
        };
        assert!(err.to_string().ends_with("Conflicting input ids: amount, phone"));
        assert_eq!(err.error_code(), ERR_SYS_IDEMPOTENT_INPUT_DOES_NOT_MATCH);
    }

    #[test]
    fn test_tombstone_error_code() {
        let err: IdempotencyError = PublishError::TombstoneToNonSnapshotTopic {
            topic: "customer.events".into(),
        }
        .into();
        assert_eq!(err.error_code(), ERR_SYS_CANNOT_SEND_TOMBSTONE_TO_NOT_SNAPSHOT_TOPIC);
    }
}
