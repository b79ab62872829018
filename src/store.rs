//! Phase result storage trait

use crate::{IdempotencyError, QualifiedKey, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Stored output of a completed phase
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Serialized phase output
    pub data: String,
    /// Whether the phase was the final phase of its process
    pub is_final: bool,
    /// Commit time of the record
    pub created_at: DateTime<Utc>,
}

/// Operations available inside [`StoreAdapter::execute_in_transaction`]
pub trait TransactionOps {
    /// Create a record for `key`.
    ///
    /// If a record already exists this call may succeed, but then the
    /// surrounding transaction must fail with an error recognised by
    /// [`StoreAdapter::may_be_duplicate_record_error`].
    fn insert(&mut self, key: &QualifiedKey, data: &str, is_final: bool) -> Result<(), StoreError>;
}

/// Work executed inside a store transaction
pub type TransactionBody<'a> =
    Box<dyn FnOnce(&mut dyn TransactionOps) -> Result<(), IdempotencyError> + 'a>;

/// Result storage trait
pub trait StoreAdapter: Send + Sync + 'static {
    /// Record stored for `key`. Callable both inside and outside a transaction.
    fn get(&self, key: &QualifiedKey) -> Result<Option<StoredRecord>, StoreError>;

    /// Run `body` in a transaction; every write is discarded if `body` fails
    fn execute_in_transaction(&self, body: TransactionBody<'_>) -> Result<(), IdempotencyError>;

    /// Whether an error from [`execute_in_transaction`](Self::execute_in_transaction)
    /// may have been caused by a duplicate insert
    fn may_be_duplicate_record_error(&self, error: &IdempotencyError) -> bool {
        matches!(error, IdempotencyError::Store(e) if e.is_duplicate_record())
    }

    /// Record id of the final phase already stored for a process instance.
    ///
    /// Stores that cannot answer keep the default; contexts then only learn
    /// about a recorded final phase when it is replayed.
    fn find_final_record(
        &self,
        _process_id: &str,
        _idempotency_key: &str,
    ) -> Result<Option<Box<str>>, StoreError> {
        Ok(None)
    }
}

type RecordTable = Arc<RwLock<BTreeMap<QualifiedKey, StoredRecord>>>;

/// In-memory result store for tests and single-process deployments.
///
/// Inserts are buffered per transaction and applied on commit, so two
/// concurrent transactions for the same key both run their bodies and the
/// later commit fails with [`StoreError::DuplicateRecord`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    pub(crate) data: RecordTable,
}

impl InMemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an existing record, replacing any record for the same key
    pub fn import(&self, key: QualifiedKey, record: StoredRecord) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(|e| StoreError::Storage(e.to_string().into()))?;
        data.insert(key, record);
        Ok(())
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    /// Whether no record is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of all records of a process instance, in key order
    pub fn keys_of(&self, process_id: &str, idempotency_key: &str) -> Vec<QualifiedKey> {
        self.data
            .read()
            .map(|d| {
                d.keys()
                    .filter(|k| k.same_process(process_id, idempotency_key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct PendingInserts<'a> {
    committed: &'a RecordTable,
    pending: Vec<(QualifiedKey, StoredRecord)>,
}

impl TransactionOps for PendingInserts<'_> {
    fn insert(&mut self, key: &QualifiedKey, data: &str, is_final: bool) -> Result<(), StoreError> {
        let exists = self
            .committed
            .read()
            .map_err(|e| StoreError::Storage(e.to_string().into()))?
            .contains_key(key);
        if exists || self.pending.iter().any(|(k, _)| k == key) {
            return Err(StoreError::DuplicateRecord(key.clone()));
        }
        self.pending.push((
            key.clone(),
            StoredRecord {
                data: data.to_owned(),
                is_final,
                created_at: Utc::now(),
            },
        ));
        Ok(())
    }
}

impl StoreAdapter for InMemoryStore {
    fn get(&self, key: &QualifiedKey) -> Result<Option<StoredRecord>, StoreError> {
        let data = self.data.read().map_err(|e| StoreError::Storage(e.to_string().into()))?;
        Ok(data.get(key).cloned())
    }

    fn execute_in_transaction(&self, body: TransactionBody<'_>) -> Result<(), IdempotencyError> {
        let mut ops = PendingInserts {
            committed: &self.data,
            pending: Vec::new(),
        };
        body(&mut ops)?;

        let mut data = self.data.write().map_err(|e| StoreError::Storage(e.to_string().into()))?;
        if let Some((key, _)) = ops.pending.iter().find(|(k, _)| data.contains_key(k)) {
            return Err(StoreError::DuplicateRecord(key.clone()).into());
        }
        data.extend(ops.pending);
        Ok(())
    }

    fn find_final_record(
        &self,
        process_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Box<str>>, StoreError> {
        let data = self.data.read().map_err(|e| StoreError::Storage(e.to_string().into()))?;
        Ok(data
            .iter()
            .find(|(k, r)| r.is_final && k.same_process(process_id, idempotency_key))
            .map(|(k, _)| k.record_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(record_id: &str) -> QualifiedKey {
        QualifiedKey::new("change-phone", "req-42", record_id)
    }

    #[test]
    fn test_insert_commits_with_transaction() {
        let store = InMemoryStore::new();
        store
            .execute_in_transaction(Box::new(|ops: &mut dyn TransactionOps| -> Result<(), IdempotencyError> {
                ops.insert(&key("validate"), r#"{"valid":true}"#, false)?;
                Ok(())
            }))
            .unwrap();

        let record = store.get(&key("validate")).unwrap().unwrap();
        assert_eq!(record.data, r#"{"valid":true}"#);
        assert!(!record.is_final);
    }

    #[test]
    fn test_failed_body_discards_inserts() {
        let store = InMemoryStore::new();
        let result = store.execute_in_transaction(Box::new(|ops: &mut dyn TransactionOps| -> Result<(), IdempotencyError> {
            ops.insert(&key("apply"), "null", true)?;
            Err(IdempotencyError::assertion("body failed"))
        }));
        assert!(result.is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_duplicate_insert_is_classified() {
        let store = InMemoryStore::new();
        let insert = |store: &InMemoryStore| {
            store.execute_in_transaction(Box::new(|ops: &mut dyn TransactionOps| -> Result<(), IdempotencyError> {
                ops.insert(&key("apply"), "1", false)?;
                Ok(())
            }))
        };
        insert(&store).unwrap();
        let err = insert(&store).unwrap_err();
        assert!(store.may_be_duplicate_record_error(&err));
        assert!(!store.may_be_duplicate_record_error(&IdempotencyError::assertion("x")));
    }

    #[test]
    fn test_find_final_record() {
        let store = InMemoryStore::new();
        assert_eq!(store.find_final_record("change-phone", "req-42").unwrap(), None);
        store
            .execute_in_transaction(Box::new(|ops: &mut dyn TransactionOps| -> Result<(), IdempotencyError> {
                ops.insert(&key("validate"), "true", false)?;
                ops.insert(&key("apply"), "true", true)?;
                Ok(())
            }))
            .unwrap();
        assert_eq!(
            store.find_final_record("change-phone", "req-42").unwrap().as_deref(),
            Some("apply")
        );
        assert_eq!(store.find_final_record("change-phone", "req-43").unwrap(), None);
        assert_eq!(store.keys_of("change-phone", "req-42").len(), 2);
    }
}
