//! Durable store and lock adapters on LMDB
//!
//! Records and locks live in named databases of one environment. Keys are
//! `<len>:<process_id><len>:<idempotency_key><record_id>`, values are JSON.
//! The length prefixes keep instances apart even when an idempotency key
//! contains separator characters. A third database indexes records by
//! creation time for retention cleanup.
//!
//! LMDB serialises writers, so a transactional phase body holds the
//! environment's write lock while it runs. Keep such bodies short, or mark
//! slow phases non-transactional.

use crate::cleanup::RetentionStore;
use crate::lock::lock_deadline;
use crate::logging::LOG_EVENT_UNABLE_OBTAIN_LOCK;
use crate::{
    IdempotencyError, Lock, LockAdapter, LockDecision, LockError, LmdbConfig, QualifiedKey,
    StoreAdapter, StoreError, StoredRecord, TransactionBody, TransactionOps,
};
use chrono::{DateTime, SecondsFormat, Utc};
use heed::types::Str;
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use serde::{Deserialize, Serialize};
use std::ops::Bound;
use std::time::Duration;
use uuid::Uuid;

const RECORDS_DB: &str = "records";
const RECORDS_BY_CREATED_DB: &str = "records_by_created";
const LOCKS_DB: &str = "locks";
const INDEX_SEPARATOR: char = '\u{1f}';
const LOCK_ATTEMPTS: usize = 3;

fn process_prefix(process_id: &str, idempotency_key: &str) -> String {
    format!(
        "{}:{process_id}{}:{idempotency_key}",
        process_id.len(),
        idempotency_key.len()
    )
}

fn encode_key(key: &QualifiedKey) -> String {
    let mut encoded = process_prefix(&key.process_id, &key.idempotency_key);
    encoded.push_str(&key.record_id);
    encoded
}

/// Fixed-width RFC 3339, so lexicographic order is chronological
fn timestamp_key(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn index_key(created_at: DateTime<Utc>, record_key: &str) -> String {
    format!("{}{INDEX_SEPARATOR}{record_key}", timestamp_key(created_at))
}

fn index_created_at(index_key: &str) -> Result<DateTime<Utc>, StoreError> {
    let timestamp = index_key
        .split_once(INDEX_SEPARATOR)
        .map_or(index_key, |(timestamp, _)| timestamp);
    DateTime::parse_from_rfc3339(timestamp)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Storage(format!("bad creation index {index_key:?}: {e}").into()))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct LockRow {
    operation_id: Uuid,
    locked_until: DateTime<Utc>,
}

/// Store, lock adapter and retention store backed by one LMDB environment.
///
/// Clones share the environment; use one clone as the store and another as
/// the lock adapter of a [`Provider`](crate::Provider).
#[derive(Clone)]
pub struct LmdbIdempotencyStore {
    env: Env,
    records: Database<Str, Str>,
    by_created: Database<Str, Str>,
    locks: Database<Str, Str>,
}

impl LmdbIdempotencyStore {
    /// Open (or create) the environment at `config.path`
    pub fn open(config: &LmdbConfig) -> Result<Self, StoreError> {
        config
            .validate()
            .map_err(|e| StoreError::Storage(e.to_string().into()))?;
        std::fs::create_dir_all(&config.path)
            .map_err(|e| StoreError::Storage(format!("{}: {e}", config.path.display()).into()))?;

        // SAFETY: the environment is opened once per path within this process;
        // the memory map is only accessed through heed.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.map_size)
                .max_dbs(3)
                .max_readers(config.max_readers)
                .open(&config.path)?
        };

        let mut wtxn = env.write_txn()?;
        let records = env.create_database::<Str, Str>(&mut wtxn, Some(RECORDS_DB))?;
        let by_created = env.create_database::<Str, Str>(&mut wtxn, Some(RECORDS_BY_CREATED_DB))?;
        let locks = env.create_database::<Str, Str>(&mut wtxn, Some(LOCKS_DB))?;
        wtxn.commit()?;

        tracing::debug!(path = %config.path.display(), "Opened LMDB idempotency store");
        Ok(Self {
            env,
            records,
            by_created,
            locks,
        })
    }

    fn try_obtain_lock(
        &self,
        key: &str,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Result<Uuid, DateTime<Utc>>, LockError> {
        let mut wtxn = self.env.write_txn()?;
        if let Some(raw) = self.locks.get(&wtxn, key)? {
            let existing: LockRow = serde_json::from_str(raw)?;
            if existing.locked_until > now {
                return Ok(Err(existing.locked_until));
            }
        }

        let row = LockRow {
            operation_id: Uuid::new_v4(),
            locked_until: lock_deadline(now, timeout),
        };
        self.locks.put(&mut wtxn, key, &serde_json::to_string(&row)?)?;
        wtxn.commit()?;
        Ok(Ok(row.operation_id))
    }

    fn lock_row(&self, key: &str) -> Result<Option<LockRow>, LockError> {
        let rtxn = self.env.read_txn()?;
        match self.locks.get(&rtxn, key)? {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }
}

struct LmdbInserts<'t, 'e> {
    txn: &'t mut RwTxn<'e>,
    records: Database<Str, Str>,
    by_created: Database<Str, Str>,
}

impl TransactionOps for LmdbInserts<'_, '_> {
    fn insert(&mut self, key: &QualifiedKey, data: &str, is_final: bool) -> Result<(), StoreError> {
        let encoded = encode_key(key);
        if self.records.get(&*self.txn, &encoded)?.is_some() {
            return Err(StoreError::DuplicateRecord(key.clone()));
        }
        let record = StoredRecord {
            data: data.to_owned(),
            is_final,
            created_at: Utc::now(),
        };
        self.records
            .put(&mut *self.txn, &encoded, &serde_json::to_string(&record)?)?;
        self.by_created
            .put(&mut *self.txn, &index_key(record.created_at, &encoded), &encoded)?;
        Ok(())
    }
}

impl StoreAdapter for LmdbIdempotencyStore {
    fn get(&self, key: &QualifiedKey) -> Result<Option<StoredRecord>, StoreError> {
        let rtxn = self.env.read_txn()?;
        match self.records.get(&rtxn, &encode_key(key))? {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn execute_in_transaction(&self, body: TransactionBody<'_>) -> Result<(), IdempotencyError> {
        let mut wtxn = self.env.write_txn().map_err(StoreError::from)?;
        body(&mut LmdbInserts {
            txn: &mut wtxn,
            records: self.records,
            by_created: self.by_created,
        })?;
        wtxn.commit().map_err(StoreError::from)?;
        Ok(())
    }

    fn find_final_record(
        &self,
        process_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Box<str>>, StoreError> {
        let prefix = process_prefix(process_id, idempotency_key);
        let rtxn = self.env.read_txn()?;
        for entry in self.records.prefix_iter(&rtxn, &prefix)? {
            let (key, raw) = entry?;
            let record: StoredRecord = serde_json::from_str(raw)?;
            if record.is_final {
                return Ok(Some(key[prefix.len()..].into()));
            }
        }
        Ok(None)
    }
}

impl LockAdapter for LmdbIdempotencyStore {
    fn obtain_lock(
        &self,
        key: &QualifiedKey,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<LockDecision, LockError> {
        let encoded = encode_key(key);
        for _ in 0..LOCK_ATTEMPTS {
            let operation_id = match self.try_obtain_lock(&encoded, timeout, now)? {
                Ok(operation_id) => operation_id,
                Err(try_at) => return Ok(LockDecision::Locked { try_at }),
            };
            // Another environment user may have taken over between commit and read
            if self.lock_row(&encoded)?.map(|row| row.operation_id) == Some(operation_id) {
                return Ok(LockDecision::Obtained(Box::new(LmdbLock {
                    store: self.clone(),
                    key: key.clone(),
                    operation_id,
                })));
            }
        }

        tracing::warn!(
            event = LOG_EVENT_UNABLE_OBTAIN_LOCK,
            key = %key,
            attempts = LOCK_ATTEMPTS,
            "Idempotency: Unable to obtain lock"
        );
        Ok(LockDecision::Locked { try_at: now })
    }
}

struct LmdbLock {
    store: LmdbIdempotencyStore,
    key: QualifiedKey,
    operation_id: Uuid,
}

impl Lock for LmdbLock {
    fn key(&self) -> &QualifiedKey {
        &self.key
    }

    fn release(self: Box<Self>) -> Result<(), LockError> {
        let encoded = encode_key(&self.key);
        let mut wtxn = self.store.env.write_txn()?;
        let owned = match self.store.locks.get(&wtxn, &encoded)? {
            Some(raw) => serde_json::from_str::<LockRow>(raw)?.operation_id == self.operation_id,
            None => false,
        };
        if owned {
            self.store.locks.delete(&mut wtxn, &encoded)?;
        }
        wtxn.commit()?;
        Ok(())
    }
}

impl RetentionStore for LmdbIdempotencyStore {
    fn count_records(&self) -> Result<u64, IdempotencyError> {
        let rtxn = self.env.read_txn().map_err(StoreError::from)?;
        Ok(self.records.len(&rtxn).map_err(StoreError::from)?)
    }

    fn nth_oldest_created_at(&self, n: u64) -> Result<Option<DateTime<Utc>>, IdempotencyError> {
        let Some(index) = n.checked_sub(1).and_then(|i| usize::try_from(i).ok()) else {
            return Ok(None);
        };
        let rtxn = self.env.read_txn().map_err(StoreError::from)?;
        let result = match self.by_created.iter(&rtxn).map_err(StoreError::from)?.nth(index) {
            Some(entry) => {
                let (key, _) = entry.map_err(StoreError::from)?;
                Ok(Some(index_created_at(key)?))
            }
            None => Ok(None),
        };
        result
    }

    fn delete_records_created_before(
        &self,
        threshold: DateTime<Utc>,
        limit: u64,
    ) -> Result<u64, IdempotencyError> {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let bound = timestamp_key(threshold);
        let range = (Bound::Unbounded, Bound::Excluded(bound.as_str()));

        let mut wtxn = self.env.write_txn().map_err(StoreError::from)?;
        let mut due = Vec::new();
        for entry in self
            .by_created
            .range(&wtxn, &range)
            .map_err(StoreError::from)?
            .take(limit)
        {
            let (index_key, record_key) = entry.map_err(StoreError::from)?;
            due.push((index_key.to_owned(), record_key.to_owned()));
        }
        for (index_key, record_key) in &due {
            self.by_created.delete(&mut wtxn, index_key).map_err(StoreError::from)?;
            self.records.delete(&mut wtxn, record_key).map_err(StoreError::from)?;
        }
        wtxn.commit().map_err(StoreError::from)?;
        Ok(due.len() as u64)
    }

    fn delete_locks_expired_before(&self, threshold: DateTime<Utc>) -> Result<u64, IdempotencyError> {
        let mut wtxn = self.env.write_txn().map_err(LockError::from)?;
        let mut expired = Vec::new();
        for entry in self.locks.iter(&wtxn).map_err(LockError::from)? {
            let (key, raw) = entry.map_err(LockError::from)?;
            let row: LockRow = serde_json::from_str(raw).map_err(LockError::from)?;
            if row.locked_until < threshold {
                expired.push(key.to_owned());
            }
        }
        for key in &expired {
            self.locks.delete(&mut wtxn, key).map_err(LockError::from)?;
        }
        wtxn.commit().map_err(LockError::from)?;
        Ok(expired.len() as u64)
    }
}
