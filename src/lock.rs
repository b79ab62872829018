//! Process lock storage trait

use crate::{LockError, QualifiedKey};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// Lock storage trait.
///
/// Prevents two executions of the same process instance from running at the
/// same time. A lock is temporal: once `timeout` elapses, another caller may
/// take it over even if it was never released.
pub trait LockAdapter: Send + Sync + 'static {
    /// Try to obtain the lock for `key`, valid until `now + timeout`
    fn obtain_lock(
        &self,
        key: &QualifiedKey,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<LockDecision, LockError>;
}

/// Held lock handle
pub trait Lock: Send + Sync {
    /// Key this lock guards
    fn key(&self) -> &QualifiedKey;

    /// Release the lock. Called at most once.
    fn release(self: Box<Self>) -> Result<(), LockError>;
}

/// Outcome of [`LockAdapter::obtain_lock`]
pub enum LockDecision {
    /// The caller now holds the lock
    Obtained(Box<dyn Lock>),
    /// Someone else holds the lock
    Locked {
        /// Expiry of the current holder's lock
        try_at: DateTime<Utc>,
    },
}

impl std::fmt::Debug for LockDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Obtained(lock) => f.debug_tuple("Obtained").field(lock.key()).finish(),
            Self::Locked { try_at } => f.debug_struct("Locked").field("try_at", try_at).finish(),
        }
    }
}

/// Expiry of a lock obtained at `now`, saturating on overflow
pub(crate) fn lock_deadline(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_add_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Clone, Debug)]
struct LockRecord {
    operation_id: Uuid,
    locked_until: DateTime<Utc>,
}

type LockTable = Arc<RwLock<HashMap<QualifiedKey, LockRecord>>>;

/// In-memory lock store for tests and single-process deployments
#[derive(Clone, Default)]
pub struct InMemoryLockAdapter {
    data: LockTable,
}

impl InMemoryLockAdapter {
    /// Empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Expiry of the current lock row for `key`, if any
    pub fn locked_until(&self, key: &QualifiedKey) -> Option<DateTime<Utc>> {
        let data = self.data.read().ok()?;
        data.get(key).map(|r| r.locked_until)
    }

    /// Number of lock rows, expired ones included
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    /// Whether the lock table has no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete lock rows that expired before `threshold`
    pub fn delete_expired_before(&self, threshold: DateTime<Utc>) -> Result<usize, LockError> {
        let mut data = self.data.write().map_err(|e| LockError::Storage(e.to_string().into()))?;
        let before = data.len();
        data.retain(|_, r| r.locked_until >= threshold);
        Ok(before - data.len())
    }
}

impl LockAdapter for InMemoryLockAdapter {
    fn obtain_lock(
        &self,
        key: &QualifiedKey,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<LockDecision, LockError> {
        let mut data = self.data.write().map_err(|e| LockError::Storage(e.to_string().into()))?;
        if let Some(existing) = data.get(key) {
            if existing.locked_until > now {
                return Ok(LockDecision::Locked {
                    try_at: existing.locked_until,
                });
            }
        }

        let operation_id = Uuid::new_v4();
        data.insert(
            key.clone(),
            LockRecord {
                operation_id,
                locked_until: lock_deadline(now, timeout),
            },
        );
        Ok(LockDecision::Obtained(Box::new(InMemoryLock {
            key: key.clone(),
            operation_id,
            data: Arc::clone(&self.data),
        })))
    }
}

struct InMemoryLock {
    key: QualifiedKey,
    operation_id: Uuid,
    data: LockTable,
}

impl Lock for InMemoryLock {
    fn key(&self) -> &QualifiedKey {
        &self.key
    }

    fn release(self: Box<Self>) -> Result<(), LockError> {
        let mut data = self.data.write().map_err(|e| LockError::Storage(e.to_string().into()))?;
        // A lock taken over after expiry belongs to someone else now.
        if data.get(&self.key).map(|r| r.operation_id) == Some(self.operation_id) {
            data.remove(&self.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> QualifiedKey {
        QualifiedKey::process_lock("change-phone", "req-42")
    }

    fn obtained(decision: LockDecision) -> Box<dyn Lock> {
        match decision {
            LockDecision::Obtained(lock) => lock,
            other => panic!("expected lock, got {other:?}"),
        }
    }

    #[test]
    fn test_second_caller_is_locked_until_expiry() {
        let adapter = InMemoryLockAdapter::new();
        let now = Utc::now();
        let _lock = obtained(adapter.obtain_lock(&key(), Duration::from_secs(5), now).unwrap());

        match adapter.obtain_lock(&key(), Duration::from_secs(5), now).unwrap() {
            LockDecision::Locked { try_at } => {
                assert_eq!(try_at, now + chrono::Duration::seconds(5))
            }
            other => panic!("expected Locked, got {other:?}"),
        }

        let later = now + chrono::Duration::seconds(6);
        obtained(adapter.obtain_lock(&key(), Duration::from_secs(5), later).unwrap());
    }

    #[test]
    fn test_release_allows_immediate_retry() {
        let adapter = InMemoryLockAdapter::new();
        let now = Utc::now();
        let lock = obtained(adapter.obtain_lock(&key(), Duration::from_secs(60), now).unwrap());
        lock.release().unwrap();
        assert!(adapter.is_empty());
        obtained(adapter.obtain_lock(&key(), Duration::from_secs(60), now).unwrap());
    }

    #[test]
    fn test_stale_holder_does_not_release_new_lock() {
        let adapter = InMemoryLockAdapter::new();
        let now = Utc::now();
        let stale = obtained(adapter.obtain_lock(&key(), Duration::from_secs(1), now).unwrap());
        let later = now + chrono::Duration::seconds(2);
        let _fresh = obtained(adapter.obtain_lock(&key(), Duration::from_secs(60), later).unwrap());

        stale.release().unwrap();
        assert_eq!(
            adapter.locked_until(&key()),
            Some(later + chrono::Duration::seconds(60))
        );
    }

    #[test]
    fn test_delete_expired_locks() {
        let adapter = InMemoryLockAdapter::new();
        let now = Utc::now();
        let other = QualifiedKey::process_lock("change-phone", "req-43");
        obtained(adapter.obtain_lock(&key(), Duration::from_secs(1), now).unwrap());
        obtained(adapter.obtain_lock(&other, Duration::from_secs(600), now).unwrap());

        let removed = adapter
            .delete_expired_before(now + chrono::Duration::seconds(10))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(adapter.locked_until(&other).is_some());
    }
}
