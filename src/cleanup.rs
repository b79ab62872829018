//! Retention cleanup of old records and expired locks

use crate::logging::{
    LOG_EVENT_IDEMPOTENCY_CLEANUP_JOB_FAILED, LOG_EVENT_IDEMPOTENCY_CLEANUP_JOB_FINISHED,
    LOG_EVENT_IDEMPOTENCY_CLEANUP_JOB_STARTED, LOG_EVENT_IDEMPOTENCY_CLEANUP_MAX_RECORDS_REACHED,
    LOG_EVENT_IDEMPOTENCY_CLEANUP_RECORDS,
};
use crate::{CleanupConfig, IdempotencyError, InMemoryLockAdapter, InMemoryStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Storage operations needed by [`run_cleanup`]
pub trait RetentionStore {
    /// Number of stored phase records
    fn count_records(&self) -> Result<u64, IdempotencyError>;

    /// Creation time of the `n`-th oldest record (1-based), if there are
    /// at least `n` records
    fn nth_oldest_created_at(&self, n: u64) -> Result<Option<DateTime<Utc>>, IdempotencyError>;

    /// Delete up to `limit` records created before `threshold`, oldest first;
    /// returns the number deleted
    fn delete_records_created_before(
        &self,
        threshold: DateTime<Utc>,
        limit: u64,
    ) -> Result<u64, IdempotencyError>;

    /// Delete locks that expired before `threshold`; returns the number deleted
    fn delete_locks_expired_before(&self, threshold: DateTime<Utc>) -> Result<u64, IdempotencyError>;
}

/// Outcome of one cleanup run
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Records and locks older than this were removed; `None` when the
    /// store held no records
    pub threshold: Option<DateTime<Utc>>,
    /// Records deleted by this run
    pub removed_records: u64,
    /// Expired locks deleted by this run
    pub removed_locks: u64,
    /// The threshold was moved back to respect `max_records_to_remove`
    pub max_records_reached: bool,
}

impl CleanupReport {
    /// Human readable summary
    pub fn details(&self) -> String {
        match self.threshold {
            None => "No idempotency records to clean".to_string(),
            Some(threshold) => format!(
                "Removed {} idempotency records and {} locks (with createdAt/lockedUntil before {})",
                self.removed_records, self.removed_locks, threshold
            ),
        }
    }
}

/// Remove records older than the retention period, and expired locks.
///
/// One run removes at most `max_records_to_remove` records: when more
/// records are due, the threshold moves back to the creation time of the
/// `(max_records_to_remove + 1)`-th oldest record.
pub fn run_cleanup(
    store: &dyn RetentionStore,
    config: &CleanupConfig,
    now: DateTime<Utc>,
) -> Result<CleanupReport, IdempotencyError> {
    config.validate()?;
    if store.count_records()? == 0 {
        tracing::info!(
            event = LOG_EVENT_IDEMPOTENCY_CLEANUP_JOB_FINISHED,
            "No idempotency records to clean"
        );
        return Ok(CleanupReport {
            threshold: None,
            removed_records: 0,
            removed_locks: 0,
            max_records_reached: false,
        });
    }

    clean(store, config, now).map_err(|e| {
        tracing::error!(
            event = LOG_EVENT_IDEMPOTENCY_CLEANUP_JOB_FAILED,
            error = %e,
            "Failed to remove old idempotency records"
        );
        e
    })
}

fn clean(
    store: &dyn RetentionStore,
    config: &CleanupConfig,
    now: DateTime<Utc>,
) -> Result<CleanupReport, IdempotencyError> {
    let retention_threshold = now - config.retention();
    let (threshold, max_records_reached) =
        match store.nth_oldest_created_at(config.max_records_to_remove.saturating_add(1))? {
            Some(nth) if nth < retention_threshold => {
                tracing::warn!(
                    event = LOG_EVENT_IDEMPOTENCY_CLEANUP_MAX_RECORDS_REACHED,
                    max_records_to_remove = config.max_records_to_remove,
                    "Removing max records to remove in one cleanup run"
                );
                (nth, true)
            }
            _ => (retention_threshold, false),
        };

    tracing::info!(
        event = LOG_EVENT_IDEMPOTENCY_CLEANUP_JOB_STARTED,
        %threshold,
        "Removing old idempotency records"
    );

    let mut removed_records = 0;
    loop {
        let removed = store.delete_records_created_before(threshold, config.batch_size)?;
        removed_records += removed;
        tracing::debug!(
            event = LOG_EVENT_IDEMPOTENCY_CLEANUP_RECORDS,
            removed,
            batch_size = config.batch_size,
            "Removed batch of idempotency records"
        );
        if removed < config.batch_size {
            break;
        }
    }
    let removed_locks = store.delete_locks_expired_before(threshold)?;

    let report = CleanupReport {
        threshold: Some(threshold),
        removed_records,
        removed_locks,
        max_records_reached,
    };
    tracing::info!(
        event = LOG_EVENT_IDEMPOTENCY_CLEANUP_JOB_FINISHED,
        removed_records,
        removed_locks,
        "{}",
        report.details()
    );
    Ok(report)
}

/// [`RetentionStore`] over the in-memory adapters
#[derive(Clone, Default)]
pub struct InMemoryRetention {
    /// Records to clean
    pub store: InMemoryStore,
    /// Locks to clean
    pub locks: InMemoryLockAdapter,
}

impl InMemoryRetention {
    /// Clean `store` and `locks` together
    pub fn new(store: InMemoryStore, locks: InMemoryLockAdapter) -> Self {
        Self { store, locks }
    }
}

fn poisoned(e: impl std::fmt::Display) -> IdempotencyError {
    StoreError::Storage(e.to_string().into()).into()
}

impl RetentionStore for InMemoryRetention {
    fn count_records(&self) -> Result<u64, IdempotencyError> {
        Ok(self.store.len() as u64)
    }

    fn nth_oldest_created_at(&self, n: u64) -> Result<Option<DateTime<Utc>>, IdempotencyError> {
        let data = self.store.data.read().map_err(poisoned)?;
        let mut created: Vec<DateTime<Utc>> = data.values().map(|r| r.created_at).collect();
        created.sort_unstable();
        let index = usize::try_from(n.saturating_sub(1)).unwrap_or(usize::MAX);
        Ok(if n == 0 { None } else { created.get(index).copied() })
    }

    fn delete_records_created_before(
        &self,
        threshold: DateTime<Utc>,
        limit: u64,
    ) -> Result<u64, IdempotencyError> {
        let mut data = self.store.data.write().map_err(poisoned)?;
        let mut due: Vec<_> = data
            .iter()
            .filter(|(_, r)| r.created_at < threshold)
            .map(|(k, r)| (r.created_at, k.clone()))
            .collect();
        due.sort_unstable();
        due.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        for (_, key) in &due {
            data.remove(key);
        }
        Ok(due.len() as u64)
    }

    fn delete_locks_expired_before(&self, threshold: DateTime<Utc>) -> Result<u64, IdempotencyError> {
        Ok(self.locks.delete_expired_before(threshold)? as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LockAdapter, QualifiedKey, StoredRecord};
    use std::time::Duration;

    fn retention_with_records(ages_in_days: &[i64], now: DateTime<Utc>) -> InMemoryRetention {
        let retention = InMemoryRetention::default();
        for (i, age) in ages_in_days.iter().enumerate() {
            retention
                .store
                .import(
                    QualifiedKey::new("p", &format!("k{i}"), "phase"),
                    StoredRecord {
                        data: "null".into(),
                        is_final: true,
                        created_at: now - chrono::Duration::days(*age),
                    },
                )
                .unwrap();
        }
        retention
    }

    #[test]
    fn test_empty_store_has_nothing_to_do() {
        let report = run_cleanup(&InMemoryRetention::default(), &CleanupConfig::default(), Utc::now())
            .unwrap();
        assert_eq!(report.threshold, None);
        assert_eq!(report.details(), "No idempotency records to clean");
    }

    #[test]
    fn test_removes_records_past_retention_in_batches() {
        let now = Utc::now();
        let retention = retention_with_records(&[1, 29, 31, 40, 50, 60, 70], now);
        let config = CleanupConfig {
            batch_size: 2,
            ..CleanupConfig::default()
        };

        let report = run_cleanup(&retention, &config, now).unwrap();
        assert_eq!(report.removed_records, 5);
        assert!(!report.max_records_reached);
        assert_eq!(report.threshold, Some(now - chrono::Duration::days(30)));
        assert_eq!(retention.store.len(), 2);
    }

    #[test]
    fn test_max_records_caps_threshold() {
        let now = Utc::now();
        let retention = retention_with_records(&[31, 40, 50, 60, 70], now);
        let config = CleanupConfig {
            max_records_to_remove: 3,
            ..CleanupConfig::default()
        };

        let report = run_cleanup(&retention, &config, now).unwrap();
        assert!(report.max_records_reached);
        assert_eq!(report.threshold, Some(now - chrono::Duration::days(40)));
        assert_eq!(report.removed_records, 3);
        assert_eq!(retention.store.len(), 2);
    }

    #[test]
    fn test_expired_locks_are_removed() {
        let now = Utc::now();
        let retention = retention_with_records(&[90], now);
        let old = now - chrono::Duration::days(45);
        retention
            .locks
            .obtain_lock(&QualifiedKey::process_lock("p", "old"), Duration::from_secs(60), old)
            .unwrap();
        retention
            .locks
            .obtain_lock(&QualifiedKey::process_lock("p", "new"), Duration::from_secs(60), now)
            .unwrap();

        let report = run_cleanup(&retention, &CleanupConfig::default(), now).unwrap();
        assert_eq!(report.removed_locks, 1);
        assert_eq!(retention.locks.len(), 1);
    }
}
