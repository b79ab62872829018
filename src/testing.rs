//! Test harness: tracing setup and scripted adapter stubs

use crate::{
    Context, IdempotencyError, Interceptor, Lock, LockAdapter, LockDecision, LockError, Phase,
    PhaseBody, PhaseExecutor, PhaseOutput, QualifiedKey, StoreAdapter, StoreError, StoredRecord,
    TransactionBody, TransactionOps,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Install a test-writer subscriber honouring `RUST_LOG`; idempotent
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Ordered log of interceptor calls shared by several [`RecordingInterceptor`]s
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(entry.into());
    }

    /// Entries in call order
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Interceptor writing `<name>.created`, `<name>.closed` and
/// `<name>.execute:<phase>` into a [`CallLog`]
pub struct RecordingInterceptor {
    name: &'static str,
    log: CallLog,
    fail_on_created: bool,
    fail_on_closed: bool,
}

impl RecordingInterceptor {
    /// Interceptor logging as `name` into `log`
    pub fn new(name: &'static str, log: &CallLog) -> Self {
        Self {
            name,
            log: log.clone(),
            fail_on_created: false,
            fail_on_closed: false,
        }
    }

    /// Fail `on_context_created` after logging it
    pub fn failing_on_created(mut self) -> Self {
        self.fail_on_created = true;
        self
    }

    /// Fail `on_context_closed` after logging it
    pub fn failing_on_closed(mut self) -> Self {
        self.fail_on_closed = true;
        self
    }
}

impl Interceptor for RecordingInterceptor {
    fn on_context_created(&self, _context: &Context) -> Result<(), IdempotencyError> {
        self.log.push(format!("{}.created", self.name));
        if self.fail_on_created {
            return Err(IdempotencyError::assertion(format!("{} refused to start", self.name)));
        }
        Ok(())
    }

    fn on_context_closed(&self, _context: &Context) -> Result<(), IdempotencyError> {
        self.log.push(format!("{}.closed", self.name));
        if self.fail_on_closed {
            return Err(IdempotencyError::assertion(format!("{} refused to close", self.name)));
        }
        Ok(())
    }

    fn wrap_phase_executor(&self, next: Arc<dyn PhaseExecutor>) -> Arc<dyn PhaseExecutor> {
        Arc::new(RecordingExecutor {
            name: self.name,
            log: self.log.clone(),
            next,
        })
    }
}

struct RecordingExecutor {
    name: &'static str,
    log: CallLog,
    next: Arc<dyn PhaseExecutor>,
}

impl PhaseExecutor for RecordingExecutor {
    fn execute(
        &self,
        context: &Context,
        phase: &Phase,
        body: PhaseBody<'_>,
    ) -> Result<PhaseOutput, IdempotencyError> {
        self.log.push(format!("{}.execute:{}", self.name, phase.id()));
        self.next.execute(context, phase, body)
    }
}

#[derive(Default)]
struct StubLockCounters {
    calls: AtomicUsize,
    releases: AtomicUsize,
}

/// Lock adapter answering every request the same way
#[derive(Clone)]
pub struct StubLockAdapter {
    locked_until: Option<DateTime<Utc>>,
    release_fails: bool,
    counters: Arc<StubLockCounters>,
}

impl StubLockAdapter {
    /// Always obtains the lock, even for keys already held
    pub fn granting() -> Self {
        Self {
            locked_until: None,
            release_fails: false,
            counters: Arc::default(),
        }
    }

    /// Always reports the lock as held until `try_at`
    pub fn locked_until(try_at: DateTime<Utc>) -> Self {
        Self {
            locked_until: Some(try_at),
            ..Self::granting()
        }
    }

    /// Make every release of an obtained lock fail
    pub fn failing_release(mut self) -> Self {
        self.release_fails = true;
        self
    }

    /// Number of `obtain_lock` calls
    pub fn calls(&self) -> usize {
        self.counters.calls.load(Ordering::SeqCst)
    }

    /// Number of release attempts
    pub fn releases(&self) -> usize {
        self.counters.releases.load(Ordering::SeqCst)
    }
}

impl LockAdapter for StubLockAdapter {
    fn obtain_lock(
        &self,
        key: &QualifiedKey,
        _timeout: Duration,
        _now: DateTime<Utc>,
    ) -> Result<LockDecision, LockError> {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
        Ok(match self.locked_until {
            Some(try_at) => LockDecision::Locked { try_at },
            None => LockDecision::Obtained(Box::new(StubLock {
                key: key.clone(),
                release_fails: self.release_fails,
                counters: Arc::clone(&self.counters),
            })),
        })
    }
}

struct StubLock {
    key: QualifiedKey,
    release_fails: bool,
    counters: Arc<StubLockCounters>,
}

impl Lock for StubLock {
    fn key(&self) -> &QualifiedKey {
        &self.key
    }

    fn release(self: Box<Self>) -> Result<(), LockError> {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
        if self.release_fails {
            return Err(LockError::Storage("lock table unavailable".into()));
        }
        Ok(())
    }
}

/// Store simulating a concurrent execution that always wins.
///
/// The first read of a key finds nothing, every insert fails as a duplicate
/// and later reads return the winner's data.
#[derive(Clone)]
pub struct ConcurrentWinnerStore {
    winner: Arc<str>,
    seen: Arc<Mutex<HashSet<QualifiedKey>>>,
    reads: Arc<AtomicUsize>,
    inserts: Arc<AtomicUsize>,
}

impl ConcurrentWinnerStore {
    /// Store whose concurrent winner recorded `winner_data`
    pub fn new(winner_data: &str) -> Self {
        Self {
            winner: winner_data.into(),
            seen: Arc::default(),
            reads: Arc::default(),
            inserts: Arc::default(),
        }
    }

    /// Number of record lookups
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of attempted inserts
    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }
}

struct LosingInserts<'a> {
    inserts: &'a AtomicUsize,
}

impl TransactionOps for LosingInserts<'_> {
    fn insert(&mut self, key: &QualifiedKey, _data: &str, _is_final: bool) -> Result<(), StoreError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::DuplicateRecord(key.clone()))
    }
}

impl StoreAdapter for ConcurrentWinnerStore {
    fn get(&self, key: &QualifiedKey) -> Result<Option<StoredRecord>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let first_read = self
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone());
        if first_read {
            return Ok(None);
        }
        Ok(Some(StoredRecord {
            data: self.winner.to_string(),
            is_final: false,
            created_at: Utc::now(),
        }))
    }

    fn execute_in_transaction(&self, body: TransactionBody<'_>) -> Result<(), IdempotencyError> {
        body(&mut LosingInserts {
            inserts: &self.inserts,
        })
    }
}
