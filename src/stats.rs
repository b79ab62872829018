//! Provider statistics

use crate::{Context, IdempotencyError, Interceptor, Phase, PhaseBody, PhaseExecutor, PhaseOutput};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-provider statistics
pub struct ProviderStats {
    /// Contexts that finished `on_context_created`
    pub contexts_created: AtomicU64,
    /// Contexts closed
    pub contexts_closed: AtomicU64,
    /// Phases that reached the executor chain
    pub phases_started: AtomicU64,
    /// Phase bodies that ran and were recorded
    pub phases_executed: AtomicU64,
    /// Outputs served from the store without running the body
    pub phases_replayed: AtomicU64,
    /// Bodies that lost the insert race to a concurrent execution
    pub phases_raced: AtomicU64,
    /// Phases that returned an error
    pub phases_failed: AtomicU64,
}

impl ProviderStats {
    /// Zeroed counters
    pub fn new() -> Self {
        Self {
            contexts_created: AtomicU64::new(0),
            contexts_closed: AtomicU64::new(0),
            phases_started: AtomicU64::new(0),
            phases_executed: AtomicU64::new(0),
            phases_replayed: AtomicU64::new(0),
            phases_raced: AtomicU64::new(0),
            phases_failed: AtomicU64::new(0),
        }
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> ProviderStatsSnapshot {
        ProviderStatsSnapshot {
            contexts_created: self.contexts_created.load(Ordering::Relaxed),
            contexts_closed: self.contexts_closed.load(Ordering::Relaxed),
            phases_started: self.phases_started.load(Ordering::Relaxed),
            phases_executed: self.phases_executed.load(Ordering::Relaxed),
            phases_replayed: self.phases_replayed.load(Ordering::Relaxed),
            phases_raced: self.phases_raced.load(Ordering::Relaxed),
            phases_failed: self.phases_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for ProviderStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain copy of [`ProviderStats`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderStatsSnapshot {
    /// See [`ProviderStats::contexts_created`]
    pub contexts_created: u64,
    /// See [`ProviderStats::contexts_closed`]
    pub contexts_closed: u64,
    /// See [`ProviderStats::phases_started`]
    pub phases_started: u64,
    /// See [`ProviderStats::phases_executed`]
    pub phases_executed: u64,
    /// Outputs served from the store without running the body
    pub phases_replayed: u64,
    /// Bodies that ran but lost the insert race to a concurrent execution
    pub phases_raced: u64,
    /// See [`ProviderStats::phases_failed`]
    pub phases_failed: u64,
}

/// Interceptor counting contexts and phase outcomes into [`ProviderStats`]
#[derive(Clone, Default)]
pub struct StatsInterceptor {
    stats: Arc<ProviderStats>,
}

impl StatsInterceptor {
    /// Interceptor with its own zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters shared with every clone of this interceptor
    pub fn stats(&self) -> Arc<ProviderStats> {
        Arc::clone(&self.stats)
    }
}

impl Interceptor for StatsInterceptor {
    fn on_context_created(&self, _context: &Context) -> Result<(), IdempotencyError> {
        self.stats.contexts_created.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn on_context_closed(&self, _context: &Context) -> Result<(), IdempotencyError> {
        self.stats.contexts_closed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn wrap_phase_executor(&self, next: Arc<dyn PhaseExecutor>) -> Arc<dyn PhaseExecutor> {
        Arc::new(StatsExecutor {
            stats: Arc::clone(&self.stats),
            next,
        })
    }
}

struct StatsExecutor {
    stats: Arc<ProviderStats>,
    next: Arc<dyn PhaseExecutor>,
}

impl PhaseExecutor for StatsExecutor {
    fn execute(
        &self,
        context: &Context,
        phase: &Phase,
        body: PhaseBody<'_>,
    ) -> Result<PhaseOutput, IdempotencyError> {
        self.stats.phases_started.fetch_add(1, Ordering::Relaxed);
        let result = self.next.execute(context, phase, body);
        let counter = match &result {
            Ok(PhaseOutput::Executed(_)) => &self.stats.phases_executed,
            Ok(PhaseOutput::Stored(_)) => &self.stats.phases_replayed,
            Ok(PhaseOutput::Concurrent(_)) => &self.stats.phases_raced,
            Err(_) => &self.stats.phases_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }
}
