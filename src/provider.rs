//! Entry point of the idempotency engine

use crate::executor::BasePhaseExecutor;
use crate::interceptor::compose_executor;
use crate::key::validate_identifier;
use crate::logging::LOG_EVENT_IDEMPOTENCY_PROCESS_LOCKED;
use crate::settings::validate_settings;
use crate::{
    Context, IdempotencyConfig, IdempotencyError, Interceptor, LockAdapter, LockDecision,
    PhaseExecutor, QualifiedKey, Setting, StoreAdapter,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Id of the final phase [`Provider::run_process`] adds when the body ran no final phase
pub const AUTO_FINAL_PHASE_ID: &str = "_autoFinal";

/// Shared state of a provider and every context it created
pub(crate) struct Engine {
    pub(crate) lock_adapter: Arc<dyn LockAdapter>,
    pub(crate) store: Arc<dyn StoreAdapter>,
    pub(crate) interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) executor: Arc<dyn PhaseExecutor>,
    pub(crate) config: IdempotencyConfig,
}

/// Starts idempotent processes.
///
/// Cheap to clone; all clones share adapters, interceptors and the composed
/// executor chain.
///
/// ```rust,ignore
/// let provider = Provider::builder(InMemoryLockAdapter::new(), InMemoryStore::new())
///     .interceptor(MonitoringInterceptor::new())
///     .build();
///
/// let phone = provider.run_process("req-42", "change-phone", Duration::from_secs(5), vec![], |ctx| {
///     ctx.phase("validate").run(|| validate(&request))?;
///     ctx.phase("apply").final_phase().run(|| apply(&request))
/// })?;
/// ```
#[derive(Clone)]
pub struct Provider {
    engine: Arc<Engine>,
}

impl Provider {
    /// Start building a provider on top of a lock store and a result store
    pub fn builder(
        lock_adapter: impl LockAdapter,
        store: impl StoreAdapter,
    ) -> ProviderBuilder {
        ProviderBuilder {
            lock_adapter: Arc::new(lock_adapter),
            store: Arc::new(store),
            interceptors: Vec::new(),
            config: IdempotencyConfig::default(),
        }
    }

    /// Configuration the provider was built with
    pub fn config(&self) -> &IdempotencyConfig {
        &self.engine.config
    }

    /// Result store the provider records phase outputs in
    pub fn store(&self) -> &Arc<dyn StoreAdapter> {
        &self.engine.store
    }

    /// Obtain the process lock and create a context.
    ///
    /// The caller owns the returned context and must close it. Prefer
    /// [`run_process`](Self::run_process), which closes it on every path.
    ///
    /// # Errors
    /// - [`IdempotencyError::Assertion`] for an invalid process id, an empty
    ///   idempotency key or conflicting settings; checked before the lock
    ///   store is touched
    /// - [`IdempotencyError::ProcessLocked`] when another execution holds the
    ///   lock; no context is created and no interceptor runs
    /// - the first error of an interceptor's `on_context_created`
    pub fn start(
        &self,
        idempotency_key: &str,
        process_id: &str,
        lock_timeout: Duration,
        settings: Vec<Setting>,
    ) -> Result<Context, IdempotencyError> {
        validate_identifier("processId", process_id)?;
        if idempotency_key.is_empty() {
            return Err(IdempotencyError::assertion(format!(
                "Process {process_id}: idempotency key must not be empty."
            )));
        }
        validate_settings(process_id, &settings)?;

        let key = QualifiedKey::process_lock(process_id, idempotency_key);
        let lock = match self.engine.lock_adapter.obtain_lock(&key, lock_timeout, Utc::now())? {
            LockDecision::Obtained(lock) => lock,
            LockDecision::Locked { try_at } => {
                tracing::info!(
                    event = LOG_EVENT_IDEMPOTENCY_PROCESS_LOCKED,
                    process_id,
                    idempotency_key,
                    %try_at,
                    "Idempotency: Process is locked by another execution"
                );
                return Err(IdempotencyError::ProcessLocked {
                    try_at,
                    process_id: process_id.into(),
                    idempotency_key: idempotency_key.into(),
                });
            }
        };

        // Release the lock if the store lookup fails.
        let recorded_final_phase = match self
            .engine
            .store
            .find_final_record(process_id, idempotency_key)
        {
            Ok(found) => found,
            Err(e) => {
                if let Err(release_error) = lock.release() {
                    tracing::warn!(
                        process_id,
                        idempotency_key,
                        error = %release_error,
                        "Idempotency: Releasing lock after failed start did not succeed"
                    );
                }
                return Err(e.into());
            }
        };

        let context = Context::new(
            Arc::clone(&self.engine),
            process_id,
            idempotency_key,
            settings,
            recorded_final_phase,
            lock,
        );
        for interceptor in &self.engine.interceptors {
            // On error the context drops here, closing the interceptors
            // notified so far and releasing the lock.
            interceptor.on_context_created(&context)?;
            context.mark_notified();
        }
        Ok(context)
    }

    /// Run `body` as one idempotent process.
    ///
    /// When the body succeeds without running a final phase, the empty final
    /// phase [`AUTO_FINAL_PHASE_ID`] is recorded. The context is closed on
    /// every path. A body error wins over a close error, which is then only
    /// logged.
    pub fn run_process<T, E, F>(
        &self,
        idempotency_key: &str,
        process_id: &str,
        lock_timeout: Duration,
        settings: Vec<Setting>,
        body: F,
    ) -> Result<T, E>
    where
        E: From<IdempotencyError>,
        F: FnOnce(&Context) -> Result<T, E>,
    {
        let context = self.start(idempotency_key, process_id, lock_timeout, settings)?;

        let result = body(&context).and_then(|output| {
            if !context.was_final_phase() {
                context
                    .phase(AUTO_FINAL_PHASE_ID)
                    .final_phase()
                    .run(|| Ok::<(), E>(()))?;
            }
            Ok(output)
        });

        match (result, context.close()) {
            (Ok(output), Ok(())) => Ok(output),
            (Ok(_), Err(close_error)) => Err(close_error.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_error)) => {
                tracing::error!(
                    process_id,
                    idempotency_key,
                    error = %close_error,
                    "Idempotency: Closing context after failed process body failed as well"
                );
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("interceptors", &self.engine.interceptors.len())
            .field("config", &self.engine.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Provider`]
pub struct ProviderBuilder {
    lock_adapter: Arc<dyn LockAdapter>,
    store: Arc<dyn StoreAdapter>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    config: IdempotencyConfig,
}

impl ProviderBuilder {
    /// Register an interceptor; the first registered one is outermost
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Register an interceptor that is shared with other owners
    pub fn shared_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Replace the default configuration
    pub fn config(mut self, config: IdempotencyConfig) -> Self {
        self.config = config;
        self
    }

    /// Compose the executor chain and build the provider
    pub fn build(self) -> Provider {
        let base: Arc<dyn PhaseExecutor> = Arc::new(BasePhaseExecutor::new(Arc::clone(&self.store)));
        let executor = compose_executor(base, &self.interceptors);
        Provider {
            engine: Arc::new(Engine {
                lock_adapter: self.lock_adapter,
                store: self.store,
                interceptors: self.interceptors,
                executor,
                config: self.config,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        init_test_tracing, CallLog, ConcurrentWinnerStore, RecordingInterceptor, StubLockAdapter,
    };
    use crate::{InMemoryLockAdapter, InMemoryStore, Phase, PhaseBody, PhaseOutput};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, Mutex};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Validation {
        valid: bool,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Applied {
        applied: bool,
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn in_memory() -> (Provider, InMemoryLockAdapter, InMemoryStore) {
        let locks = InMemoryLockAdapter::new();
        let store = InMemoryStore::new();
        let provider = Provider::builder(locks.clone(), store.clone()).build();
        (provider, locks, store)
    }

    #[test]
    fn test_phase_runs_at_most_once_across_contexts() {
        init_test_tracing();
        let (provider, _, _) = in_memory();
        let calls = AtomicUsize::new(0);
        let body = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, IdempotencyError>(Validation { valid: true })
        };

        let first = provider.start("req-42", "change-phone", TIMEOUT, vec![]).unwrap();
        let a = first.phase("validate").run(body).unwrap();
        first.close().unwrap();

        let second = provider.start("req-42", "change-phone", TIMEOUT, vec![]).unwrap();
        let b = second.phase("validate").run(body).unwrap();
        second.close().unwrap();

        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_example_scenario() {
        init_test_tracing();
        let (provider, locks, store) = in_memory();
        let executions = AtomicUsize::new(0);
        let run = |ctx: &Context| -> Result<(Validation, Applied), IdempotencyError> {
            let validation = ctx.phase("validate").run(|| {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok::<_, IdempotencyError>(Validation { valid: true })
            })?;
            let applied = ctx.phase("apply").final_phase().run(|| {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok::<_, IdempotencyError>(Applied { applied: true })
            })?;
            Ok((validation, applied))
        };

        let first = provider.start("req-42", "change-phone", TIMEOUT, vec![]).unwrap();
        let first_output = run(&first).unwrap();
        assert!(first.was_final_phase());
        first.close().unwrap();
        assert!(locks.is_empty());

        let second = provider.start("req-42", "change-phone", TIMEOUT, vec![]).unwrap();
        assert_eq!(second.recorded_final_phase(), Some("apply"));
        let second_output = run(&second).unwrap();
        assert_eq!(first_output, second_output);
        assert_eq!(executions.load(Ordering::SeqCst), 2);
        assert!(second.was_final_phase());

        let err = second
            .phase("notify")
            .run(|| Ok::<_, IdempotencyError>(()))
            .unwrap_err();
        assert!(err.is_assertion());
        second.close().unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_new_phase_rejected_when_final_phase_recorded_earlier() {
        let (provider, _, _) = in_memory();
        provider
            .run_process("req-42", "change-phone", TIMEOUT, vec![], |ctx| {
                ctx.phase("apply")
                    .final_phase()
                    .run(|| Ok::<_, IdempotencyError>(true))
            })
            .unwrap();

        let context = provider.start("req-42", "change-phone", TIMEOUT, vec![]).unwrap();
        let calls = AtomicUsize::new(0);
        let err = context
            .phase("extra")
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, IdempotencyError>(())
            })
            .unwrap_err();
        assert!(err.to_string().contains("final phase apply was already recorded"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // Replays of stored phases still work
        let replayed: bool = context
            .phase("apply")
            .final_phase()
            .run(|| Ok::<_, IdempotencyError>(false))
            .unwrap();
        assert!(replayed);
    }

    #[test]
    fn test_lock_contention_yields_typed_rejection_without_interceptors() {
        let try_at = Utc::now() + chrono::Duration::seconds(30);
        let log = CallLog::new();
        let provider = Provider::builder(StubLockAdapter::locked_until(try_at), InMemoryStore::new())
            .interceptor(RecordingInterceptor::new("A", &log))
            .build();

        let err = provider
            .start("req-42", "change-phone", TIMEOUT, vec![])
            .unwrap_err();
        match err {
            IdempotencyError::ProcessLocked {
                try_at: actual,
                process_id,
                idempotency_key,
            } => {
                assert_eq!(actual, try_at);
                assert_eq!(&*process_id, "change-phone");
                assert_eq!(&*idempotency_key, "req-42");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_held_lock_blocks_second_start() {
        let (provider, _, _) = in_memory();
        let first = provider.start("req-42", "change-phone", TIMEOUT, vec![]).unwrap();
        let err = provider
            .start("req-42", "change-phone", TIMEOUT, vec![])
            .unwrap_err();
        assert!(err.is_process_locked());
        assert!(err.is_retryable());

        // Other instances of the same process are independent
        provider.start("req-43", "change-phone", TIMEOUT, vec![]).unwrap().close().unwrap();
        first.close().unwrap();
        provider.start("req-42", "change-phone", TIMEOUT, vec![]).unwrap().close().unwrap();
    }

    #[test]
    fn test_race_resolved_with_winner_output() {
        let store = ConcurrentWinnerStore::new(r#"{"valid":false}"#);
        let provider = Provider::builder(StubLockAdapter::granting(), store.clone()).build();
        let context = provider.start("req-42", "change-phone", TIMEOUT, vec![]).unwrap();

        let output: Validation = context
            .phase("validate")
            .run(|| Ok::<_, IdempotencyError>(Validation { valid: true }))
            .unwrap();
        assert_eq!(output, Validation { valid: false });
        assert_eq!(store.inserts(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parallel_executions_observe_the_same_output() {
        init_test_tracing();
        let store = InMemoryStore::new();
        let provider = Provider::builder(StubLockAdapter::granting(), store.clone()).build();
        let barrier = Arc::new(Barrier::new(2));

        let spawn = |value: u32| {
            let provider = provider.clone();
            let barrier = Arc::clone(&barrier);
            tokio::task::spawn_blocking(move || -> Result<u32, IdempotencyError> {
                let context = provider.start("req-42", "transfer", TIMEOUT, vec![])?;
                let output = context.phase("debit").run(|| {
                    // Both bodies run before either insert commits
                    barrier.wait();
                    Ok::<_, IdempotencyError>(value)
                });
                context.close()?;
                output
            })
        };

        let (a, b) = tokio::join!(spawn(1), spawn(2));
        let a = a.unwrap().unwrap();
        let b = b.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_auto_final_on_success() {
        let (provider, _, store) = in_memory();
        let mut final_seen = false;
        let output = provider
            .run_process("req-42", "change-phone", TIMEOUT, vec![], |ctx| {
                let v = ctx.phase("validate").run(|| Ok::<_, IdempotencyError>(7))?;
                final_seen = ctx.was_final_phase();
                Ok::<_, IdempotencyError>(v)
            })
            .unwrap();
        assert_eq!(output, 7);
        assert!(!final_seen);

        let auto = store
            .get(&QualifiedKey::new("change-phone", "req-42", AUTO_FINAL_PHASE_ID))
            .unwrap()
            .unwrap();
        assert!(auto.is_final);
        assert_eq!(auto.data, "null");

        // A retry replays the stored auto-final phase
        provider
            .run_process("req-42", "change-phone", TIMEOUT, vec![], |ctx| {
                ctx.phase("validate").run(|| Ok::<_, IdempotencyError>(8))
            })
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_no_auto_final_after_explicit_final_phase() {
        let (provider, _, store) = in_memory();
        provider
            .run_process("req-42", "change-phone", TIMEOUT, vec![], |ctx| {
                ctx.phase("apply")
                    .final_phase()
                    .run(|| Ok::<_, IdempotencyError>(()))
            })
            .unwrap();
        assert_eq!(store.keys_of("change-phone", "req-42").len(), 1);
    }

    #[test]
    fn test_interceptor_hooks_reversed_on_close_even_if_body_fails() {
        let log = CallLog::new();
        let locks = InMemoryLockAdapter::new();
        let provider = Provider::builder(locks.clone(), InMemoryStore::new())
            .interceptor(RecordingInterceptor::new("A", &log))
            .interceptor(RecordingInterceptor::new("B", &log))
            .interceptor(RecordingInterceptor::new("C", &log))
            .build();

        let result: Result<(), IdempotencyError> =
            provider.run_process("req-42", "change-phone", TIMEOUT, vec![], |ctx| {
                ctx.phase("fails")
                    .run(|| Err::<(), _>(IdempotencyError::assertion("boom")))
            });
        assert!(result.unwrap_err().to_string().contains("boom"));
        assert_eq!(
            log.entries(),
            vec![
                "A.created", "B.created", "C.created", "A.execute:fails", "B.execute:fails",
                "C.execute:fails", "C.closed", "B.closed", "A.closed",
            ]
        );
        assert!(locks.is_empty());
    }

    #[test]
    fn test_close_errors_are_aggregated_and_lock_released() {
        let log = CallLog::new();
        let locks = InMemoryLockAdapter::new();
        let provider = Provider::builder(locks.clone(), InMemoryStore::new())
            .interceptor(RecordingInterceptor::new("A", &log).failing_on_closed())
            .interceptor(RecordingInterceptor::new("B", &log))
            .interceptor(RecordingInterceptor::new("C", &log).failing_on_closed())
            .build();

        let context = provider.start("req-42", "change-phone", TIMEOUT, vec![]).unwrap();
        match context.close() {
            Err(IdempotencyError::ContextClose { errors }) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].to_string().contains("C"));
                assert!(errors[1].to_string().contains("A"));
            }
            other => panic!("unexpected close result: {other:?}"),
        }
        assert_eq!(log.entries(), vec!["A.created", "B.created", "C.created", "C.closed", "B.closed", "A.closed"]);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_failed_interceptor_start_closes_notified_ones_and_releases_lock() {
        let log = CallLog::new();
        let locks = InMemoryLockAdapter::new();
        let provider = Provider::builder(locks.clone(), InMemoryStore::new())
            .interceptor(RecordingInterceptor::new("A", &log))
            .interceptor(RecordingInterceptor::new("B", &log).failing_on_created())
            .interceptor(RecordingInterceptor::new("C", &log))
            .build();

        let err = provider
            .start("req-42", "change-phone", TIMEOUT, vec![])
            .unwrap_err();
        assert!(err.to_string().contains("B"));
        assert_eq!(log.entries(), vec!["A.created", "B.created", "A.closed"]);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_lock_release_failure_is_not_an_error() {
        init_test_tracing();
        let lock = StubLockAdapter::granting().failing_release();
        let provider = Provider::builder(lock.clone(), InMemoryStore::new()).build();
        let context = provider.start("req-42", "change-phone", TIMEOUT, vec![]).unwrap();
        assert!(context.close().is_ok());
        assert_eq!(lock.releases(), 1);
    }

    #[test]
    fn test_identifiers_validated_before_lock_and_store() {
        let lock = StubLockAdapter::granting();
        let provider = Provider::builder(lock.clone(), InMemoryStore::new()).build();

        for process_id in ["1change", "change phone", "", "zmena-čísla"] {
            let err = provider.start("req-42", process_id, TIMEOUT, vec![]).unwrap_err();
            assert!(err.is_assertion(), "{process_id:?} should be rejected");
        }
        let err = provider.start("", "change-phone", TIMEOUT, vec![]).unwrap_err();
        assert!(err.is_assertion());

        let conflicting = vec![
            Setting::from(crate::PublishStrategy::InConsumer),
            Setting::from(crate::PublishStrategy::InFinalPhase),
        ];
        let err = provider
            .start("req-42", "change-phone", TIMEOUT, conflicting)
            .unwrap_err();
        assert!(err.is_assertion());
        assert_eq!(lock.calls(), 0);
    }

    struct ObservingExecutor(Arc<dyn PhaseExecutor>);

    impl PhaseExecutor for ObservingExecutor {
        fn execute(
            &self,
            context: &Context,
            phase: &Phase,
            body: PhaseBody<'_>,
        ) -> Result<PhaseOutput, IdempotencyError> {
            let seen = Mutex::new(None);
            let output = self.0.execute(
                context,
                phase,
                Box::new(|| {
                    let data = body()?;
                    *seen.lock().unwrap() = Some(data.clone());
                    Ok(data)
                }),
            )?;
            assert_eq!(seen.into_inner().unwrap().is_some(), output.was_executed());
            Ok(output)
        }
    }

    struct Observing;

    impl Interceptor for Observing {
        fn wrap_phase_executor(&self, next: Arc<dyn PhaseExecutor>) -> Arc<dyn PhaseExecutor> {
            Arc::new(ObservingExecutor(next))
        }
    }

    #[test]
    fn test_wrapper_observes_body_and_output() {
        let store = InMemoryStore::new();
        let provider = Provider::builder(InMemoryLockAdapter::new(), store.clone())
            .interceptor(Observing)
            .build();
        let run = || {
            provider.run_process("req-1", "wrapped", TIMEOUT, vec![], |ctx| {
                ctx.phase("step").run(|| Ok::<_, IdempotencyError>("out".to_string()))
            })
        };
        assert_eq!(run().unwrap(), "out");
        assert_eq!(run().unwrap(), "out");
    }
}
