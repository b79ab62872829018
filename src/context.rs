//! Idempotency context and its phase state machine

use crate::key::validate_identifier;
use crate::logging::{
    LOG_EVENT_CONTEXT_DROPPED_UNCLOSED, LOG_EVENT_RELEASE_IDEMPOTENCY_LOCK_FAILED,
};
use crate::provider::Engine;
use crate::settings::validate_settings;
use crate::{IdempotencyError, Lock, Phase, PhaseBody, PhaseOutput, PropertyBag, Setting};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct PhaseState {
    current: Option<Arc<Phase>>,
    visited: HashSet<Box<str>>,
}

/// One execution attempt of an idempotent process.
///
/// Created by [`Provider::start`](crate::Provider::start) while holding the
/// process lock. Phases run through [`phase`](Self::phase); results of phases
/// completed by earlier attempts are replayed instead of executed again.
///
/// Call [`close`](Self::close) when done. Dropping an unclosed context closes
/// it and logs any failure.
pub struct Context {
    process_id: Box<str>,
    idempotency_key: Box<str>,
    settings: Vec<Setting>,
    recorded_final_phase: Option<Box<str>>,
    was_final_phase: AtomicBool,
    state: Mutex<PhaseState>,
    properties: PropertyBag,
    lock: Mutex<Option<Box<dyn Lock>>>,
    engine: Arc<Engine>,
    closed: AtomicBool,
    /// Interceptors whose `on_context_created` succeeded
    notified: AtomicUsize,
}

impl Context {
    pub(crate) fn new(
        engine: Arc<Engine>,
        process_id: &str,
        idempotency_key: &str,
        settings: Vec<Setting>,
        recorded_final_phase: Option<Box<str>>,
        lock: Box<dyn Lock>,
    ) -> Self {
        Self {
            process_id: process_id.into(),
            idempotency_key: idempotency_key.into(),
            settings,
            recorded_final_phase,
            was_final_phase: AtomicBool::new(false),
            state: Mutex::new(PhaseState::default()),
            properties: PropertyBag::new(),
            lock: Mutex::new(Some(lock)),
            engine,
            closed: AtomicBool::new(false),
            notified: AtomicUsize::new(0),
        }
    }

    /// Process kind this context executes
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Key identifying the attempt series
    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    /// Settings the context was started with; at most one per conflict class
    pub fn settings(&self) -> &[Setting] {
        &self.settings
    }

    /// Whether a final phase has completed in this context
    pub fn was_final_phase(&self) -> bool {
        self.was_final_phase.load(Ordering::Acquire)
    }

    /// Phase currently executing, if any
    pub fn current_phase(&self) -> Option<Arc<Phase>> {
        self.state().current.clone()
    }

    /// Context-scoped extension properties
    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    /// Final phase recorded by an earlier attempt of this process, if the
    /// store reported one when the context was started
    pub fn recorded_final_phase(&self) -> Option<&str> {
        self.recorded_final_phase.as_deref()
    }

    /// Start describing a phase.
    ///
    /// ```rust,ignore
    /// let user: User = context
    ///     .phase("create-user")
    ///     .final_phase()
    ///     .run(|| users.insert(&request))?;
    /// ```
    pub fn phase(&self, id: &str) -> PhaseBuilder<'_> {
        PhaseBuilder {
            context: self,
            id: id.into(),
            is_final: false,
            transactional: true,
            settings: Vec::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, PhaseState> {
        // Only plain data behind the lock; a poisoned guard is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter_phase(&self, phase: &Arc<Phase>) -> Result<(), IdempotencyError> {
        let mut state = self.state();
        if self.was_final_phase() {
            return Err(IdempotencyError::assertion(format!(
                "Process {}: You can not enter phase {}, because there was already a final phase.",
                self.process_id,
                phase.id()
            )));
        }
        if state.visited.contains(phase.id()) {
            return Err(IdempotencyError::assertion(format!(
                "Process {}: Duplicate phaseId: {}.",
                self.process_id,
                phase.id()
            )));
        }
        if let Some(current) = &state.current {
            return Err(IdempotencyError::assertion(format!(
                "Process {}: You can not enter phase {}, because you are already in phase {}.",
                self.process_id,
                phase.id(),
                current.id()
            )));
        }
        state.visited.insert(phase.id().into());
        state.current = Some(Arc::clone(phase));
        Ok(())
    }

    fn leave_phase(&self, phase: &Phase) {
        let mut state = self.state();
        if phase.is_final() {
            self.was_final_phase.store(true, Ordering::Release);
        }
        state.current = None;
    }

    fn run_phase<T, E, F>(&self, phase: Phase, body: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<IdempotencyError>,
        F: FnOnce() -> Result<T, E>,
    {
        validate_identifier("phaseId", phase.id())?;
        validate_settings(phase.id(), phase.settings())?;

        let phase = Arc::new(phase);
        self.enter_phase(&phase)?;
        let _active = ActivePhase {
            context: self,
            phase: &phase,
        };

        let mut fresh: Option<T> = None;
        let mut body_error: Option<E> = None;
        let erased: PhaseBody<'_> = Box::new(|| match body() {
            Ok(value) => {
                let data = serde_json::to_string(&value)?;
                fresh = Some(value);
                Ok(data)
            }
            Err(e) => {
                body_error = Some(e);
                Err(IdempotencyError::PhaseBody {
                    phase_id: phase.id().into(),
                })
            }
        });

        match self.engine.executor.execute(self, &phase, erased) {
            Ok(PhaseOutput::Executed(data)) => match fresh {
                Some(value) => Ok(value),
                None => Ok(serde_json::from_str(&data).map_err(IdempotencyError::from)?),
            },
            Ok(output) => Ok(serde_json::from_str(output.data()).map_err(IdempotencyError::from)?),
            Err(e) => match body_error {
                Some(caller_error) => Err(caller_error),
                None => Err(e.into()),
            },
        }
    }

    pub(crate) fn mark_notified(&self) {
        self.notified.fetch_add(1, Ordering::AcqRel);
    }

    /// Close the context.
    ///
    /// Runs `on_context_closed` of every interceptor in reverse registration
    /// order, then releases the process lock. Interceptor failures are
    /// collected into [`IdempotencyError::ContextClose`]; a failed lock
    /// release is only logged, the lock then expires on its own.
    pub fn close(self) -> Result<(), IdempotencyError> {
        self.close_once()
    }

    fn close_once(&self) -> Result<(), IdempotencyError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let notified = self.notified.load(Ordering::Acquire);
        let errors: Vec<IdempotencyError> = self.engine.interceptors[..notified]
            .iter()
            .rev()
            .filter_map(|interceptor| interceptor.on_context_closed(self).err())
            .collect();

        let lock = self.lock.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(lock) = lock {
            if let Err(e) = lock.release() {
                tracing::error!(
                    event = LOG_EVENT_RELEASE_IDEMPOTENCY_LOCK_FAILED,
                    process_id = %self.process_id,
                    idempotency_key = %self.idempotency_key,
                    error = %e,
                    "Idempotency: Attempt to release idempotency lock has failed. It will be released implicitly after specified timeout."
                );
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(IdempotencyError::ContextClose { errors })
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // A partially started context is dropped by `Provider::start` itself.
        if self.notified.load(Ordering::Acquire) == self.engine.interceptors.len() {
            tracing::warn!(
                event = LOG_EVENT_CONTEXT_DROPPED_UNCLOSED,
                process_id = %self.process_id,
                idempotency_key = %self.idempotency_key,
                "Idempotency: Context dropped without being closed"
            );
        }
        if let Err(e) = self.close_once() {
            tracing::error!(
                process_id = %self.process_id,
                idempotency_key = %self.idempotency_key,
                error = %e,
                "Idempotency: Closing dropped context failed"
            );
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("process_id", &self.process_id)
            .field("idempotency_key", &self.idempotency_key)
            .field("settings", &self.settings)
            .field("was_final_phase", &self.was_final_phase())
            .finish_non_exhaustive()
    }
}

/// Leaves the phase when the executor chain returns or unwinds
struct ActivePhase<'a> {
    context: &'a Context,
    phase: &'a Phase,
}

impl Drop for ActivePhase<'_> {
    fn drop(&mut self) {
        self.context.leave_phase(self.phase);
    }
}

/// Builder of a single phase invocation, see [`Context::phase`]
#[must_use = "a phase does nothing until `run` is called"]
pub struct PhaseBuilder<'c> {
    context: &'c Context,
    id: Box<str>,
    is_final: bool,
    transactional: bool,
    settings: Vec<Setting>,
}

impl PhaseBuilder<'_> {
    /// Mark the phase as the final phase of the process
    pub fn final_phase(self) -> Self {
        self.is_final(true)
    }

    /// Set whether the phase is final
    pub fn is_final(mut self, is_final: bool) -> Self {
        self.is_final = is_final;
        self
    }

    /// Run the body inside the store transaction that records its output (default)
    pub fn transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    /// Run the body outside any store transaction, e.g. for remote calls
    pub fn non_transactional(self) -> Self {
        self.transactional(false)
    }

    /// Attach a phase setting
    pub fn setting(mut self, setting: impl Into<Setting>) -> Self {
        self.settings.push(setting.into());
        self
    }

    /// Attach several phase settings
    pub fn settings(mut self, settings: impl IntoIterator<Item = Setting>) -> Self {
        self.settings.extend(settings);
        self
    }

    /// Execute the phase, or replay its recorded output.
    ///
    /// Errors of the body are returned unchanged and nothing is recorded, so
    /// a retry runs the body again. Engine failures reach the caller through
    /// `E: From<IdempotencyError>`.
    pub fn run<T, E, F>(self, body: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<IdempotencyError>,
        F: FnOnce() -> Result<T, E>,
    {
        let phase = Phase::new(self.id, self.is_final, self.transactional, self.settings);
        self.context.run_phase(phase, body)
    }
}
