//! Lifecycle hooks around contexts and phases

use crate::{Context, IdempotencyError, PhaseExecutor};
use std::sync::Arc;

/// Cross-cutting extension of the idempotency engine.
///
/// Interceptors are registered on the [`ProviderBuilder`](crate::ProviderBuilder)
/// in order. Given interceptors A, B and C:
/// - `on_context_created` runs A, B, C,
/// - `on_context_closed` runs C, B, A,
/// - A's executor wrapper is outermost, the store-backed executor innermost.
///
/// ```rust,ignore
/// struct AuditTrail;
///
/// impl Interceptor for AuditTrail {
///     fn on_context_created(&self, context: &Context) -> Result<(), IdempotencyError> {
///         audit_log(context.process_id(), context.idempotency_key());
///         Ok(())
///     }
/// }
/// ```
pub trait Interceptor: Send + Sync + 'static {
    /// Invoked every time a new context is created.
    ///
    /// An error aborts the start of the process; interceptors that already
    /// ran get their `on_context_closed` hook.
    fn on_context_created(&self, _context: &Context) -> Result<(), IdempotencyError> {
        Ok(())
    }

    /// Invoked every time a context is closed.
    ///
    /// Errors do not stop the remaining interceptors; they are collected into
    /// [`IdempotencyError::ContextClose`].
    fn on_context_closed(&self, _context: &Context) -> Result<(), IdempotencyError> {
        Ok(())
    }

    /// Invoked once per provider to extend phase execution.
    ///
    /// The returned executor must call `next` at most once. It may wrap the
    /// body and observe the output, but must not change the phase.
    fn wrap_phase_executor(&self, next: Arc<dyn PhaseExecutor>) -> Arc<dyn PhaseExecutor> {
        next
    }
}

/// Compose the executor chain: the first interceptor ends up outermost
pub(crate) fn compose_executor(
    base: Arc<dyn PhaseExecutor>,
    interceptors: &[Arc<dyn Interceptor>],
) -> Arc<dyn PhaseExecutor> {
    interceptors
        .iter()
        .rev()
        .fold(base, |next, interceptor| interceptor.wrap_phase_executor(next))
}
