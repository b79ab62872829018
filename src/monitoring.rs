//! Tracing interceptor for the context and phase lifecycle

use crate::logging::{
    LOG_EVENT_CONTEXT_CLOSED, LOG_EVENT_CONTEXT_CREATED, LOG_EVENT_ENTERING_NEW_PHASE,
    LOG_EVENT_IDEMPOTENCY_PHASE_BODY_FINISHED_EXCEPTIONALLY,
    LOG_EVENT_IDEMPOTENCY_PHASE_EXECUTOR_ERROR, LOG_EVENT_PHASE_FINISHED,
};
use crate::{
    Context, IdempotencyError, Interceptor, Phase, PhaseBody, PhaseExecutor, PhaseOutput,
    PropertyKey,
};
use std::sync::Arc;
use tracing::Span;

const CONTEXT_SPAN: PropertyKey<Span> = PropertyKey::new("idempotency.monitoring", "span");

/// Emits structured `tracing` events for contexts and phases.
///
/// Every context gets an `idempotency_process` span carrying `process_id` and
/// `idempotency_key`; phases run inside a child `idempotency_phase` span
/// carrying `phase_id`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonitoringInterceptor;

impl MonitoringInterceptor {
    /// Monitoring interceptor; stateless
    pub fn new() -> Self {
        Self
    }

    fn context_span(context: &Context) -> Span {
        context.properties().get_or_init(&CONTEXT_SPAN, || {
            tracing::info_span!(
                "idempotency_process",
                process_id = %context.process_id(),
                idempotency_key = %context.idempotency_key(),
            )
        })
    }
}

impl Interceptor for MonitoringInterceptor {
    fn on_context_created(&self, context: &Context) -> Result<(), IdempotencyError> {
        Self::context_span(context).in_scope(|| {
            tracing::debug!(event = LOG_EVENT_CONTEXT_CREATED, "Idempotency: Entering new process.");
        });
        Ok(())
    }

    fn on_context_closed(&self, context: &Context) -> Result<(), IdempotencyError> {
        Self::context_span(context).in_scope(|| {
            tracing::debug!(event = LOG_EVENT_CONTEXT_CLOSED, "Idempotency: Closing the process.");
        });
        context.properties().remove(&CONTEXT_SPAN);
        Ok(())
    }

    fn wrap_phase_executor(&self, next: Arc<dyn PhaseExecutor>) -> Arc<dyn PhaseExecutor> {
        Arc::new(MonitoringExecutor { next })
    }
}

struct MonitoringExecutor {
    next: Arc<dyn PhaseExecutor>,
}

impl PhaseExecutor for MonitoringExecutor {
    fn execute(
        &self,
        context: &Context,
        phase: &Phase,
        body: PhaseBody<'_>,
    ) -> Result<PhaseOutput, IdempotencyError> {
        let parent = MonitoringInterceptor::context_span(context);
        let span = tracing::debug_span!(parent: &parent, "idempotency_phase", phase_id = %phase.id());
        let _entered = span.enter();

        tracing::debug!(event = LOG_EVENT_ENTERING_NEW_PHASE, "Idempotency: Entering new phase.");
        if phase.is_final() {
            tracing::debug!("Idempotency: This is the final phase.");
        }

        let result = self.next.execute(context, phase, body);
        match &result {
            Ok(_) => tracing::debug!(
                event = LOG_EVENT_PHASE_FINISHED,
                "Idempotency: Phase finished successfully and will not be executed on retry."
            ),
            Err(IdempotencyError::PhaseBody { .. }) => tracing::warn!(
                event = LOG_EVENT_IDEMPOTENCY_PHASE_BODY_FINISHED_EXCEPTIONALLY,
                "Idempotency: Phase body returned an error. Database transaction has been rolled back."
            ),
            Err(e) => tracing::error!(
                event = LOG_EVENT_IDEMPOTENCY_PHASE_EXECUTOR_ERROR,
                error = %e,
                "Idempotency: Phase finished exceptionally. Database transaction has been rolled back."
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::init_test_tracing;
    use crate::{InMemoryLockAdapter, InMemoryStore, Provider};
    use std::time::Duration;

    #[test]
    fn test_monitoring_is_transparent() {
        init_test_tracing();
        let provider = Provider::builder(InMemoryLockAdapter::new(), InMemoryStore::new())
            .interceptor(MonitoringInterceptor::new())
            .build();

        let context = provider
            .start("req-1", "monitored", Duration::from_secs(5), vec![])
            .unwrap();
        assert!(context.properties().contains(&CONTEXT_SPAN));

        let ok = context.phase("first").run(|| Ok::<_, IdempotencyError>(1u8));
        assert_eq!(ok.unwrap(), 1);
        let failed = context
            .phase("second")
            .final_phase()
            .run(|| Err::<u8, _>(IdempotencyError::assertion("rejected")));
        assert!(failed.unwrap_err().to_string().contains("rejected"));
        assert!(context.was_final_phase());

        context.close().unwrap();
    }
}
