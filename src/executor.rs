//! Phase executor chain and its innermost, store-backed link

use crate::logging::{
    LOG_EVENT_IDEMPOTENCY_MULTIPLE_EXECUTION_IN_PARALLEL,
    LOG_EVENT_IDEMPOTENCY_SKIP_PHASE_DUE_TO_RESULT_STORED,
};
use crate::{
    Context, IdempotencyError, Phase, PhaseBody, PhaseOutput, QualifiedKey, StoreAdapter,
    StoreError, TransactionOps,
};
use std::sync::Arc;

/// Executes a phase body at most once per successful completion.
///
/// Interceptors wrap the base executor through
/// [`Interceptor::wrap_phase_executor`](crate::Interceptor::wrap_phase_executor).
/// A wrapper must call its `next` executor at most once and may wrap the body
/// or observe the output, but never changes the phase.
pub trait PhaseExecutor: Send + Sync {
    /// Run or replay `phase`, calling `body` at most once
    fn execute(
        &self,
        context: &Context,
        phase: &Phase,
        body: PhaseBody<'_>,
    ) -> Result<PhaseOutput, IdempotencyError>;
}

/// Innermost executor: replays stored outputs, records fresh ones
pub(crate) struct BasePhaseExecutor {
    store: Arc<dyn StoreAdapter>,
}

impl BasePhaseExecutor {
    pub(crate) fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self { store }
    }

    fn run_and_record(
        &self,
        key: &QualifiedKey,
        phase: &Phase,
        body: PhaseBody<'_>,
    ) -> Result<String, IdempotencyError> {
        let is_final = phase.is_final();
        if phase.is_transactional() {
            let mut output = None;
            self.store.execute_in_transaction(Box::new(
                |ops: &mut dyn TransactionOps| -> Result<(), IdempotencyError> {
                    let data = body()?;
                    ops.insert(key, &data, is_final)?;
                    output = Some(data);
                    Ok(())
                },
            ))?;
            output.ok_or_else(|| {
                StoreError::Storage("transaction committed without running the phase body".into())
                    .into()
            })
        } else {
            let data = body()?;
            self.store.execute_in_transaction(Box::new(
                |ops: &mut dyn TransactionOps| -> Result<(), IdempotencyError> {
                    ops.insert(key, &data, is_final)?;
                    Ok(())
                },
            ))?;
            Ok(data)
        }
    }
}

impl PhaseExecutor for BasePhaseExecutor {
    /// Run or replay `phase`, calling `body` at most once
    fn execute(
        &self,
        context: &Context,
        phase: &Phase,
        body: PhaseBody<'_>,
    ) -> Result<PhaseOutput, IdempotencyError> {
        let key = QualifiedKey::new(context.process_id(), context.idempotency_key(), phase.id());

        if let Some(record) = self.store.get(&key)? {
            tracing::debug!(
                event = LOG_EVENT_IDEMPOTENCY_SKIP_PHASE_DUE_TO_RESULT_STORED,
                phase_id = %phase.id(),
                "Idempotency: Skipping phase, because the result is already stored."
            );
            return Ok(PhaseOutput::Stored(record.data));
        }

        if let Some(final_phase) = context.recorded_final_phase() {
            return Err(IdempotencyError::assertion(format!(
                "Process {}: You can not enter phase {}, because final phase {} was already recorded by a previous execution.",
                context.process_id(),
                phase.id(),
                final_phase
            )));
        }

        match self.run_and_record(&key, phase, body) {
            Ok(data) => Ok(PhaseOutput::Executed(data)),
            Err(e) if self.store.may_be_duplicate_record_error(&e) => match self.store.get(&key)? {
                Some(record) => {
                    tracing::warn!(
                        event = LOG_EVENT_IDEMPOTENCY_MULTIPLE_EXECUTION_IN_PARALLEL,
                        phase_id = %phase.id(),
                        "Idempotency: There were multiple executions of the same phase in parallel. Making sure the same result was returned in both."
                    );
                    Ok(PhaseOutput::Concurrent(record.data))
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }
}
