//! Guard against retries carrying different inputs

use crate::key::validate_identifier;
use crate::logging::LOG_EVENT_IDEMPOTENCY_INPUT_DIFFER_FROM_CACHED;
use crate::{Context, IdempotencyError};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Phase recording the inputs of the first attempt
pub const INPUT_PHASE_ID: &str = "_input_v2";

/// Input id used by [`validate_single_process_input`]
pub const SINGLE_INPUT_KEY: &str = "theInput";

/// Ensure a retried process runs with the inputs of its first attempt.
///
/// The first attempt records every input as serialized JSON in the phase
/// [`INPUT_PHASE_ID`]. Retries compare by JSON value: ids present in both the
/// recorded and the current inputs must match, otherwise
/// [`IdempotencyError::InputConflict`] lists them. Added or removed ids are
/// allowed so that inputs can evolve; they are only logged.
///
/// Must be called outside of any phase, before the final phase.
pub fn validate_process_inputs(
    context: &Context,
    inputs: BTreeMap<String, Value>,
) -> Result<(), IdempotencyError> {
    for id in inputs.keys() {
        validate_identifier("inputId", id)?;
    }

    let to_save = inputs
        .iter()
        .map(|(id, value)| -> Result<(String, String), IdempotencyError> {
            Ok((id.clone(), serde_json::to_string(value)?))
        })
        .collect::<Result<BTreeMap<String, String>, IdempotencyError>>()?;
    let saved: BTreeMap<String, String> = context
        .phase(INPUT_PHASE_ID)
        .run(|| Ok::<_, IdempotencyError>(to_save))?;

    let added: Vec<&str> = inputs
        .keys()
        .filter(|id| !saved.contains_key(*id))
        .map(String::as_str)
        .collect();
    let removed: Vec<&str> = saved
        .keys()
        .filter(|id| !inputs.contains_key(*id))
        .map(String::as_str)
        .collect();
    if !added.is_empty() || !removed.is_empty() {
        tracing::warn!(
            event = LOG_EVENT_IDEMPOTENCY_INPUT_DIFFER_FROM_CACHED,
            process_id = %context.process_id(),
            idempotency_key = %context.idempotency_key(),
            ?added,
            ?removed,
            "Set of validated inputs differs from cached values."
        );
    }

    let conflicting_input_ids: Vec<String> = inputs
        .iter()
        .filter_map(|(id, value)| {
            let recorded = saved.get(id)?;
            match serde_json::from_str::<Value>(recorded) {
                Ok(recorded) if &recorded == value => None,
                Ok(_) => Some(id.clone()),
                Err(e) => Some(format!("{id} ({e})")),
            }
        })
        .collect();

    if conflicting_input_ids.is_empty() {
        Ok(())
    } else {
        Err(IdempotencyError::InputConflict {
            conflicting_input_ids,
        })
    }
}

/// [`validate_process_inputs`] for a process with exactly one input,
/// stored under [`SINGLE_INPUT_KEY`]
pub fn validate_single_process_input<I: Serialize + ?Sized>(
    context: &Context,
    input: &I,
) -> Result<(), IdempotencyError> {
    let value = serde_json::to_value(input)?;
    validate_process_inputs(context, BTreeMap::from([(SINGLE_INPUT_KEY.to_owned(), value)]))
}
