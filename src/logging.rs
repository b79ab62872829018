//! Stable values of the `event` field attached to log records

// Context
/// A context was created
pub const LOG_EVENT_CONTEXT_CREATED: &str = "idempotency_context_created";
/// A context was closed
pub const LOG_EVENT_CONTEXT_CLOSED: &str = "idempotency_context_closed";
/// A context was dropped without `close`
pub const LOG_EVENT_CONTEXT_DROPPED_UNCLOSED: &str = "idempotency_context_dropped_unclosed";

// Provider
/// Releasing the process lock failed
pub const LOG_EVENT_RELEASE_IDEMPOTENCY_LOCK_FAILED: &str = "idempotency_lock_release_failed";
/// A phase was replayed from the store
pub const LOG_EVENT_IDEMPOTENCY_SKIP_PHASE_DUE_TO_RESULT_STORED: &str =
    "idempotency_result_stored_so_skip_phase";
/// A phase lost the insert race to a concurrent execution
pub const LOG_EVENT_IDEMPOTENCY_MULTIPLE_EXECUTION_IN_PARALLEL: &str =
    "idempotency_multiple_executions_in_parallel";
/// Start was rejected because the process is locked
pub const LOG_EVENT_IDEMPOTENCY_PROCESS_LOCKED: &str = "idempotency_process_locked";

// Monitoring
/// A phase is about to execute
pub const LOG_EVENT_ENTERING_NEW_PHASE: &str = "idempotency_entering_new_phase";
/// A phase finished and will be replayed on retry
pub const LOG_EVENT_PHASE_FINISHED: &str = "idempotency_phase_finished_no_retry";
/// The executor chain failed
pub const LOG_EVENT_IDEMPOTENCY_PHASE_EXECUTOR_ERROR: &str = "idempotency_phase_executor_error";
/// A phase body returned an error
pub const LOG_EVENT_IDEMPOTENCY_PHASE_BODY_FINISHED_EXCEPTIONALLY: &str =
    "idempotency_phase_finished_exceptionally";

// Input validation
/// Input ids were added or removed since the first attempt
pub const LOG_EVENT_IDEMPOTENCY_INPUT_DIFFER_FROM_CACHED: &str =
    "idempotency_inputs_differ_from_cached";

// Lock adapters
/// A lock adapter gave up obtaining a lock
pub const LOG_EVENT_UNABLE_OBTAIN_LOCK: &str = "idempotency_unable_obtain_lock";

// Cleanup
/// A cleanup run started deleting
pub const LOG_EVENT_IDEMPOTENCY_CLEANUP_JOB_STARTED: &str = "idempotency_cleanup_job_started";
/// A cleanup run finished
pub const LOG_EVENT_IDEMPOTENCY_CLEANUP_JOB_FINISHED: &str = "idempotency_cleanup_job_finished";
/// Cleanup moved its threshold back to respect the record limit
pub const LOG_EVENT_IDEMPOTENCY_CLEANUP_MAX_RECORDS_REACHED: &str =
    "idempotency_cleanup_max_records_reached";
/// One cleanup batch was deleted
pub const LOG_EVENT_IDEMPOTENCY_CLEANUP_RECORDS: &str = "idempotency_cleanup_records";
/// A cleanup run failed
pub const LOG_EVENT_IDEMPOTENCY_CLEANUP_JOB_FAILED: &str = "idempotency_cleanup_job_failed";
