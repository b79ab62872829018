//! Phase-Based Idempotent Process Execution
//!
//! A process is split into phases. Each phase runs at most once per
//! successful completion: its output is recorded in a store and replayed on
//! every retry with the same idempotency key. A lock keeps retries of the same
//! process instance from running concurrently.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // 1. Build a provider on top of a lock store and a result store
//! let provider = Provider::builder(InMemoryLockAdapter::new(), InMemoryStore::new())
//!     .interceptor(MonitoringInterceptor::new())
//!     .build();
//!
//! // 2. Run the process; retries with the same key replay recorded phases
//! let receipt = provider.run_process(&request_id, "change-phone", Duration::from_secs(5), vec![], |ctx| {
//!     validate_single_process_input(ctx, &request)?;
//!     let code = ctx.phase("send-code").non_transactional().run(|| sms.send(&request.phone))?;
//!     ctx.phase("apply").final_phase().run(|| phones.update(&request, code))
//! })?;
//! ```

#![warn(missing_docs)]

// === Core Types ===
mod context;
mod errors;
mod key;
mod phase;
mod property;
mod settings;

// === Engine ===
mod executor;
mod interceptor;
mod provider;

// === Storage ===
mod cleanup;
mod lock;
#[cfg(feature = "lmdb")]
mod lmdb;
mod store;

// === Lifecycle Extensions ===
mod handler;
mod input;
mod monitoring;
mod publish;
mod stats;

// === Configuration & Observability ===
mod config;
pub mod logging;

// === Test Harness ===
#[cfg(any(test, feature = "test-harness"))]
pub mod testing;

// === Re-exports ===

// Types
pub use context::{Context, PhaseBuilder};
pub use key::{
    is_valid_identifier, validate_identifier, QualifiedKey, IDENTIFIER_GRAMMAR,
    PROCESS_LOCK_RECORD_ID,
};
pub use phase::{Phase, PhaseBody, PhaseOutput};
pub use property::{PropertyBag, PropertyKey};
pub use settings::{validate_settings, with_default, Setting, SettingKind};

// Errors
pub use errors::{
    IdempotencyError, LockError, PublishError, StoreError, ERR_SYS_CANNOT_SEND_TOMBSTONE_TO_NOT_SNAPSHOT_TOPIC,
    ERR_SYS_IDEMPOTENCY_ASSERTION_ERROR, ERR_SYS_IDEMPOTENCY_KEY_MISSING,
    ERR_SYS_IDEMPOTENT_INPUT_DOES_NOT_MATCH, ERR_SYS_IDEMPOTENT_PROCESS_LOCKED,
    ERR_SYS_SERVER_ERROR,
};

// Engine
pub use executor::PhaseExecutor;
pub use interceptor::Interceptor;
pub use provider::{Provider, ProviderBuilder, AUTO_FINAL_PHASE_ID};

// Storage
pub use cleanup::{run_cleanup, CleanupReport, InMemoryRetention, RetentionStore};
#[cfg(feature = "lmdb")]
pub use lmdb::LmdbIdempotencyStore;
pub use lock::{InMemoryLockAdapter, Lock, LockAdapter, LockDecision};
pub use store::{InMemoryStore, StoreAdapter, StoredRecord, TransactionBody, TransactionOps};

// Lifecycle extensions
pub use handler::{IdempotentHandler, IDEMPOTENCY_KEY_HEADER};
pub use input::{
    validate_process_inputs, validate_single_process_input, INPUT_PHASE_ID, SINGLE_INPUT_KEY,
};
pub use monitoring::MonitoringInterceptor;
pub use publish::{
    publish, publish_strategy, validate_destination_if_tombstone, InMemoryMessageSink,
    MessageSink, OutboundMessage, PublishStrategy, PublishStrategyInterceptor,
};
pub use stats::{ProviderStats, ProviderStatsSnapshot, StatsInterceptor};

// Configuration
pub use config::{CleanupConfig, IdempotencyConfig, LmdbConfig};
