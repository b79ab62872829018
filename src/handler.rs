//! Transport-agnostic idempotent request handling

use crate::input::validate_process_inputs;
use crate::settings::with_default;
use crate::{Context, IdempotencyConfig, IdempotencyError, Provider, Setting};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Conventional name of the transport header carrying the idempotency key
pub const IDEMPOTENCY_KEY_HEADER: &str = "requestId";

/// Runs inbound requests as idempotent processes.
///
/// The transport extracts the idempotency key (usually from
/// [`IDEMPOTENCY_KEY_HEADER`]) and the business inputs of the request; the
/// handler validates the inputs against earlier attempts and runs the body
/// through [`Provider::run_process`].
///
/// ```rust,ignore
/// let handler = IdempotentHandler::new("change-phone", Duration::from_secs(5))
///     .default_setting(PublishStrategy::InFinalPhase);
///
/// let response = handler.handle(&provider, headers.get(IDEMPOTENCY_KEY_HEADER), inputs, |ctx| {
///     ctx.phase("apply").final_phase().run(|| service.change_phone(&request))
/// })?;
/// ```
#[derive(Clone, Debug)]
pub struct IdempotentHandler {
    process_id: Box<str>,
    lock_duration: Duration,
    settings: Vec<Setting>,
    default_setting: Option<Setting>,
}

impl IdempotentHandler {
    /// Handler running `process_id` with the given lock timeout
    pub fn new(process_id: &str, lock_duration: Duration) -> Self {
        Self {
            process_id: process_id.into(),
            lock_duration,
            settings: Vec::new(),
            default_setting: None,
        }
    }

    /// Handler using the lock timeout and default publishing of `config`
    pub fn from_config(process_id: &str, config: &IdempotencyConfig) -> Self {
        let handler = Self::new(process_id, config.default_lock_timeout);
        match config.default_publishing {
            Some(strategy) => handler.default_setting(strategy),
            None => handler,
        }
    }

    /// Add an explicit process setting
    pub fn setting(mut self, setting: impl Into<Setting>) -> Self {
        self.settings.push(setting.into());
        self
    }

    /// Setting added to every process unless an explicit setting conflicts with it
    pub fn default_setting(mut self, setting: impl Into<Setting>) -> Self {
        self.default_setting = Some(setting.into());
        self
    }

    /// Process kind of every handled request
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Settings each process is started with
    pub fn effective_settings(&self) -> Vec<Setting> {
        with_default(self.settings.clone(), self.default_setting.as_ref())
    }

    /// Handle one request.
    ///
    /// # Errors
    /// - [`IdempotencyError::MissingIdempotencyKey`] when the request carried
    ///   no (or an empty) key
    /// - [`IdempotencyError::InputConflict`] when `inputs` differ from the
    ///   inputs of an earlier attempt with the same key
    /// - every error of [`Provider::run_process`], including the body's own
    pub fn handle<T, E, F>(
        &self,
        provider: &Provider,
        idempotency_key: Option<&str>,
        inputs: BTreeMap<String, Value>,
        body: F,
    ) -> Result<T, E>
    where
        E: From<IdempotencyError>,
        F: FnOnce(&Context) -> Result<T, E>,
    {
        let idempotency_key = idempotency_key
            .filter(|key| !key.is_empty())
            .ok_or(IdempotencyError::MissingIdempotencyKey)?;

        provider.run_process(
            idempotency_key,
            &self.process_id,
            self.lock_duration,
            self.effective_settings(),
            |ctx| {
                validate_process_inputs(ctx, inputs)?;
                body(ctx)
            },
        )
    }
}
