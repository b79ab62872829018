//! Binding of outbound messages to the phase lifecycle
//!
//! A process picks one [`PublishStrategy`] through
//! [`Setting::Publishing`](crate::Setting::Publishing). With the
//! [`PublishStrategyInterceptor`] registered, [`publish`] then queues or sends
//! messages according to that strategy. The transport itself stays behind the
//! [`MessageSink`] trait.

use crate::{
    Context, IdempotencyError, Interceptor, Phase, PhaseBody, PhaseExecutor, PhaseOutput,
    PropertyKey, PublishError, Setting,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

const PROPERTY_NAMESPACE: &str = "idempotency.publish";
const BINDING: PropertyKey<PublishBinding> = PropertyKey::new(PROPERTY_NAMESPACE, "binding");
const QUEUE: PropertyKey<Vec<OutboundMessage>> = PropertyKey::new(PROPERTY_NAMESPACE, "queue");

/// When messages published in a process leave the service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStrategy {
    /// The process does not publish; every publish is an assertion error
    NoPublishing,
    /// Messages are queued and sent in one sink transaction at the end of the
    /// final phase. Publishing is allowed outside phases before the final
    /// phase, or inside the final phase. Suits request handlers.
    InFinalPhase,
    /// Messages published inside a phase are sent in one sink transaction at
    /// the end of that phase
    AtEndOfCurrentPhase,
    /// Messages are sent immediately, outside phases, as part of the
    /// surrounding consumer transaction. Duplicated input yields duplicated
    /// output.
    InConsumer,
}

/// Message handed to a [`MessageSink`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Destination topic
    pub topic: String,
    /// Partitioning key
    pub key: String,
    /// `None` marks a tombstone
    pub payload: Option<Value>,
    /// Transport headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl OutboundMessage {
    /// Message carrying `payload` serialized as JSON
    pub fn new<T: Serialize + ?Sized>(
        topic: impl Into<String>,
        key: impl Into<String>,
        payload: &T,
    ) -> Result<Self, IdempotencyError> {
        Ok(Self {
            topic: topic.into(),
            key: key.into(),
            payload: Some(serde_json::to_value(payload)?),
            headers: BTreeMap::new(),
        })
    }

    /// Deletion marker for `key`; only valid on snapshot topics
    pub fn tombstone(topic: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload: None,
            headers: BTreeMap::new(),
        }
    }

    /// Add a transport header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Whether this message deletes `key`
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }
}

/// Transport for outbound messages
pub trait MessageSink: Send + Sync + 'static {
    /// Send one message
    fn send(&self, message: OutboundMessage) -> Result<(), PublishError>;

    /// Send all messages atomically: either every message is delivered or none
    fn send_all_in_transaction(&self, messages: Vec<OutboundMessage>) -> Result<(), PublishError>;
}

/// Reject tombstones on topics whose last `.` segment is not `snapshot`
pub fn validate_destination_if_tombstone(message: &OutboundMessage) -> Result<(), PublishError> {
    if message.is_tombstone() && message.topic.rsplit('.').next() != Some("snapshot") {
        return Err(PublishError::TombstoneToNonSnapshotTopic {
            topic: message.topic.as_str().into(),
        });
    }
    Ok(())
}

/// The single publish strategy among `settings`
pub fn publish_strategy(settings: &[Setting]) -> Result<PublishStrategy, IdempotencyError> {
    let strategies: Vec<PublishStrategy> =
        settings.iter().filter_map(Setting::as_publish_strategy).collect();
    match strategies.as_slice() {
        [strategy] => Ok(*strategy),
        [] => Err(IdempotencyError::assertion(
            "Publish strategy is required but not configured.",
        )),
        many => Err(IdempotencyError::assertion(format!(
            "Multiple publish strategies provided: {many:?}."
        ))),
    }
}

#[derive(Clone)]
struct PublishBinding {
    strategy: PublishStrategy,
    sink: Arc<dyn MessageSink>,
}

/// Publish `message` from within an idempotent process.
///
/// # Errors
/// - [`IdempotencyError::Assertion`] when the strategy forbids publishing at
///   this point of the process, or when no strategy is bound to the context
/// - [`PublishError::TombstoneToNonSnapshotTopic`] for misplaced tombstones
/// - sink failures for [`PublishStrategy::InConsumer`]
pub fn publish(context: &Context, message: OutboundMessage) -> Result<(), IdempotencyError> {
    let binding = context.properties().get(&BINDING).ok_or_else(|| {
        IdempotencyError::assertion(
            "Publish strategy is required but not configured. Register PublishStrategyInterceptor.",
        )
    })?;

    match binding.strategy {
        PublishStrategy::NoPublishing => {
            return Err(IdempotencyError::assertion(
                "It is not possible to publish with NoPublishing strategy",
            ));
        }
        PublishStrategy::InFinalPhase => {
            if context.was_final_phase() {
                return Err(IdempotencyError::assertion(
                    "It is not possible to publish after final phase",
                ));
            }
            if context.current_phase().is_some_and(|phase| !phase.is_final()) {
                return Err(IdempotencyError::assertion(
                    "It is not possible to publish inside non final phase",
                ));
            }
        }
        PublishStrategy::AtEndOfCurrentPhase => {
            if context.current_phase().is_none() {
                return Err(IdempotencyError::assertion(
                    "It is not possible to publish outside phase",
                ));
            }
        }
        PublishStrategy::InConsumer => {
            if context.current_phase().is_some() {
                return Err(IdempotencyError::assertion(
                    "It is not possible to publish inside phase",
                ));
            }
            validate_destination_if_tombstone(&message)?;
            return Ok(binding.sink.send(message)?);
        }
    }

    validate_destination_if_tombstone(&message)?;
    context
        .properties()
        .update(&QUEUE, Vec::new, |queue| queue.push(message));
    Ok(())
}

/// Binds the configured [`PublishStrategy`] of each context to a sink.
///
/// Fails context creation when the context carries no publish strategy, so
/// register it only for processes that configure one.
#[derive(Clone)]
pub struct PublishStrategyInterceptor {
    sink: Arc<dyn MessageSink>,
}

impl PublishStrategyInterceptor {
    /// Interceptor sending through `sink`
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self { sink }
    }
}

impl Interceptor for PublishStrategyInterceptor {
    fn on_context_created(&self, context: &Context) -> Result<(), IdempotencyError> {
        let strategy = publish_strategy(context.settings())?;
        context.properties().set(
            &BINDING,
            PublishBinding {
                strategy,
                sink: Arc::clone(&self.sink),
            },
        );
        Ok(())
    }

    fn wrap_phase_executor(&self, next: Arc<dyn PhaseExecutor>) -> Arc<dyn PhaseExecutor> {
        Arc::new(PublishingExecutor { next })
    }
}

struct PublishingExecutor {
    next: Arc<dyn PhaseExecutor>,
}

impl PhaseExecutor for PublishingExecutor {
    fn execute(
        &self,
        context: &Context,
        phase: &Phase,
        body: PhaseBody<'_>,
    ) -> Result<PhaseOutput, IdempotencyError> {
        let Some(binding) = context.properties().get(&BINDING) else {
            return self.next.execute(context, phase, body);
        };
        let flushes = match binding.strategy {
            PublishStrategy::InFinalPhase => phase.is_final(),
            PublishStrategy::AtEndOfCurrentPhase => true,
            PublishStrategy::NoPublishing | PublishStrategy::InConsumer => false,
        };
        if !flushes {
            return self.next.execute(context, phase, body);
        }

        self.next.execute(
            context,
            phase,
            Box::new(move || {
                let result = body();
                let queued = context
                    .properties()
                    .update(&QUEUE, Vec::new, std::mem::take);
                let data = result?;
                if !queued.is_empty() {
                    binding.sink.send_all_in_transaction(queued)?;
                }
                Ok(data)
            }),
        )
    }
}

/// Sink keeping every delivery in memory
#[derive(Clone, Default)]
pub struct InMemoryMessageSink {
    deliveries: Arc<Mutex<Vec<Vec<OutboundMessage>>>>,
}

impl InMemoryMessageSink {
    /// Sink with no deliveries
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliveries in order; a transaction is one delivery, a single send is
    /// a delivery of one message
    pub fn deliveries(&self) -> Vec<Vec<OutboundMessage>> {
        self.deliveries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// All delivered messages, flattened
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.deliveries().into_iter().flatten().collect()
    }
}

impl MessageSink for InMemoryMessageSink {
    fn send(&self, message: OutboundMessage) -> Result<(), PublishError> {
        self.send_all_in_transaction(vec![message])
    }

    fn send_all_in_transaction(&self, messages: Vec<OutboundMessage>) -> Result<(), PublishError> {
        self.deliveries
            .lock()
            .map_err(|e| PublishError::Sink(e.to_string().into()))?
            .push(messages);
        Ok(())
    }
}
