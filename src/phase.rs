//! Phase data passed through the executor chain

use crate::{IdempotencyError, PropertyBag, Setting};

/// One step of an idempotent process.
///
/// Created for every phase invocation and dropped when the executor chain
/// returns. Executors receive it together with the owning
/// [`Context`](crate::Context).
#[derive(Debug)]
pub struct Phase {
    id: Box<str>,
    is_final: bool,
    transactional: bool,
    settings: Vec<Setting>,
    properties: PropertyBag,
}

impl Phase {
    pub(crate) fn new(id: Box<str>, is_final: bool, transactional: bool, settings: Vec<Setting>) -> Self {
        Self {
            id,
            is_final,
            transactional,
            settings,
            properties: PropertyBag::new(),
        }
    }

    /// Identifier of the phase, unique within its context
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this phase completes the process.
    ///
    /// No phase may be entered after a final phase.
    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Whether the body runs inside the store transaction that records its
    /// output. Non-transactional phases suit remote calls that should not
    /// hold a database transaction open.
    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    /// Settings attached to this phase invocation
    pub fn settings(&self) -> &[Setting] {
        &self.settings
    }

    /// Phase-scoped extension properties
    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }
}

/// Type-erased phase body: runs the caller's closure and returns its
/// serialized output
pub type PhaseBody<'a> = Box<dyn FnOnce() -> Result<String, IdempotencyError> + 'a>;

/// Serialized output of a phase together with where it came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhaseOutput {
    /// The body ran in this call and its output was recorded
    Executed(String),
    /// The output was recorded by an earlier execution; the body did not run
    Stored(String),
    /// The body ran but a concurrent execution recorded its output first;
    /// this is the winner's output
    Concurrent(String),
}

impl PhaseOutput {
    /// Serialized output
    pub fn data(&self) -> &str {
        match self {
            Self::Executed(data) | Self::Stored(data) | Self::Concurrent(data) => data,
        }
    }

    /// Whether the body's own output became the recorded result
    pub fn was_executed(&self) -> bool {
        matches!(self, Self::Executed(_))
    }

    /// Whether the output is a replay of an earlier execution
    pub fn was_replayed(&self) -> bool {
        !self.was_executed()
    }
}
