//! Error taxonomy — definition-time rejections, session-time failures, and
//! run-level outcomes.
//!
//! Backpressure (pool exhaustion, request-queue full) is deliberately absent
//! here: it is a blocking signal consumed by the scheduling loop, never an
//! error. Invariant breaks (status regressing, completing an empty queue)
//! are panics, not variants.

use std::sync::Arc;

use thiserror::Error;

/// A malformed or contradictory benchmark definition, detected eagerly by
/// [`Benchmark::validate`](crate::Benchmark::validate) before any phase runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("benchmark has no phases")]
    NoPhases,
    #[error("duplicate phase name {0:?}")]
    DuplicatePhase(String),
    #[error("phase {phase:?} depends on unknown phase {dependency:?}")]
    UnknownDependency { phase: String, dependency: String },
    #[error("phase {0:?} depends on itself")]
    SelfDependency(String),
    #[error("phase dependency cycle involving {0:?}")]
    DependencyCycle(String),
    #[error("phase {phase:?}: {reason}")]
    InvalidPhase { phase: String, reason: String },
    #[error("scenario {scenario:?}: {reason}")]
    InvalidScenario { scenario: String, reason: String },
}

impl DefinitionError {
    pub(crate) fn phase(name: &str, reason: impl Into<String>) -> Self {
        DefinitionError::InvalidPhase { phase: name.to_string(), reason: reason.into() }
    }

    pub(crate) fn scenario(name: &str, reason: impl Into<String>) -> Self {
        DefinitionError::InvalidScenario { scenario: name.to_string(), reason: reason.into() }
    }
}

/// A failure inside a running session: a step error, an unset-variable read
/// (a benchmark bug, failed fast rather than defaulted) or a request whose
/// completion reported an error.
///
/// Any of these stops the session deterministically and escalates to its
/// phase via [`PhaseInstance::fail`](crate::phase::PhaseInstance::fail).
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("variable {0:?} was not set yet")]
    VarNotSet(Arc<str>),
    #[error("variable {0:?} was not declared")]
    VarNotDeclared(Arc<str>),
    #[error("variable {key:?} is not an {expected} variable")]
    VarType { key: Arc<str>, expected: &'static str },
    #[error("variable {key:?} has {slots} slots, index {index} out of range")]
    VarIndex { key: Arc<str>, slots: usize, index: usize },
    #[error("unknown sequence {0:?}")]
    UnknownSequence(Arc<str>),
    #[error("maximum number of concurrent sequences exceeded")]
    SequenceLimitExceeded,
    #[error("request to {target:?} failed: {reason}")]
    RequestFailed { target: Arc<str>, reason: String },
    #[error("step failed: {0}")]
    StepFailed(String),
}

/// Terminal outcome of [`SimulationRunner::run`](crate::SimulationRunner::run).
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid benchmark: {0}")]
    Definition(#[from] DefinitionError),
    #[error("phase {phase:?} failed: {error}")]
    PhaseFailed { phase: String, error: SessionError },
}
