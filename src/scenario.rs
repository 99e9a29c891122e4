//! Scenario definitions: sequence templates, variable declarations and the
//! per-session resource bounds.
//!
//! A [`Scenario`] is immutable once built and shared (`Arc`) by every
//! session of every phase that runs it. Building validates eagerly — a
//! malformed scenario is rejected before any phase starts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::DefinitionError;
use crate::session::{VarDecl, VarKind, VarRef};
use crate::step::{AwaitVarStep, ScheduleDelayStep, Step};

/// An ordered, immutable list of steps, shared across all of its running
/// instances.
pub struct Sequence {
    name: Arc<str>,
    id: usize,
    steps: Arc<[Arc<dyn Step>]>,
    concurrency: usize,
}

impl Sequence {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn steps(&self) -> Arc<[Arc<dyn Step>]> {
        self.steps.clone()
    }

    /// Maximum concurrently running instances of this template; also the
    /// slot count of its scoped variables.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

/// Fluent builder for one sequence template.
pub struct SequenceBuilder {
    name: Arc<str>,
    steps: Vec<Arc<dyn Step>>,
    concurrency: usize,
    think_vars: Vec<Arc<str>>,
}

impl SequenceBuilder {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        SequenceBuilder { name: name.into(), steps: Vec::new(), concurrency: 1, think_vars: Vec::new() }
    }

    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Allows up to `n` concurrent instances of this sequence per session.
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    /// Adds a think-time pause: schedules a timer and blocks until it fires.
    /// The marker variable is auto-declared, scoped per instance.
    pub fn think_time(mut self, delay: Duration) -> Self {
        let key: Arc<str> = format!("!delay:{}:{}", self.name, self.think_vars.len()).into();
        self.think_vars.push(key.clone());
        self.steps.push(Arc::new(ScheduleDelayStep::new(VarRef::scoped(key.clone()), delay)));
        self.steps.push(Arc::new(AwaitVarStep::new(VarRef::scoped(key))));
        self
    }
}

/// Immutable scenario: sequence templates, which of them start a session,
/// declared variables and per-session bounds.
pub struct Scenario {
    name: Arc<str>,
    sequences: Vec<Sequence>,
    initial: Vec<usize>,
    vars: Vec<VarDecl>,
    max_requests: usize,
    max_sequences: usize,
    compensate_scheduling_delay: bool,
}

impl Scenario {
    pub fn builder(name: impl Into<Arc<str>>) -> ScenarioBuilder {
        ScenarioBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub(crate) fn initial_sequences(&self) -> &[usize] {
        &self.initial
    }

    pub(crate) fn sequence_id(&self, name: &str) -> Option<usize> {
        self.sequences.iter().position(|s| s.name() == name)
    }

    pub(crate) fn var_decls(&self) -> &[VarDecl] {
        &self.vars
    }

    /// In-flight request bound per session.
    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Concurrent sequence-instance bound per session.
    pub fn max_sequences(&self) -> usize {
        self.max_sequences
    }

    /// When set, the first request of each session measures latency from the
    /// session's intended fire time instead of the actual issue time,
    /// charging scheduling delay to the response.
    pub fn compensate_scheduling_delay(&self) -> bool {
        self.compensate_scheduling_delay
    }
}

/// Builder for [`Scenario`]; `build` performs eager validation.
pub struct ScenarioBuilder {
    name: Arc<str>,
    vars: Vec<VarDecl>,
    sequences: Vec<(SequenceBuilder, bool)>,
    max_requests: usize,
    max_sequences: Option<usize>,
    compensate_scheduling_delay: bool,
}

impl ScenarioBuilder {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        ScenarioBuilder {
            name: name.into(),
            vars: Vec::new(),
            sequences: Vec::new(),
            max_requests: 16,
            max_sequences: None,
            compensate_scheduling_delay: false,
        }
    }

    pub fn declare_int(mut self, key: impl Into<Arc<str>>) -> Self {
        self.vars.push(VarDecl { key: key.into(), kind: VarKind::Int, slots: 1 });
        self
    }

    /// Declares an int variable with one slot per sequence-instance index.
    pub fn declare_int_scoped(mut self, key: impl Into<Arc<str>>, slots: usize) -> Self {
        self.vars.push(VarDecl { key: key.into(), kind: VarKind::Int, slots });
        self
    }

    pub fn declare_object(mut self, key: impl Into<Arc<str>>) -> Self {
        self.vars.push(VarDecl { key: key.into(), kind: VarKind::Object, slots: 1 });
        self
    }

    pub fn declare_object_scoped(mut self, key: impl Into<Arc<str>>, slots: usize) -> Self {
        self.vars.push(VarDecl { key: key.into(), kind: VarKind::Object, slots });
        self
    }

    /// Adds a sequence instantiated at session start.
    pub fn initial_sequence(mut self, sequence: SequenceBuilder) -> Self {
        self.sequences.push((sequence, true));
        self
    }

    /// Adds a sequence only reachable through
    /// [`NewSequenceStep`](crate::step::NewSequenceStep).
    pub fn sequence(mut self, sequence: SequenceBuilder) -> Self {
        self.sequences.push((sequence, false));
        self
    }

    pub fn max_requests(mut self, n: usize) -> Self {
        self.max_requests = n;
        self
    }

    pub fn max_sequences(mut self, n: usize) -> Self {
        self.max_sequences = Some(n);
        self
    }

    pub fn compensate_scheduling_delay(mut self, enabled: bool) -> Self {
        self.compensate_scheduling_delay = enabled;
        self
    }

    pub fn build(self) -> Result<Scenario, DefinitionError> {
        let name = self.name;
        if self.sequences.is_empty() {
            return Err(DefinitionError::scenario(&name, "no sequences defined"));
        }
        if !self.sequences.iter().any(|(_, initial)| *initial) {
            return Err(DefinitionError::scenario(&name, "no initial sequences"));
        }
        if self.max_requests == 0 {
            return Err(DefinitionError::scenario(&name, "max_requests must be at least 1"));
        }

        let mut vars = self.vars;
        let mut sequences = Vec::with_capacity(self.sequences.len());
        let mut initial = Vec::new();
        let mut names = HashSet::new();
        let mut total_concurrency = 0usize;
        for (id, (builder, is_initial)) in self.sequences.into_iter().enumerate() {
            if !names.insert(builder.name.clone()) {
                return Err(DefinitionError::scenario(
                    &name,
                    format!("duplicate sequence name {:?}", builder.name),
                ));
            }
            if builder.steps.is_empty() {
                return Err(DefinitionError::scenario(
                    &name,
                    format!("sequence {:?} has no steps", builder.name),
                ));
            }
            if builder.concurrency == 0 {
                return Err(DefinitionError::scenario(
                    &name,
                    format!("sequence {:?} has zero concurrency", builder.name),
                ));
            }
            for key in &builder.think_vars {
                vars.push(VarDecl {
                    key: key.clone(),
                    kind: VarKind::Int,
                    slots: builder.concurrency,
                });
            }
            total_concurrency += builder.concurrency;
            if is_initial {
                initial.push(id);
            }
            sequences.push(Sequence {
                name: builder.name,
                id,
                steps: builder.steps.into(),
                concurrency: builder.concurrency,
            });
        }

        let mut keys = HashSet::new();
        for decl in &vars {
            if decl.slots == 0 {
                return Err(DefinitionError::scenario(
                    &name,
                    format!("variable {:?} has zero slots", decl.key),
                ));
            }
            if !keys.insert(decl.key.clone()) {
                return Err(DefinitionError::scenario(
                    &name,
                    format!("duplicate variable {:?}", decl.key),
                ));
            }
        }

        let max_sequences = self.max_sequences.unwrap_or(total_concurrency);
        if max_sequences < initial.len() {
            return Err(DefinitionError::scenario(
                &name,
                "max_sequences below the number of initial sequences",
            ));
        }

        Ok(Scenario {
            name,
            sequences,
            initial,
            vars,
            max_requests: self.max_requests,
            max_sequences,
            compensate_scheduling_delay: self.compensate_scheduling_delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::NoopStep;

    #[test]
    fn rejects_scenario_without_initial_sequences() {
        let result = ScenarioBuilder::new("s")
            .sequence(SequenceBuilder::new("only-forked").step(NoopStep))
            .build();
        assert!(matches!(result, Err(DefinitionError::InvalidScenario { .. })));
    }

    #[test]
    fn rejects_duplicate_sequence_names() {
        let result = ScenarioBuilder::new("s")
            .initial_sequence(SequenceBuilder::new("dup").step(NoopStep))
            .initial_sequence(SequenceBuilder::new("dup").step(NoopStep))
            .build();
        assert!(matches!(result, Err(DefinitionError::InvalidScenario { .. })));
    }

    #[test]
    fn rejects_empty_sequences() {
        let result = ScenarioBuilder::new("s")
            .initial_sequence(SequenceBuilder::new("empty"))
            .build();
        assert!(matches!(result, Err(DefinitionError::InvalidScenario { .. })));
    }

    #[test]
    fn sizes_sequence_bound_from_declared_concurrency() {
        let scenario = ScenarioBuilder::new("s")
            .initial_sequence(SequenceBuilder::new("a").step(NoopStep).concurrency(3))
            .sequence(SequenceBuilder::new("b").step(NoopStep))
            .build()
            .unwrap();
        assert_eq!(scenario.max_sequences(), 4);
        assert_eq!(scenario.sequence_id("b"), Some(1));
    }

    #[test]
    fn think_time_declares_a_scoped_marker_var() {
        let scenario = ScenarioBuilder::new("s")
            .initial_sequence(
                SequenceBuilder::new("pausing")
                    .concurrency(2)
                    .think_time(Duration::from_millis(10)),
            )
            .build()
            .unwrap();
        let decl = scenario
            .var_decls()
            .iter()
            .find(|d| d.key.starts_with("!delay:pausing"))
            .expect("auto-declared delay var");
        assert_eq!(decl.slots, 2);
        assert_eq!(scenario.sequences()[0].concurrency(), 2);
    }
}
