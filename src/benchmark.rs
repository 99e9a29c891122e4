//! Benchmark definitions and eager validation.
//!
//! A [`Benchmark`] is the immutable workload description handed to the
//! runner: named phases with arrival models, timing and dependencies.
//! [`Benchmark::validate`] rejects malformed or contradictory definitions
//! before any phase starts; nothing here is ever retried or repaired at
//! runtime.

use std::collections::HashMap;

use crate::error::DefinitionError;
use crate::phase::{ArrivalModel, Phase};

/// A named set of phases making up one run.
pub struct Benchmark {
    pub name: String,
    pub phases: Vec<Phase>,
}

impl Benchmark {
    pub fn new(name: impl Into<String>) -> Self {
        Benchmark { name: name.into(), phases: Vec::new() }
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    /// Checks the whole definition: phase-name uniqueness, dependency
    /// integrity (existence, no self-references, no cycles) and per-model
    /// parameter sanity.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.phases.is_empty() {
            return Err(DefinitionError::NoPhases);
        }
        let mut by_name = HashMap::new();
        for (index, phase) in self.phases.iter().enumerate() {
            if by_name.insert(phase.name.clone(), index).is_some() {
                return Err(DefinitionError::DuplicatePhase(phase.name.clone()));
            }
        }
        for phase in &self.phases {
            self.validate_model(phase)?;
            for dependency in phase
                .start_after
                .iter()
                .chain(&phase.start_after_strict)
                .chain(&phase.terminate_after_strict)
            {
                if dependency == &phase.name {
                    return Err(DefinitionError::SelfDependency(phase.name.clone()));
                }
                if !by_name.contains_key(dependency) {
                    return Err(DefinitionError::UnknownDependency {
                        phase: phase.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
        self.check_cycles(&by_name)
    }

    fn validate_model(&self, phase: &Phase) -> Result<(), DefinitionError> {
        let name = &phase.name;
        match phase.model {
            ArrivalModel::AtOnce { users } | ArrivalModel::Always { users } => {
                if users == 0 {
                    return Err(DefinitionError::phase(name, "needs at least one user"));
                }
                if matches!(phase.model, ArrivalModel::Always { .. }) && phase.duration.is_zero() {
                    return Err(DefinitionError::phase(name, "duration must be positive"));
                }
            }
            ArrivalModel::Sequentially { repeats } => {
                if repeats == 0 {
                    return Err(DefinitionError::phase(name, "needs at least one repeat"));
                }
            }
            ArrivalModel::ConstantPerSec { rate, max_sessions, .. } => {
                if !(rate > 0.0) || !rate.is_finite() {
                    return Err(DefinitionError::phase(name, "rate must be positive"));
                }
                if phase.duration.is_zero() {
                    return Err(DefinitionError::phase(name, "duration must be positive"));
                }
                if max_sessions == Some(0) {
                    return Err(DefinitionError::phase(name, "max_sessions must be positive"));
                }
            }
            ArrivalModel::RampPerSec { initial_rate, target_rate, max_sessions, .. } => {
                if initial_rate < 0.0
                    || target_rate < 0.0
                    || !initial_rate.is_finite()
                    || !target_rate.is_finite()
                {
                    return Err(DefinitionError::phase(name, "rates must not be negative"));
                }
                if initial_rate == 0.0 && target_rate == 0.0 {
                    return Err(DefinitionError::phase(name, "ramp must reach a positive rate"));
                }
                if phase.duration.is_zero() {
                    return Err(DefinitionError::phase(name, "duration must be positive"));
                }
                if max_sessions == Some(0) {
                    return Err(DefinitionError::phase(name, "max_sessions must be positive"));
                }
            }
            ArrivalModel::Noop => {}
        }
        if let Some(max_duration) = phase.max_duration {
            if max_duration < phase.duration {
                return Err(DefinitionError::phase(name, "max_duration shorter than duration"));
            }
        }
        Ok(())
    }

    /// Depth-first search over the union of all dependency edges; a cycle
    /// would deadlock the run before it produced anything.
    fn check_cycles(&self, by_name: &HashMap<String, usize>) -> Result<(), DefinitionError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            InProgress,
            Done,
        }
        fn visit(
            index: usize,
            phases: &[Phase],
            by_name: &HashMap<String, usize>,
            marks: &mut [Mark],
        ) -> Result<(), DefinitionError> {
            match marks[index] {
                Mark::Done => return Ok(()),
                Mark::InProgress => {
                    return Err(DefinitionError::DependencyCycle(phases[index].name.clone()))
                }
                Mark::New => {}
            }
            marks[index] = Mark::InProgress;
            let phase = &phases[index];
            for dependency in phase
                .start_after
                .iter()
                .chain(&phase.start_after_strict)
                .chain(&phase.terminate_after_strict)
            {
                visit(by_name[dependency], phases, by_name, marks)?;
            }
            marks[index] = Mark::Done;
            Ok(())
        }

        let mut marks = vec![Mark::New; self.phases.len()];
        for index in 0..self.phases.len() {
            visit(index, &self.phases, by_name, &mut marks)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{ScenarioBuilder, SequenceBuilder};
    use crate::step::NoopStep;
    use std::sync::Arc;
    use std::time::Duration;

    fn scenario() -> Arc<crate::scenario::Scenario> {
        Arc::new(
            ScenarioBuilder::new("s")
                .initial_sequence(SequenceBuilder::new("main").step(NoopStep))
                .build()
                .unwrap(),
        )
    }

    fn noop_phase(name: &str) -> Phase {
        Phase::builder()
            .name(name)
            .model(ArrivalModel::Noop)
            .scenario(scenario())
            .duration(Duration::ZERO)
            .build()
    }

    #[test]
    fn accepts_a_well_formed_benchmark() {
        let benchmark = Benchmark::new("ok")
            .phase(
                Phase::builder()
                    .name("steady")
                    .model(ArrivalModel::ConstantPerSec {
                        rate: 100.0,
                        variance: false,
                        max_sessions: None,
                    })
                    .scenario(scenario())
                    .duration(Duration::from_secs(1))
                    .build(),
            )
            .phase(
                Phase::builder()
                    .name("after")
                    .model(ArrivalModel::AtOnce { users: 5 })
                    .scenario(scenario())
                    .duration(Duration::ZERO)
                    .start_after(vec!["steady".into()])
                    .build(),
            );
        assert!(benchmark.validate().is_ok());
    }

    #[test]
    fn rejects_empty_benchmark() {
        assert!(matches!(Benchmark::new("empty").validate(), Err(DefinitionError::NoPhases)));
    }

    #[test]
    fn rejects_duplicate_phase_names() {
        let benchmark = Benchmark::new("dup").phase(noop_phase("p")).phase(noop_phase("p"));
        assert!(matches!(benchmark.validate(), Err(DefinitionError::DuplicatePhase(_))));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let mut phase = noop_phase("p");
        phase.start_after.push("ghost".into());
        let benchmark = Benchmark::new("b").phase(phase);
        assert!(matches!(benchmark.validate(), Err(DefinitionError::UnknownDependency { .. })));
    }

    #[test]
    fn rejects_self_dependency() {
        let mut phase = noop_phase("p");
        phase.start_after_strict.push("p".into());
        let benchmark = Benchmark::new("b").phase(phase);
        assert!(matches!(benchmark.validate(), Err(DefinitionError::SelfDependency(_))));
    }

    #[test]
    fn rejects_dependency_cycles() {
        let mut a = noop_phase("a");
        a.start_after.push("b".into());
        let mut b = noop_phase("b");
        b.start_after_strict.push("a".into());
        let benchmark = Benchmark::new("b").phase(a).phase(b);
        assert!(matches!(benchmark.validate(), Err(DefinitionError::DependencyCycle(_))));
    }

    #[test]
    fn rejects_nonpositive_rates() {
        let benchmark = Benchmark::new("b").phase(
            Phase::builder()
                .name("bad")
                .model(ArrivalModel::ConstantPerSec {
                    rate: 0.0,
                    variance: false,
                    max_sessions: None,
                })
                .scenario(scenario())
                .duration(Duration::from_secs(1))
                .build(),
        );
        assert!(matches!(benchmark.validate(), Err(DefinitionError::InvalidPhase { .. })));
    }

    #[test]
    fn rejects_max_duration_below_duration() {
        let benchmark = Benchmark::new("b").phase(
            Phase::builder()
                .name("bad")
                .model(ArrivalModel::AtOnce { users: 1 })
                .scenario(scenario())
                .duration(Duration::from_secs(2))
                .max_duration(Duration::from_secs(1))
                .build(),
        );
        assert!(matches!(benchmark.validate(), Err(DefinitionError::InvalidPhase { .. })));
    }
}
