//! The per-virtual-user execution context.
//!
//! A [`Session`] holds everything one synthetic user needs across its
//! lifetime: declared variables, the array of currently enabled sequence
//! instances, the in-flight request queue, per-sequence statistics and a
//! non-owning reference to the phase that started it. Sessions are pooled —
//! allocated once when a phase reserves capacity, [`reset`](Session::reset)
//! between logical runs and returned to the pool, never freed mid-run.
//!
//! [`Session::run`] is the single re-entrant driver. Exactly one worker owns
//! a session for its whole lifetime, so there is no locking anywhere below
//! this level; completion callbacks re-enter `run` on the owning worker.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::driver::{Outcome, OutboundRequest};
use crate::error::SessionError;
use crate::phase::{PhaseInstance, Status};
use crate::pool::Pool;
use crate::queue::RequestQueue;
use crate::scenario::Scenario;
use crate::sequence::SequenceInstance;
use crate::stats::Statistics;

/// Monotonic run clock: all engine timestamps are nanoseconds since the
/// run's epoch.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    epoch: Instant,
}

impl RunClock {
    pub fn new() -> Self {
        RunClock { epoch: Instant::now() }
    }

    pub fn now_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    pub(crate) fn instant_at(&self, ns: i64) -> Instant {
        self.epoch + Duration::from_nanos(ns.max(0) as u64)
    }
}

impl Default for RunClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Which kind of value a variable slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Int,
    Object,
}

/// A variable declaration: key, kind, and slot count (1 for scalars, the
/// sequence concurrency for index-scoped variables).
#[derive(Debug, Clone)]
pub struct VarDecl {
    pub key: Arc<str>,
    pub kind: VarKind,
    pub slots: usize,
}

/// A read-only reference from a step to a session variable, used to test
/// whether a value is available yet. `scoped` references resolve through the
/// current sequence instance's index.
#[derive(Debug, Clone)]
pub struct VarRef {
    key: Arc<str>,
    scoped: bool,
}

impl VarRef {
    pub fn scalar(key: impl Into<Arc<str>>) -> Self {
        VarRef { key: key.into(), scoped: false }
    }

    pub fn scoped(key: impl Into<Arc<str>>) -> Self {
        VarRef { key: key.into(), scoped: true }
    }

    pub fn key(&self) -> &Arc<str> {
        &self.key
    }

    /// The concrete slot this reference resolves to for a sequence instance.
    pub fn slot(&self, instance_index: usize) -> usize {
        if self.scoped {
            instance_index
        } else {
            0
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct IntSlot {
    value: i64,
    set: bool,
}

#[derive(Default)]
struct ObjectSlot {
    value: Option<Box<dyn Any + Send>>,
}

enum Var {
    Int(Box<[IntSlot]>),
    Object(Box<[ObjectSlot]>),
}

impl Var {
    fn new(decl: &VarDecl) -> Self {
        let slots = decl.slots.max(1);
        match decl.kind {
            VarKind::Int => Var::Int(vec![IntSlot::default(); slots].into_boxed_slice()),
            VarKind::Object => {
                let mut v = Vec::with_capacity(slots);
                v.resize_with(slots, ObjectSlot::default);
                Var::Object(v.into_boxed_slice())
            }
        }
    }

    fn slots(&self) -> usize {
        match self {
            Var::Int(s) => s.len(),
            Var::Object(s) => s.len(),
        }
    }

    fn unset_all(&mut self) {
        match self {
            Var::Int(slots) => slots.iter_mut().for_each(|s| s.set = false),
            Var::Object(slots) => slots.iter_mut().for_each(|s| s.value = None),
        }
    }
}

/// Work the session asks its owning worker to hand off: a request for the
/// driver, or a think-time timer.
#[derive(Debug)]
pub(crate) enum Dispatch {
    Request(OutboundRequest),
    Timer { key: Arc<str>, index: usize, delay: Duration },
}

/// Result of one [`Session::run`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunStatus {
    /// No instance could progress; awaiting an external completion.
    Blocked,
    /// Every sequence completed; the session has been reset.
    Finished,
    /// The phase was terminating; in-flight work was abandoned.
    Terminated,
    /// A step failed; the session unwound and escalated to the phase.
    Failed,
}

/// One virtual user's reusable execution context.
pub struct Session {
    unique_id: u64,
    clock: RunClock,
    scenario: Arc<Scenario>,
    phase: Option<Arc<PhaseInstance>>,
    vars: HashMap<Arc<str>, Var>,
    sequence_pool: Pool<SequenceInstance>,
    running: Vec<SequenceInstance>,
    current: Option<(usize, usize)>,
    break_requested: bool,
    request_queue: RequestQueue,
    outbox: Vec<Dispatch>,
    statistics: Vec<Statistics>,
    scheduled_start_ns: i64,
    requests_issued: u64,
}

impl Session {
    pub(crate) fn new(unique_id: u64, scenario: Arc<Scenario>, clock: RunClock) -> Self {
        let mut vars = HashMap::with_capacity(scenario.var_decls().len());
        for decl in scenario.var_decls() {
            vars.insert(decl.key.clone(), Var::new(decl));
        }
        let max_sequences = scenario.max_sequences();
        Session {
            unique_id,
            clock,
            phase: None,
            vars,
            sequence_pool: Pool::new(max_sequences, SequenceInstance::detached),
            running: Vec::with_capacity(max_sequences),
            current: None,
            break_requested: false,
            request_queue: RequestQueue::new(scenario.max_requests()),
            outbox: Vec::new(),
            statistics: (0..scenario.sequences().len()).map(|_| Statistics::new()).collect(),
            scheduled_start_ns: 0,
            requests_issued: 0,
            scenario,
        }
    }

    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub(crate) fn bind_phase(&mut self, phase: Arc<PhaseInstance>) {
        self.phase = Some(phase);
    }

    fn phase_status(&self) -> Status {
        self.phase.as_ref().map(|p| p.status()).unwrap_or(Status::Running)
    }

    pub(crate) fn now_ns(&self) -> i64 {
        self.clock.now_ns()
    }

    /// Whether the session has enabled sequences; pooled sessions are
    /// inactive and ignore wake-ups.
    pub(crate) fn is_active(&self) -> bool {
        !self.running.is_empty()
    }

    pub(crate) fn has_outstanding_requests(&self) -> bool {
        !self.request_queue.is_empty()
    }

    /// Begins a logical run: instantiates the scenario's initial sequences.
    /// `scheduled_start_ns` is the intended fire time for open models, used
    /// for scheduling-delay compensation.
    pub(crate) fn start(&mut self, scheduled_start_ns: i64) -> Result<(), SessionError> {
        tracing::trace!(session = self.unique_id, "session starting");
        assert!(self.running.is_empty(), "started an active session");
        self.scheduled_start_ns = scheduled_start_ns;
        self.requests_issued = 0;
        let initial = self.scenario.clone();
        for &template_id in initial.initial_sequences() {
            self.instantiate(template_id, 0)?;
        }
        Ok(())
    }

    fn instantiate(&mut self, template_id: usize, index: usize) -> Result<(), SessionError> {
        let mut instance =
            self.sequence_pool.acquire().ok_or(SessionError::SequenceLimitExceeded)?;
        instance.rebind(&self.scenario.sequences()[template_id], index);
        if self.running.len() == self.running.capacity() {
            self.release_instance(instance);
            return Err(SessionError::SequenceLimitExceeded);
        }
        self.running.push(instance);
        Ok(())
    }

    /// Instantiates another sequence template by name; steps use this to
    /// fork scenario control flow mid-run.
    pub fn start_sequence(&mut self, name: &str, index: usize) -> Result<(), SessionError> {
        let template_id = self
            .scenario
            .sequence_id(name)
            .ok_or_else(|| SessionError::UnknownSequence(Arc::from(name)))?;
        self.instantiate(template_id, index)
    }

    fn release_instance(&mut self, mut instance: SequenceInstance) {
        instance.clear();
        self.sequence_pool.release(instance);
    }

    /// The re-entrant driver: advances every enabled sequence instance until
    /// the session blocks, finishes, or observes a terminating phase.
    ///
    /// The scan restarts whenever any instance makes progress, so a step
    /// unblocked by an earlier instance in the same pass runs immediately.
    pub(crate) fn run(&mut self) -> RunStatus {
        if self.phase_status() == Status::Terminated {
            tracing::trace!(session = self.unique_id, "run on terminated session");
            return RunStatus::Blocked;
        }
        tracing::trace!(
            session = self.unique_id,
            sequences = self.running.len(),
            "session run"
        );
        let mut last_progressed: Option<usize> = None;
        while !self.running.is_empty() {
            let mut progressed = false;
            let mut i = 0;
            while i < self.running.len() {
                if self.phase_status() == Status::Terminating {
                    self.unwind_terminating();
                    return RunStatus::Terminated;
                }
                if last_progressed == Some(i) {
                    break;
                }
                self.set_current(Some((self.running[i].template_id(), self.running[i].index())));
                let mut instance =
                    std::mem::replace(&mut self.running[i], SequenceInstance::detached());
                let result = instance.progress(self);
                self.set_current(None);
                match result {
                    Err(error) => {
                        self.release_instance(instance);
                        self.running.swap_remove(i);
                        self.abort(error);
                        return RunStatus::Failed;
                    }
                    Ok(step_made) => {
                        if step_made {
                            progressed = true;
                            last_progressed = Some(i);
                            if instance.is_completed() {
                                self.release_instance(instance);
                                self.running.swap_remove(i);
                                last_progressed = None;
                            } else {
                                self.running[i] = instance;
                            }
                        } else {
                            self.running[i] = instance;
                        }
                    }
                }
                i += 1;
            }
            if !progressed && !self.running.is_empty() {
                tracing::trace!(session = self.unique_id, "no progress, blocked");
                return RunStatus::Blocked;
            }
        }
        if self.has_outstanding_requests() {
            // Fire-and-forget requests still in flight; the session only
            // finishes once its channel has drained.
            tracing::trace!(session = self.unique_id, "sequences done, awaiting completions");
            return RunStatus::Blocked;
        }
        tracing::trace!(session = self.unique_id, "session finished");
        self.reset();
        RunStatus::Finished
    }

    /// Abandons all work because the phase is terminating: sequences go back
    /// to the pool, in-flight requests are recorded as aborted.
    fn unwind_terminating(&mut self) {
        tracing::trace!(session = self.unique_id, "phase terminating, session unwinding");
        self.current = None;
        while let Some(instance) = self.running.pop() {
            self.release_instance(instance);
        }
        while !self.request_queue.is_empty() {
            let entry = self.request_queue.complete();
            self.statistics[entry.stats_index].record_aborted();
        }
        self.reset();
    }

    /// Stops the session after a failure and escalates to the phase.
    pub(crate) fn abort(&mut self, error: SessionError) {
        tracing::debug!(session = self.unique_id, %error, "session failed");
        self.current = None;
        while let Some(instance) = self.running.pop() {
            self.release_instance(instance);
        }
        while !self.request_queue.is_empty() {
            let entry = self.request_queue.complete();
            self.statistics[entry.stats_index].record_aborted();
        }
        let phase = self.phase.clone();
        self.reset();
        if let Some(phase) = phase {
            phase.fail(error);
        }
    }

    /// Restores the unset state of every variable without reallocating any
    /// storage, making the session ready for its next logical run.
    pub(crate) fn reset(&mut self) {
        debug_assert!(self.current.is_none());
        debug_assert!(self.request_queue.is_empty());
        #[cfg(debug_assertions)]
        self.sequence_pool.check_full();
        for var in self.vars.values_mut() {
            var.unset_all();
        }
        self.break_requested = false;
    }

    /// Single-slot re-entrancy guard: the current sequence may only change
    /// from none to some and back. A step mutating it mid-progress is a bug.
    fn set_current(&mut self, current: Option<(usize, usize)>) {
        assert!(
            current.is_none() != self.current.is_none(),
            "current sequence set twice: {:?} -> {:?}",
            self.current,
            current
        );
        self.current = current;
    }

    /// Requests completion of the current sequence without advancing its
    /// cursor; consumed by the instance after the invoking step returns.
    pub fn request_sequence_break(&mut self) {
        assert!(self.current.is_some(), "sequence break outside a step");
        self.break_requested = true;
    }

    pub(crate) fn take_break_request(&mut self) -> bool {
        std::mem::take(&mut self.break_requested)
    }

    // --- variable access -------------------------------------------------

    fn var(&self, key: &str) -> Result<&Var, SessionError> {
        self.vars.get(key).ok_or_else(|| SessionError::VarNotDeclared(Arc::from(key)))
    }

    fn var_mut(&mut self, key: &str) -> Result<&mut Var, SessionError> {
        self.vars.get_mut(key).ok_or_else(|| SessionError::VarNotDeclared(Arc::from(key)))
    }

    fn check_slot(var: &Var, key: &str, index: usize) -> Result<(), SessionError> {
        if index >= var.slots() {
            return Err(SessionError::VarIndex {
                key: Arc::from(key),
                slots: var.slots(),
                index,
            });
        }
        Ok(())
    }

    pub fn get_int(&self, key: &str) -> Result<i64, SessionError> {
        self.get_int_at(key, 0)
    }

    pub fn get_int_at(&self, key: &str, index: usize) -> Result<i64, SessionError> {
        match self.var(key)? {
            Var::Int(slots) => {
                let slot = slots
                    .get(index)
                    .ok_or_else(|| SessionError::VarIndex {
                        key: Arc::from(key),
                        slots: slots.len(),
                        index,
                    })?;
                if !slot.set {
                    return Err(SessionError::VarNotSet(Arc::from(key)));
                }
                Ok(slot.value)
            }
            Var::Object(_) => Err(SessionError::VarType { key: Arc::from(key), expected: "int" }),
        }
    }

    pub fn set_int(&mut self, key: &str, value: i64) -> Result<(), SessionError> {
        self.set_int_at(key, 0, value)
    }

    pub fn set_int_at(&mut self, key: &str, index: usize, value: i64) -> Result<(), SessionError> {
        let id = self.unique_id;
        match self.var_mut(key)? {
            Var::Int(slots) => {
                let len = slots.len();
                let slot = slots.get_mut(index).ok_or_else(|| SessionError::VarIndex {
                    key: Arc::from(key),
                    slots: len,
                    index,
                })?;
                tracing::trace!(session = id, key, index, value, "var <-");
                slot.value = value;
                slot.set = true;
                Ok(())
            }
            Var::Object(_) => Err(SessionError::VarType { key: Arc::from(key), expected: "int" }),
        }
    }

    /// Adds to an already-set int variable; reading an unset one is an error.
    pub fn add_to_int(&mut self, key: &str, index: usize, delta: i64) -> Result<i64, SessionError> {
        let value = self.get_int_at(key, index)? + delta;
        self.set_int_at(key, index, value)?;
        Ok(value)
    }

    pub fn get_object(&self, key: &str) -> Result<&(dyn Any + Send), SessionError> {
        self.get_object_at(key, 0)
    }

    pub fn get_object_at(&self, key: &str, index: usize) -> Result<&(dyn Any + Send), SessionError> {
        match self.var(key)? {
            Var::Object(slots) => {
                let slot = slots.get(index).ok_or_else(|| SessionError::VarIndex {
                    key: Arc::from(key),
                    slots: slots.len(),
                    index,
                })?;
                slot.value
                    .as_deref()
                    .ok_or_else(|| SessionError::VarNotSet(Arc::from(key)))
            }
            Var::Int(_) => Err(SessionError::VarType { key: Arc::from(key), expected: "object" }),
        }
    }

    pub fn set_object_at(
        &mut self,
        key: &str,
        index: usize,
        value: Box<dyn Any + Send>,
    ) -> Result<(), SessionError> {
        let id = self.unique_id;
        match self.var_mut(key)? {
            Var::Object(slots) => {
                let len = slots.len();
                let slot = slots.get_mut(index).ok_or_else(|| SessionError::VarIndex {
                    key: Arc::from(key),
                    slots: len,
                    index,
                })?;
                tracing::trace!(session = id, key, index, "object var <-");
                slot.value = Some(value);
                Ok(())
            }
            Var::Int(_) => Err(SessionError::VarType { key: Arc::from(key), expected: "object" }),
        }
    }

    pub fn unset(&mut self, key: &str, index: usize) -> Result<(), SessionError> {
        match self.var_mut(key)? {
            Var::Int(slots) => {
                let len = slots.len();
                slots
                    .get_mut(index)
                    .ok_or_else(|| SessionError::VarIndex {
                        key: Arc::from(key),
                        slots: len,
                        index,
                    })?
                    .set = false;
            }
            Var::Object(slots) => {
                let len = slots.len();
                slots
                    .get_mut(index)
                    .ok_or_else(|| SessionError::VarIndex {
                        key: Arc::from(key),
                        slots: len,
                        index,
                    })?
                    .value = None;
            }
        }
        Ok(())
    }

    pub fn is_set(&self, key: &str, index: usize) -> Result<bool, SessionError> {
        let var = self.var(key)?;
        Self::check_slot(var, key, index)?;
        Ok(match var {
            Var::Int(slots) => slots[index].set,
            Var::Object(slots) => slots[index].value.is_some(),
        })
    }

    /// Resolves a step's [`VarRef`] against the current instance index.
    pub fn is_var_set(&self, reference: &VarRef, instance_index: usize) -> Result<bool, SessionError> {
        self.is_set(reference.key(), reference.slot(instance_index))
    }

    // --- requests and timers ---------------------------------------------

    /// Guard for request-issuing steps: false means the in-flight bound is
    /// reached and the sequence must block.
    pub fn can_issue_request(&self) -> bool {
        !self.request_queue.is_full()
    }

    /// Reserves an in-flight slot and hands the request to the owning
    /// worker's driver. The caller must have checked
    /// [`can_issue_request`](Self::can_issue_request).
    pub fn issue_request(
        &mut self,
        target: Arc<str>,
        stats_index: usize,
        response_var: Option<(Arc<str>, usize)>,
    ) -> Result<(), SessionError> {
        let start_ns = if self.scenario.compensate_scheduling_delay() && self.requests_issued == 0 {
            self.scheduled_start_ns
        } else {
            self.clock.now_ns()
        };
        self.requests_issued += 1;
        if let Some((key, index)) = &response_var {
            self.unset(key, *index)?;
        }
        self.statistics[stats_index].start(start_ns);
        let entry = self
            .request_queue
            .prepare()
            .expect("request queue full; guard must check can_issue_request");
        entry.start_ns = start_ns;
        entry.target = target.clone();
        entry.stats_index = stats_index;
        entry.response_var = response_var;
        self.outbox.push(Dispatch::Request(OutboundRequest {
            session_id: self.unique_id,
            target,
            issued_ns: start_ns,
        }));
        Ok(())
    }

    /// Arms a think-time timer that will set `key[index]` when it fires.
    pub fn schedule_timer(
        &mut self,
        key: Arc<str>,
        index: usize,
        delay: Duration,
    ) -> Result<(), SessionError> {
        self.unset(&key, index)?;
        self.outbox.push(Dispatch::Timer { key, index, delay });
        Ok(())
    }

    /// Applies a driver completion: pops the oldest in-flight request,
    /// records its latency and status, and publishes the response variable.
    pub(crate) fn complete_request(&mut self, outcome: Outcome) -> Result<(), SessionError> {
        let entry = self.request_queue.complete();
        let now = self.clock.now_ns();
        let stats = &mut self.statistics[entry.stats_index];
        stats.record_response((now - entry.start_ns).max(0) as u64);
        stats.end(now);
        match outcome {
            Outcome::Response { status } => {
                stats.add_status(status);
                if let Some((key, index)) = entry.response_var {
                    self.set_int_at(&key, index, i64::from(status))?;
                }
                Ok(())
            }
            Outcome::Error(reason) => {
                stats.add_status(0);
                Err(SessionError::RequestFailed { target: entry.target, reason })
            }
        }
    }

    pub(crate) fn take_dispatches(&mut self) -> std::vec::Drain<'_, Dispatch> {
        self.outbox.drain(..)
    }

    /// Statistics accumulators, one per sequence template.
    pub fn statistics(&self) -> &[Statistics] {
        &self.statistics
    }

    pub(crate) fn statistics_mut(&mut self) -> &mut [Statistics] {
        &mut self.statistics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{ScenarioBuilder, SequenceBuilder};
    use crate::step::{AwaitVarStep, NoopStep, RequestStep, SetIntStep};

    fn scenario(builder: ScenarioBuilder) -> Arc<Scenario> {
        Arc::new(builder.build().expect("valid scenario"))
    }

    fn session(scenario: Arc<Scenario>) -> Session {
        Session::new(1, scenario, RunClock::new())
    }

    fn simple_scenario() -> Arc<Scenario> {
        scenario(
            ScenarioBuilder::new("test")
                .declare_int("counter")
                .initial_sequence(SequenceBuilder::new("main").step(NoopStep)),
        )
    }

    mod vars {
        use super::*;

        #[test]
        fn unset_read_fails_fast() {
            let session = session(simple_scenario());
            assert!(matches!(session.get_int("counter"), Err(SessionError::VarNotSet(_))));
        }

        #[test]
        fn undeclared_read_fails_fast() {
            let session = session(simple_scenario());
            assert!(matches!(session.get_int("missing"), Err(SessionError::VarNotDeclared(_))));
        }

        #[test]
        fn write_then_read_returns_value() {
            let mut session = session(simple_scenario());
            session.set_int("counter", 42).unwrap();
            assert_eq!(session.get_int("counter").unwrap(), 42);
            assert_eq!(session.add_to_int("counter", 0, 8).unwrap(), 50);
            assert_eq!(session.get_int("counter").unwrap(), 50);
        }

        #[test]
        fn kind_mismatch_is_an_error() {
            let mut session = session(scenario(
                ScenarioBuilder::new("test")
                    .declare_object("blob")
                    .initial_sequence(SequenceBuilder::new("main").step(NoopStep)),
            ));
            assert!(matches!(session.set_int("blob", 1), Err(SessionError::VarType { .. })));
        }

        #[test]
        fn object_round_trip() {
            let mut session = session(scenario(
                ScenarioBuilder::new("test")
                    .declare_object("blob")
                    .initial_sequence(SequenceBuilder::new("main").step(NoopStep)),
            ));
            session.set_object_at("blob", 0, Box::new("payload".to_string())).unwrap();
            let value = session.get_object("blob").unwrap();
            assert_eq!(value.downcast_ref::<String>().unwrap(), "payload");
        }

        #[test]
        fn reset_restores_unset_without_reallocating() {
            let mut session = session(simple_scenario());
            session.set_int("counter", 7).unwrap();
            let storage_before = match session.vars.get("counter").unwrap() {
                Var::Int(slots) => slots.as_ptr(),
                _ => unreachable!(),
            };
            session.reset();
            assert!(matches!(session.get_int("counter"), Err(SessionError::VarNotSet(_))));
            let storage_after = match session.vars.get("counter").unwrap() {
                Var::Int(slots) => slots.as_ptr(),
                _ => unreachable!(),
            };
            assert_eq!(storage_before, storage_after);
        }

        #[test]
        fn scoped_slots_are_independent() {
            let mut session = session(scenario(
                ScenarioBuilder::new("test")
                    .declare_int_scoped("per-instance", 3)
                    .initial_sequence(SequenceBuilder::new("main").step(NoopStep)),
            ));
            session.set_int_at("per-instance", 2, 9).unwrap();
            assert!(!session.is_set("per-instance", 0).unwrap());
            assert!(session.is_set("per-instance", 2).unwrap());
            assert!(matches!(
                session.get_int_at("per-instance", 5),
                Err(SessionError::VarIndex { .. })
            ));
        }
    }

    mod run_loop {
        use super::*;

        #[test]
        fn noop_scenario_finishes_in_one_pass() {
            let mut session = session(simple_scenario());
            session.start(0).unwrap();
            assert_eq!(session.run(), RunStatus::Finished);
            assert!(!session.is_active());
        }

        #[test]
        fn blocked_step_suspends_until_var_is_set() {
            let mut session = session(scenario(
                ScenarioBuilder::new("test")
                    .declare_int("gate")
                    .declare_int("after")
                    .initial_sequence(
                        SequenceBuilder::new("main")
                            .step(AwaitVarStep::new(VarRef::scalar("gate")))
                            .step(SetIntStep::new(VarRef::scalar("after"), 1)),
                    ),
            ));
            session.start(0).unwrap();
            assert_eq!(session.run(), RunStatus::Blocked);
            assert!(matches!(session.get_int("after"), Err(SessionError::VarNotSet(_))));

            session.set_int("gate", 1).unwrap();
            assert_eq!(session.run(), RunStatus::Finished);
        }

        #[test]
        fn abort_unwinds_a_blocked_session() {
            let mut session = session(scenario(
                ScenarioBuilder::new("test")
                    .declare_int("gate")
                    .initial_sequence(
                        SequenceBuilder::new("main")
                            .step(AwaitVarStep::new(VarRef::scalar("gate"))),
                    ),
            ));
            session.start(0).unwrap();
            assert_eq!(session.run(), RunStatus::Blocked);
            session.abort(SessionError::StepFailed("boom".into()));
            assert!(!session.is_active());
            // The pooled session is reusable after the failure.
            session.start(0).unwrap();
            assert_eq!(session.run(), RunStatus::Blocked);
        }

        #[test]
        fn one_instance_unblocks_another_in_the_same_pass() {
            // First sequence blocks on a var the second one sets; the scan
            // restart picks the first back up in the same run call. The
            // keeper sequence holds the session open so the result is
            // observable.
            let mut session = session(scenario(
                ScenarioBuilder::new("test")
                    .declare_int("gate")
                    .declare_int("after")
                    .declare_int("!never")
                    .initial_sequence(
                        SequenceBuilder::new("blocked")
                            .step(AwaitVarStep::new(VarRef::scalar("gate")))
                            .step(SetIntStep::new(VarRef::scalar("after"), 2)),
                    )
                    .initial_sequence(
                        SequenceBuilder::new("setter")
                            .step(SetIntStep::new(VarRef::scalar("gate"), 1)),
                    )
                    .initial_sequence(
                        SequenceBuilder::new("keeper")
                            .step(AwaitVarStep::new(VarRef::scalar("!never"))),
                    ),
            ));
            session.start(0).unwrap();
            assert_eq!(session.run(), RunStatus::Blocked);
            assert_eq!(session.get_int("after").unwrap(), 2);
        }
    }

    mod requests {
        use super::*;

        fn request_scenario(max_requests: usize) -> Arc<Scenario> {
            scenario(
                ScenarioBuilder::new("test")
                    .max_requests(max_requests)
                    .declare_int("response")
                    .initial_sequence(
                        SequenceBuilder::new("hit")
                            .step(
                                RequestStep::new("/api")
                                    .with_response_var(VarRef::scalar("response")),
                            )
                            .step(AwaitVarStep::new(VarRef::scalar("response"))),
                    ),
            )
        }

        #[test]
        fn request_blocks_until_completion_sets_the_response() {
            let mut session = session(request_scenario(4));
            session.start(0).unwrap();
            assert_eq!(session.run(), RunStatus::Blocked);
            assert_eq!(session.take_dispatches().count(), 1);
            assert!(session.has_outstanding_requests());

            session.complete_request(Outcome::Response { status: 200 }).unwrap();
            assert_eq!(session.get_int("response").unwrap(), 200);
            assert_eq!(session.run(), RunStatus::Finished);
            assert_eq!(session.statistics()[0].requests(), 1);
        }

        #[test]
        fn full_queue_applies_backpressure() {
            let full = scenario(
                ScenarioBuilder::new("test")
                    .max_requests(1)
                    .initial_sequence(
                        SequenceBuilder::new("hits")
                            .step(RequestStep::new("/one"))
                            .step(RequestStep::new("/two")),
                    ),
            );
            let mut session = session(full);
            session.start(0).unwrap();
            assert_eq!(session.run(), RunStatus::Blocked);
            // Only the first request got out; the second is throttled.
            assert_eq!(session.take_dispatches().count(), 1);

            session.complete_request(Outcome::Response { status: 200 }).unwrap();
            // The second request goes out, and the session stays alive
            // until its completion drains.
            assert_eq!(session.run(), RunStatus::Blocked);
            assert_eq!(session.take_dispatches().count(), 1);
            session.complete_request(Outcome::Response { status: 200 }).unwrap();
            assert_eq!(session.run(), RunStatus::Finished);
        }

        #[test]
        fn failed_completion_is_a_session_error() {
            let mut session = session(request_scenario(4));
            session.start(0).unwrap();
            session.run();
            let result = session.complete_request(Outcome::Error("connection reset".into()));
            assert!(matches!(result, Err(SessionError::RequestFailed { .. })));
        }
    }
}
