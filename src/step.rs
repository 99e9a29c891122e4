//! Steps: the smallest unit of scenario logic.
//!
//! A step is an immutable, stateless template shared by every instance of
//! its sequence. It has a guard — [`prepare`](Step::prepare), which may
//! declare data dependencies on session variables — and an effect,
//! [`invoke`](Step::invoke). The guard is how suspension works: a false
//! return blocks the whole sequence instance until a completion callback
//! re-enters the session, so a step never needs to know *how* a value it
//! waits for becomes available.

use std::sync::Arc;
use std::time::Duration;

use crate::error::SessionError;
use crate::session::{Session, VarRef};

/// Execution context of the sequence instance driving a step: the template's
/// statistics slot and the instance index used for scoped variables.
#[derive(Debug, Clone, Copy)]
pub struct StepCtx {
    pub sequence_id: usize,
    pub index: usize,
}

/// Scenario logic unit with a guard and an effect.
pub trait Step: Send + Sync {
    /// Variables this step needs before it can run. Checked by the default
    /// guard.
    fn dependencies(&self) -> &[VarRef] {
        &[]
    }

    /// Guard: true when the step can run now. The default requires every
    /// declared dependency to be set; overrides may add resource checks but
    /// must stay side-effect free on the blocked path.
    fn prepare(&self, session: &mut Session, ctx: StepCtx) -> Result<bool, SessionError> {
        for dependency in self.dependencies() {
            if !session.is_var_set(dependency, ctx.index)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn invoke(&self, session: &mut Session, ctx: StepCtx) -> Result<(), SessionError>;
}

/// Does nothing; useful as scenario filler and in synchronization-only
/// sequences.
pub struct NoopStep;

impl Step for NoopStep {
    fn invoke(&self, _session: &mut Session, _ctx: StepCtx) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Writes a constant into an int variable.
pub struct SetIntStep {
    var: VarRef,
    value: i64,
}

impl SetIntStep {
    pub fn new(var: VarRef, value: i64) -> Self {
        SetIntStep { var, value }
    }
}

impl Step for SetIntStep {
    fn invoke(&self, session: &mut Session, ctx: StepCtx) -> Result<(), SessionError> {
        session.set_int_at(self.var.key(), self.var.slot(ctx.index), self.value)
    }
}

/// Adds a delta to an already-set int variable.
pub struct AddToIntStep {
    var: VarRef,
    delta: i64,
}

impl AddToIntStep {
    pub fn new(var: VarRef, delta: i64) -> Self {
        AddToIntStep { var, delta }
    }
}

impl Step for AddToIntStep {
    fn invoke(&self, session: &mut Session, ctx: StepCtx) -> Result<(), SessionError> {
        session.add_to_int(self.var.key(), self.var.slot(ctx.index), self.delta)?;
        Ok(())
    }
}

/// Pure dependency barrier: blocks the sequence until the referenced
/// variable is set.
pub struct AwaitVarStep {
    var: [VarRef; 1],
}

impl AwaitVarStep {
    pub fn new(var: VarRef) -> Self {
        AwaitVarStep { var: [var] }
    }
}

impl Step for AwaitVarStep {
    fn dependencies(&self) -> &[VarRef] {
        &self.var
    }

    fn invoke(&self, _session: &mut Session, _ctx: StepCtx) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Completes the current sequence instance immediately; the remaining steps
/// never run.
pub struct BreakSequenceStep;

impl Step for BreakSequenceStep {
    fn invoke(&self, session: &mut Session, _ctx: StepCtx) -> Result<(), SessionError> {
        session.request_sequence_break();
        Ok(())
    }
}

/// Instantiates another sequence template by name, at a given instance
/// index.
pub struct NewSequenceStep {
    sequence: Arc<str>,
    index: usize,
}

impl NewSequenceStep {
    pub fn new(sequence: impl Into<Arc<str>>, index: usize) -> Self {
        NewSequenceStep { sequence: sequence.into(), index }
    }
}

impl Step for NewSequenceStep {
    fn invoke(&self, session: &mut Session, _ctx: StepCtx) -> Result<(), SessionError> {
        session.start_sequence(&self.sequence, self.index)
    }
}

/// Arms a think-time timer that sets the marker variable when it fires.
/// Pair with an [`AwaitVarStep`] on the same variable;
/// [`SequenceBuilder::think_time`](crate::scenario::SequenceBuilder::think_time)
/// adds both.
pub struct ScheduleDelayStep {
    var: VarRef,
    delay: Duration,
}

impl ScheduleDelayStep {
    pub fn new(var: VarRef, delay: Duration) -> Self {
        ScheduleDelayStep { var, delay }
    }
}

impl Step for ScheduleDelayStep {
    fn invoke(&self, session: &mut Session, ctx: StepCtx) -> Result<(), SessionError> {
        session.schedule_timer(self.var.key().clone(), self.var.slot(ctx.index), self.delay)
    }
}

/// Issues one request through the driver seam.
///
/// The guard checks the declared dependencies and reserves in-flight
/// capacity: a full request queue blocks the sequence, which is the
/// engine's backpressure mechanism. On completion the response status is
/// published to `response_var`, letting later steps gate on it.
pub struct RequestStep {
    target: Arc<str>,
    response_var: Option<VarRef>,
    dependencies: Vec<VarRef>,
}

impl RequestStep {
    pub fn new(target: impl Into<Arc<str>>) -> Self {
        RequestStep { target: target.into(), response_var: None, dependencies: Vec::new() }
    }

    /// Variable set to the response status when the request completes.
    pub fn with_response_var(mut self, var: VarRef) -> Self {
        self.response_var = Some(var);
        self
    }

    /// Gates the request on a variable produced by an earlier step.
    pub fn with_dependency(mut self, var: VarRef) -> Self {
        self.dependencies.push(var);
        self
    }
}

impl Step for RequestStep {
    fn dependencies(&self) -> &[VarRef] {
        &self.dependencies
    }

    fn prepare(&self, session: &mut Session, ctx: StepCtx) -> Result<bool, SessionError> {
        for dependency in self.dependencies() {
            if !session.is_var_set(dependency, ctx.index)? {
                return Ok(false);
            }
        }
        Ok(session.can_issue_request())
    }

    fn invoke(&self, session: &mut Session, ctx: StepCtx) -> Result<(), SessionError> {
        let response_var =
            self.response_var.as_ref().map(|v| (v.key().clone(), v.slot(ctx.index)));
        session.issue_request(self.target.clone(), ctx.sequence_id, response_var)
    }
}
