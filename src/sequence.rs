//! Live cursors over sequence templates.
//!
//! A [`SequenceInstance`] is a pooled, reusable cursor over one sequence's
//! immutable step array. It is owned by exactly one session at a time:
//! acquired from the session's pool, re-bound to a template, advanced by
//! [`progress`](SequenceInstance::progress), and returned on completion.

use std::sync::Arc;

use crate::error::SessionError;
use crate::scenario::Sequence;
use crate::session::Session;
use crate::step::{Step, StepCtx};

/// A reusable cursor over an ordered list of steps.
pub struct SequenceInstance {
    name: Arc<str>,
    template_id: usize,
    index: usize,
    steps: Option<Arc<[Arc<dyn Step>]>>,
    current_step: usize,
}

impl SequenceInstance {
    /// A pooled placeholder bound to nothing.
    pub(crate) fn detached() -> Self {
        SequenceInstance {
            name: Arc::from(""),
            template_id: usize::MAX,
            index: 0,
            steps: None,
            current_step: 0,
        }
    }

    /// Re-binds this instance to a template. `index` disambiguates
    /// concurrently running copies of the same template and scopes
    /// per-instance variables.
    pub(crate) fn rebind(&mut self, template: &Sequence, index: usize) {
        self.name = template.name_arc();
        self.template_id = template.id();
        self.index = index;
        self.steps = Some(template.steps());
        self.current_step = 0;
    }

    /// Drops the template binding before the instance goes back to the pool.
    pub(crate) fn clear(&mut self) {
        self.steps = None;
        self.current_step = 0;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn template_id(&self) -> usize {
        self.template_id
    }

    pub(crate) fn is_completed(&self) -> bool {
        match &self.steps {
            Some(steps) => self.current_step >= steps.len(),
            None => true,
        }
    }

    /// Runs steps in declaration order while each guard passes.
    ///
    /// Returns true when at least one step was invoked. Returning false
    /// means the instance is blocked: the pending step's dependencies are
    /// unset or its resource guard failed, and nothing was executed.
    ///
    /// A step that requests a sequence break completes the instance
    /// immediately, without advancing past the remaining steps.
    pub(crate) fn progress(&mut self, session: &mut Session) -> Result<bool, SessionError> {
        let Some(steps) = self.steps.clone() else {
            return Ok(false);
        };
        let ctx = StepCtx { sequence_id: self.template_id, index: self.index };
        let mut progressed = false;
        while self.current_step < steps.len() {
            let step = &steps[self.current_step];
            if !step.prepare(session, ctx)? {
                tracing::trace!(
                    sequence = %self.name,
                    index = self.index,
                    step = self.current_step,
                    "sequence blocked"
                );
                return Ok(progressed);
            }
            step.invoke(session, ctx)?;
            progressed = true;
            if session.take_break_request() {
                self.current_step = steps.len();
                return Ok(true);
            }
            self.current_step += 1;
        }
        Ok(progressed)
    }
}
