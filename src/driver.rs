//! The seam between the engine and the wire-level I/O layer.
//!
//! The engine never speaks a protocol itself. Request-issuing steps hand an
//! [`OutboundRequest`] plus a [`Completion`] handle to the configured
//! [`RequestDriver`]; whenever the response (or failure) is known, the
//! driver delivers an [`Outcome`] through the handle, which re-enters the
//! owning session on its worker. Drivers must deliver completions for
//! requests of one session in issue order — that is the request queue's
//! FIFO contract.
//!
//! [`SimDriver`] stands in for a real protocol layer with a fixed simulated
//! latency, which keeps the engine exercisable end-to-end on its own.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::runner::WorkerEvent;

/// A request leaving the engine.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub session_id: u64,
    /// Opaque target label; the driver decides what it means.
    pub target: Arc<str>,
    /// Issue time, nanoseconds on the run clock.
    pub issued_ns: i64,
}

/// How a request ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Response { status: u16 },
    /// Transport-level failure; fails the issuing session.
    Error(String),
}

/// One-shot handle delivering a request's outcome back to its session.
pub struct Completion {
    tx: UnboundedSender<WorkerEvent>,
    slot: usize,
}

impl Completion {
    pub(crate) fn new(tx: UnboundedSender<WorkerEvent>, slot: usize) -> Self {
        Completion { tx, slot }
    }

    /// Delivers the outcome. Completions arriving after the run has torn
    /// down are silently dropped.
    pub fn deliver(self, outcome: Outcome) {
        let _ = self.tx.send(WorkerEvent::Complete { slot: self.slot, outcome });
    }
}

/// Asynchronous request issuance with completion callbacks.
pub trait RequestDriver: Send + Sync {
    fn dispatch(&self, request: OutboundRequest, completion: Completion);
}

/// Simulated I/O: answers every request with a configured outcome after a
/// fixed latency.
#[derive(Debug, Clone)]
pub struct SimDriver {
    latency: Duration,
    outcome: Outcome,
}

impl SimDriver {
    pub fn new(latency: Duration) -> Self {
        SimDriver { latency, outcome: Outcome::Response { status: 200 } }
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        SimDriver::new(Duration::from_millis(1))
    }
}

impl RequestDriver for SimDriver {
    fn dispatch(&self, request: OutboundRequest, completion: Completion) {
        tracing::trace!(
            session = request.session_id,
            target = %request.target,
            "simulated dispatch"
        );
        if self.latency.is_zero() {
            completion.deliver(self.outcome.clone());
            return;
        }
        let latency = self.latency;
        let outcome = self.outcome.clone();
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            completion.deliver(outcome);
        });
    }
}
