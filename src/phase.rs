//! Phase definitions and the per-run phase state machine.
//!
//! A [`Phase`] describes one named period of load: an arrival model, timing,
//! and dependencies on other phases. A [`PhaseInstance`] is its runtime
//! counterpart — a monotonic status machine plus the atomic bookkeeping
//! that lets session completions (delivered on worker threads) race safely
//! with lifecycle transitions driven by the runner's clock.
//!
//! The only mutable state crossing threads is the atomic `status` and
//! `active_sessions` counter; the arrival model's scheduling cursor sits
//! behind a mutex that is only ever touched by one logical thread at a
//! time (the phase's scheduling task).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use typed_builder::TypedBuilder;

use crate::error::SessionError;
use crate::rate::RateGenerator;
use crate::runner::WorkerEvent;
use crate::scenario::Scenario;
use crate::session::RunClock;

/// Sentinel stored in `active_sessions` once the zero-to-terminated
/// transition has been claimed.
const TERMINATED_SENTINEL: i64 = i64::MIN;

/// Phase lifecycle states, in monotonic order: a phase's status never
/// regresses. `Starting` and `Finishing` belong to the orchestration
/// vocabulary (distributed controllers pass through them); the in-process
/// models transition straight to `Running` and `Finished`. `Cancelled` is
/// terminal and only ever entered from `NotStarted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    NotStarted,
    Starting,
    Running,
    Finishing,
    Finished,
    Terminating,
    Terminated,
    Cancelled,
}

impl Status {
    /// Past the point of starting new sessions.
    pub fn is_finished(self) -> bool {
        matches!(self, Status::Finished | Status::Terminating | Status::Terminated)
    }

    pub fn is_terminated(self) -> bool {
        self == Status::Terminated
    }

    /// Nothing will ever happen to this phase again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Terminated | Status::Cancelled)
    }

    fn from_u8(value: u8) -> Status {
        match value {
            0 => Status::NotStarted,
            1 => Status::Starting,
            2 => Status::Running,
            3 => Status::Finishing,
            4 => Status::Finished,
            5 => Status::Terminating,
            6 => Status::Terminated,
            7 => Status::Cancelled,
            _ => unreachable!("invalid status value {value}"),
        }
    }
}

/// How a phase starts sessions.
///
/// Closed models (`AtOnce`, `Always`, `Sequentially`) couple session starts
/// to session completions; open models (`ConstantPerSec`, `RampPerSec`)
/// schedule starts from a rate function regardless of completions, with the
/// `variance` flag switching from the deterministic schedule to Poisson
/// arrivals. `Noop` starts nothing and exists for dependency-only
/// synchronization points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArrivalModel {
    /// Starts `users` sessions immediately, then finishes.
    AtOnce { users: u32 },
    /// Keeps exactly `users` sessions active, restarting each on completion.
    Always { users: u32 },
    /// One session at a time, `repeats` times in total.
    Sequentially { repeats: u32 },
    ConstantPerSec { rate: f64, variance: bool, max_sessions: Option<u32> },
    RampPerSec { initial_rate: f64, target_rate: f64, variance: bool, max_sessions: Option<u32> },
    Noop,
}

impl ArrivalModel {
    pub fn is_open(&self) -> bool {
        matches!(self, ArrivalModel::ConstantPerSec { .. } | ArrivalModel::RampPerSec { .. })
    }

    /// Sessions reserved for this model. Open models default to one
    /// second's worth of arrivals at the peak rate.
    pub fn max_sessions(&self) -> usize {
        match *self {
            ArrivalModel::AtOnce { users } | ArrivalModel::Always { users } => users as usize,
            ArrivalModel::Sequentially { .. } => 1,
            ArrivalModel::ConstantPerSec { rate, max_sessions, .. } => {
                max_sessions.map(|n| n as usize).unwrap_or(rate.ceil() as usize).max(1)
            }
            ArrivalModel::RampPerSec { initial_rate, target_rate, max_sessions, .. } => {
                max_sessions
                    .map(|n| n as usize)
                    .unwrap_or(initial_rate.max(target_rate).ceil() as usize)
                    .max(1)
            }
            ArrivalModel::Noop => 0,
        }
    }

    fn rate_generator(&self, seed: u64, duration: Duration) -> Option<RateGenerator> {
        match *self {
            ArrivalModel::ConstantPerSec { rate, variance, .. } => Some(if variance {
                RateGenerator::poisson_constant_rate(seed, rate)
            } else {
                RateGenerator::constant_rate(rate)
            }),
            ArrivalModel::RampPerSec { initial_rate, target_rate, variance, .. } => {
                Some(if variance {
                    RateGenerator::poisson_ramp_rate(seed, initial_rate, target_rate, duration)
                } else {
                    RateGenerator::ramp_rate(initial_rate, target_rate, duration)
                })
            }
            _ => None,
        }
    }
}

/// Immutable definition of one phase.
#[derive(TypedBuilder)]
pub struct Phase {
    #[builder(setter(into))]
    pub name: String,
    pub model: ArrivalModel,
    #[builder(setter(into))]
    pub scenario: Arc<Scenario>,
    /// Offset from run start at which the phase becomes eligible to start.
    #[builder(default)]
    pub start_time: Duration,
    /// How long the phase keeps starting sessions once running.
    pub duration: Duration,
    /// Hard cutoff after which in-flight sessions are forcibly terminated.
    #[builder(default, setter(strip_option))]
    pub max_duration: Option<Duration>,
    /// Weak dependencies: those phases must be at least FINISHED.
    #[builder(default)]
    pub start_after: Vec<String>,
    /// Strong dependencies: those phases must be TERMINATED.
    #[builder(default)]
    pub start_after_strict: Vec<String>,
    /// This phase may not terminate before these are terminated.
    #[builder(default)]
    pub terminate_after_strict: Vec<String>,
    /// Finishing with more active sessions than this flags the phase.
    #[builder(default = u32::MAX)]
    pub max_unfinished_sessions: u32,
    /// Seed for the Poisson arrival draws.
    #[builder(default)]
    pub rng_seed: u64,
}

/// Where a pooled session lives: which worker owns it, at which slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionHandle {
    pub worker: usize,
    pub slot: usize,
}

/// Observer of phase status transitions; receives (phase name, new status,
/// success-so-far).
pub type PhaseHook = Arc<dyn Fn(&str, Status, bool) + Send + Sync>;

/// Runner-side wiring handed to the instance once sessions are reserved.
pub(crate) struct PhaseLinks {
    pub senders: Vec<UnboundedSender<WorkerEvent>>,
    pub handles: Vec<SessionHandle>,
    pub hook: Option<PhaseHook>,
    pub notify: Arc<Notify>,
}

struct ModelState {
    rate: Option<RateGenerator>,
    sequential_done: u32,
    fire_buf: Vec<i64>,
}

/// Runtime state machine of one phase in one run.
pub struct PhaseInstance {
    index: usize,
    def: Phase,
    clock: RunClock,
    status: AtomicU8,
    start_offset_ns: AtomicI64,
    terminated_at_ns: AtomicI64,
    active_sessions: AtomicI64,
    started_sessions: AtomicU64,
    throttled_users: AtomicU64,
    session_limit_exceeded: AtomicBool,
    error: Mutex<Option<SessionError>>,
    model_state: Mutex<ModelState>,
    session_pool: Mutex<crate::pool::Pool<SessionHandle>>,
    links: OnceLock<PhaseLinks>,
}

impl PhaseInstance {
    pub(crate) fn new(index: usize, def: Phase, clock: RunClock) -> Self {
        let rate = def.model.rate_generator(def.rng_seed, def.duration);
        PhaseInstance {
            index,
            def,
            clock,
            status: AtomicU8::new(Status::NotStarted as u8),
            start_offset_ns: AtomicI64::new(i64::MIN),
            terminated_at_ns: AtomicI64::new(i64::MIN),
            active_sessions: AtomicI64::new(0),
            started_sessions: AtomicU64::new(0),
            throttled_users: AtomicU64::new(0),
            session_limit_exceeded: AtomicBool::new(false),
            error: Mutex::new(None),
            model_state: Mutex::new(ModelState { rate, sequential_done: 0, fire_buf: Vec::new() }),
            session_pool: Mutex::new(crate::pool::Pool::from_objects(Vec::new())),
            links: OnceLock::new(),
        }
    }

    pub(crate) fn attach(&self, links: PhaseLinks) {
        *self.session_pool.lock().expect("session pool") =
            crate::pool::Pool::from_objects(links.handles.clone());
        if self.links.set(links).is_err() {
            panic!("phase links attached twice");
        }
    }

    fn links(&self) -> &PhaseLinks {
        self.links.get().expect("phase links not attached")
    }

    pub fn definition(&self) -> &Phase {
        &self.def
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Nanoseconds on the run clock at which the phase started.
    pub fn started_at_ns(&self) -> Option<i64> {
        let offset = self.start_offset_ns.load(Ordering::SeqCst);
        (offset != i64::MIN).then_some(offset)
    }

    pub fn terminated_at_ns(&self) -> Option<i64> {
        let offset = self.terminated_at_ns.load(Ordering::SeqCst);
        (offset != i64::MIN).then_some(offset)
    }

    pub fn started_sessions(&self) -> u64 {
        self.started_sessions.load(Ordering::SeqCst)
    }

    pub fn error(&self) -> Option<SessionError> {
        self.error.lock().expect("phase error").clone()
    }

    pub fn session_limit_exceeded(&self) -> bool {
        self.session_limit_exceeded.load(Ordering::SeqCst)
    }

    pub(crate) fn max_sessions_used(&self) -> usize {
        self.session_pool.lock().expect("session pool").max_used()
    }

    /// Moves the status forward, never backward; returns whether this call
    /// performed the transition. Fires the change hook exactly once per
    /// reached state.
    fn advance_status(&self, to: Status) -> bool {
        let mut current = self.status.load(Ordering::SeqCst);
        loop {
            if current >= to as u8 {
                return false;
            }
            match self.status.compare_exchange(
                current,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        tracing::debug!(phase = %self.def.name, status = ?to, "status change");
        if let Some(links) = self.links.get() {
            if let Some(hook) = &links.hook {
                let ok = self.error.lock().expect("phase error").is_none()
                    && !self.session_limit_exceeded.load(Ordering::SeqCst)
                    && to != Status::Cancelled;
                hook(&self.def.name, to, ok);
            }
            links.notify.notify_one();
        }
        true
    }

    /// Starts the phase: records the start time, reports RUNNING and runs
    /// the model-specific proceed logic. Open models are driven onward by
    /// their scheduling task.
    pub fn start(&self, now_ns: i64) {
        assert_eq!(self.status(), Status::NotStarted, "phase {} already started", self.def.name);
        self.start_offset_ns.store(now_ns, Ordering::SeqCst);
        self.advance_status(Status::Running);
        match self.def.model {
            ArrivalModel::AtOnce { users } => {
                for _ in 0..users {
                    self.start_new_session(None);
                }
                self.finish();
            }
            ArrivalModel::Always { users } => {
                for _ in 0..users {
                    self.start_new_session(None);
                }
            }
            ArrivalModel::Sequentially { .. } => {
                self.start_new_session(None);
            }
            ArrivalModel::ConstantPerSec { .. }
            | ArrivalModel::RampPerSec { .. }
            | ArrivalModel::Noop => {}
        }
    }

    /// Stops starting new sessions. Flags the phase when more sessions than
    /// `max_unfinished_sessions` are still active.
    pub fn finish(&self) {
        let active = self.active_sessions.load(Ordering::SeqCst).max(0) as u64;
        if active > u64::from(self.def.max_unfinished_sessions) {
            tracing::warn!(
                phase = %self.def.name,
                active,
                limit = self.def.max_unfinished_sessions,
                "unfinished session limit exceeded"
            );
            self.session_limit_exceeded.store(true, Ordering::SeqCst);
        }
        self.advance_status(Status::Finished);
    }

    /// Claims the zero-active transition to TERMINATED, or — when sessions
    /// are still draining under TERMINATING — wakes every reserved session
    /// so blocked ones observe the status and unwind.
    pub fn try_terminate(&self) {
        assert!(
            self.status().is_finished(),
            "terminate attempted on {} before finish",
            self.def.name
        );
        if self
            .active_sessions
            .compare_exchange(0, TERMINATED_SENTINEL, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.set_terminated();
        } else if self.status() == Status::Terminating {
            let links = self.links();
            for handle in &links.handles {
                let _ = links.senders[handle.worker].send(WorkerEvent::Wake { slot: handle.slot });
            }
        }
    }

    /// Hard cutoff: forces TERMINATING and drains in-flight sessions.
    pub fn terminate(&self) {
        if self.status().is_terminal() {
            return;
        }
        self.advance_status(Status::Terminating);
        self.try_terminate();
    }

    /// Idempotent; takes effect only once the phase is at least FINISHED.
    pub(crate) fn set_terminated(&self) {
        if !self.status().is_finished() {
            return;
        }
        if self.advance_status(Status::Terminated) {
            self.terminated_at_ns.store(self.clock.now_ns(), Ordering::SeqCst);
        }
    }

    /// Records the first failure and tears the phase down.
    pub fn fail(&self, error: SessionError) {
        tracing::error!(phase = %self.def.name, %error, "phase failed");
        {
            let mut guard = self.error.lock().expect("phase error");
            if guard.is_none() {
                *guard = Some(error);
            }
        }
        self.terminate();
    }

    /// Called by the runner on a never-started phase whose dependency
    /// failed or was cancelled.
    pub(crate) fn cancel(&self) {
        assert_eq!(self.status(), Status::NotStarted);
        tracing::debug!(phase = %self.def.name, "cancelled before start");
        self.advance_status(Status::Cancelled);
    }

    /// Acquires a session and schedules it onto its owning worker. Returns
    /// false when the phase is already past its end (a no-op) or the pool
    /// is exhausted (backpressure; the caller may count it as throttled).
    pub(crate) fn start_new_session(&self, fire_time_ns: Option<i64>) -> bool {
        let active = self.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        if active < 0 {
            // Already terminated; the sentinel absorbs the increment.
            return false;
        }
        tracing::trace!(phase = %self.def.name, active, "starting session");
        let acquired = self.session_pool.lock().expect("session pool").acquire();
        match acquired {
            Some(handle) => {
                self.started_sessions.fetch_add(1, Ordering::SeqCst);
                let links = self.links();
                let _ = links.senders[handle.worker]
                    .send(WorkerEvent::Start { slot: handle.slot, fire_time_ns });
                true
            }
            None => {
                tracing::trace!(phase = %self.def.name, "session pool exhausted");
                self.notify_finished(None);
                false
            }
        }
    }

    /// A session of this phase completed (or a speculative start failed,
    /// with no handle). Returns true when the caller should restart the
    /// session in place instead of releasing it: Always keeps its cohort
    /// saturated, Sequentially reruns up to its repeat count, and open
    /// models compensate throttled users with completed ones.
    pub(crate) fn notify_finished(&self, handle: Option<SessionHandle>) -> bool {
        if let Some(handle) = handle {
            if !self.status().is_finished() {
                match self.def.model {
                    ArrivalModel::Always { .. } => return true,
                    ArrivalModel::ConstantPerSec { .. } | ArrivalModel::RampPerSec { .. } => {
                        let mut throttled = self.throttled_users.load(Ordering::SeqCst);
                        while throttled != 0 {
                            match self.throttled_users.compare_exchange(
                                throttled,
                                throttled - 1,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            ) {
                                Ok(_) => return true,
                                Err(actual) => throttled = actual,
                            }
                        }
                    }
                    ArrivalModel::Sequentially { repeats } => {
                        let done = {
                            let mut state = self.model_state.lock().expect("model state");
                            state.sequential_done += 1;
                            state.sequential_done
                        };
                        if done < repeats {
                            return true;
                        }
                        self.advance_status(Status::Terminating);
                    }
                    _ => {}
                }
            }
            self.session_pool.lock().expect("session pool").release(handle);
        }
        let active = self.active_sessions.fetch_sub(1, Ordering::SeqCst) - 1;
        assert!(active >= 0, "phase {} has {} active sessions", self.def.name, active);
        tracing::trace!(phase = %self.def.name, active, "session finished");
        if active == 0
            && self.status().is_finished()
            && self
                .active_sessions
                .compare_exchange(0, TERMINATED_SENTINEL, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.set_terminated();
        }
        false
    }

    /// One scheduling pass of an open model: starts every session due by
    /// `elapsed_ns` and returns the next fire time (relative to phase
    /// start) to sleep until.
    pub(crate) fn on_open_tick(&self, elapsed_ns: i64) -> i64 {
        let phase_start = self.start_offset_ns.load(Ordering::SeqCst);
        let (mut due, next) = {
            let mut state = self.model_state.lock().expect("model state");
            let mut due = std::mem::take(&mut state.fire_buf);
            let generator =
                state.rate.as_mut().expect("open-model phase without rate generator");
            let next = generator.compute_next_fire_time(elapsed_ns, |t| due.push(t));
            (due, next)
        };
        for fire_ns in due.drain(..) {
            if self.status().is_finished() {
                // A start due after phase end is a no-op, not an error.
                break;
            }
            if !self.start_new_session(Some(phase_start + fire_ns))
                && !self.status().is_finished()
            {
                self.throttled_users.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.model_state.lock().expect("model state").fire_buf = due;
        next
    }
}
