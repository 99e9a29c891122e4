//! The simulation runner: workers, timers and the lifecycle control loop.
//!
//! One run wires three kinds of tasks together:
//!
//! 1. **Workers** — each owns a shard of every phase's sessions and drains
//!    an event queue. All session state is touched only by its owning
//!    worker; completions, timers and wake-ups re-enter [`Session::run`]
//!    there. This is the single-writer discipline that makes the session
//!    layer lock-free.
//! 2. **Open-model scheduling tasks** — one per running open phase,
//!    consulting the phase's rate generator and sleeping until the next
//!    fire time.
//! 3. **The control loop** — advances wall-clock lifecycle transitions:
//!    finishes phases past their duration, terminates past `max_duration`,
//!    starts phases whose time and dependencies allow it, cancels phases
//!    whose dependencies failed, then sleeps until the earliest upcoming
//!    deadline or a status-change notification.
//!
//! When every phase is terminal the runner collects worker-local
//! statistics, merges them and returns a [`RunReport`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Notify};
use typed_builder::TypedBuilder;

use crate::benchmark::Benchmark;
use crate::driver::{Completion, Outcome, RequestDriver, SimDriver};
use crate::error::RunError;
use crate::phase::{PhaseHook, PhaseInstance, PhaseLinks, SessionHandle, Status};
use crate::session::{Dispatch, RunClock, RunStatus, Session};
use crate::stats::{PhaseReport, RunReport, SequenceReport, Statistics};

/// Cap on how long the control loop sleeps without re-scanning.
const MAX_CONTROL_SLEEP: Duration = Duration::from_secs(1);

/// Events delivered to a worker; everything that touches a session goes
/// through its owner's queue.
pub(crate) enum WorkerEvent {
    /// Start the pooled session in `slot`; open models stamp the intended
    /// fire time for scheduling-delay compensation.
    Start { slot: usize, fire_time_ns: Option<i64> },
    /// A driver finished the oldest outstanding request of `slot`.
    Complete { slot: usize, outcome: Outcome },
    /// A think-time timer elapsed; sets the marker variable.
    TimerFired { slot: usize, key: Arc<str>, index: usize },
    /// Re-run a session so it can observe a terminating phase.
    Wake { slot: usize },
    /// Merge and return per-phase statistics, then shut down.
    Collect { reply: oneshot::Sender<Vec<Vec<Statistics>>> },
}

struct SessionCell {
    session: Session,
    phase: Arc<PhaseInstance>,
    handle: SessionHandle,
}

struct Worker {
    id: usize,
    cells: Vec<SessionCell>,
    driver: Arc<dyn RequestDriver>,
    tx: UnboundedSender<WorkerEvent>,
    phase_count: usize,
}

impl Worker {
    async fn run(mut self, mut rx: UnboundedReceiver<WorkerEvent>) {
        tracing::debug!(worker = self.id, sessions = self.cells.len(), "worker started");
        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Start { slot, fire_time_ns } => {
                    let fire = fire_time_ns.unwrap_or_else(|| self.cells[slot].session.now_ns());
                    match self.cells[slot].session.start(fire) {
                        Ok(()) => self.drive(slot),
                        Err(error) => {
                            self.cells[slot].session.abort(error);
                            self.finish_session(slot);
                        }
                    }
                }
                WorkerEvent::Complete { slot, outcome } => {
                    if !self.cells[slot].session.has_outstanding_requests() {
                        tracing::trace!(worker = self.id, slot, "stale completion dropped");
                        continue;
                    }
                    match self.cells[slot].session.complete_request(outcome) {
                        Ok(()) => self.drive(slot),
                        Err(error) => {
                            self.cells[slot].session.abort(error);
                            self.finish_session(slot);
                        }
                    }
                }
                WorkerEvent::TimerFired { slot, key, index } => {
                    if !self.cells[slot].session.is_active() {
                        tracing::trace!(worker = self.id, slot, "stale timer dropped");
                        continue;
                    }
                    match self.cells[slot].session.set_int_at(&key, index, 1) {
                        Ok(()) => self.drive(slot),
                        Err(error) => {
                            self.cells[slot].session.abort(error);
                            self.finish_session(slot);
                        }
                    }
                }
                WorkerEvent::Wake { slot } => {
                    if self.cells[slot].session.is_active() {
                        self.drive(slot);
                    }
                }
                WorkerEvent::Collect { reply } => {
                    let _ = reply.send(self.collect());
                    break;
                }
            }
        }
        tracing::debug!(worker = self.id, "worker shutting down");
    }

    /// Runs the session until it blocks, restarting it in place whenever
    /// its phase asks for it (Always cohorts, Sequentially repeats,
    /// throttled-user compensation).
    fn drive(&mut self, slot: usize) {
        loop {
            let status = self.cells[slot].session.run();
            self.flush_dispatches(slot);
            match status {
                RunStatus::Blocked => break,
                RunStatus::Finished | RunStatus::Terminated | RunStatus::Failed => {
                    if !self.finish_session(slot) {
                        break;
                    }
                }
            }
        }
    }

    /// Reports a completed (or failed) session to its phase. Returns true
    /// when the session was restarted in place and should run again.
    fn finish_session(&mut self, slot: usize) -> bool {
        let cell = &mut self.cells[slot];
        if !cell.phase.notify_finished(Some(cell.handle)) {
            return false;
        }
        let now = cell.session.now_ns();
        match cell.session.start(now) {
            Ok(()) => true,
            Err(error) => {
                cell.session.abort(error);
                cell.phase.notify_finished(Some(cell.handle));
                false
            }
        }
    }

    /// Hands the session's pending work to the driver and the timer wheel.
    fn flush_dispatches(&mut self, slot: usize) {
        let driver = self.driver.clone();
        let tx = self.tx.clone();
        for dispatch in self.cells[slot].session.take_dispatches() {
            match dispatch {
                Dispatch::Request(request) => {
                    driver.dispatch(request, Completion::new(tx.clone(), slot));
                }
                Dispatch::Timer { key, index, delay } => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(WorkerEvent::TimerFired { slot, key, index });
                    });
                }
            }
        }
    }

    /// Merges this worker's session statistics per phase and sequence.
    fn collect(&mut self) -> Vec<Vec<Statistics>> {
        let mut merged: Vec<Vec<Statistics>> = (0..self.phase_count).map(|_| Vec::new()).collect();
        for cell in &mut self.cells {
            let target = &mut merged[cell.phase.index()];
            let stats = cell.session.statistics_mut();
            if target.is_empty() {
                target.extend((0..stats.len()).map(|_| Statistics::new()));
            }
            for (into, from) in target.iter_mut().zip(stats.iter()) {
                into.merge(from);
            }
        }
        merged
    }
}

/// Rate-driven session starts for one open-model phase: emit everything
/// due, sleep until the next fire time, stop once the phase finishes.
async fn open_model_loop(phase: Arc<PhaseInstance>, clock: RunClock) {
    let phase_start = phase.started_at_ns().expect("open model loop before phase start");
    loop {
        if phase.status().is_finished() {
            return;
        }
        let elapsed = clock.now_ns() - phase_start;
        let next = phase.on_open_tick(elapsed);
        if next == i64::MAX {
            // Rate ramped down to zero; nothing more will ever fire.
            return;
        }
        let deadline = clock.instant_at(phase_start + next);
        tokio::time::sleep_until(deadline.into()).await;
    }
}

fn default_driver() -> Arc<dyn RequestDriver> {
    Arc::new(SimDriver::default())
}

/// Executes one benchmark run in-process.
#[derive(TypedBuilder)]
pub struct SimulationRunner {
    benchmark: Benchmark,
    /// Worker tasks; sessions are sharded across them round-robin.
    #[builder(default = num_cpus::get().max(1))]
    workers: usize,
    /// The I/O seam; defaults to simulated 1ms responses.
    #[builder(default = default_driver())]
    driver: Arc<dyn RequestDriver>,
    /// Observer invoked on every phase status transition.
    #[builder(default, setter(strip_option))]
    on_phase_change: Option<PhaseHook>,
}

impl SimulationRunner {
    /// Validates the benchmark, reserves sessions, runs every phase to a
    /// terminal status and returns the merged report. A failed phase
    /// surfaces as [`RunError::PhaseFailed`].
    pub async fn run(self) -> Result<RunReport, RunError> {
        self.benchmark.validate()?;
        let SimulationRunner { benchmark, workers, driver, on_phase_change } = self;
        let Benchmark { name: benchmark_name, phases } = benchmark;

        let clock = RunClock::new();
        let notify = Arc::new(Notify::new());
        let instances: Vec<Arc<PhaseInstance>> = phases
            .into_iter()
            .enumerate()
            .map(|(index, def)| Arc::new(PhaseInstance::new(index, def, clock)))
            .collect();
        let by_name: HashMap<String, usize> = instances
            .iter()
            .map(|instance| (instance.name().to_string(), instance.index()))
            .collect();

        let worker_count = workers.max(1);
        let mut receivers = Vec::with_capacity(worker_count);
        let mut senders = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }

        let mut cells: Vec<Vec<SessionCell>> = (0..worker_count).map(|_| Vec::new()).collect();
        let mut next_session_id = 0u64;
        let mut round_robin = 0usize;
        for instance in &instances {
            let def = instance.definition();
            let reserved = def.model.max_sessions();
            let mut handles = Vec::with_capacity(reserved);
            for _ in 0..reserved {
                let worker = round_robin % worker_count;
                round_robin += 1;
                let slot = cells[worker].len();
                let mut session = Session::new(next_session_id, def.scenario.clone(), clock);
                next_session_id += 1;
                session.bind_phase(instance.clone());
                let handle = SessionHandle { worker, slot };
                cells[worker].push(SessionCell { session, phase: instance.clone(), handle });
                handles.push(handle);
            }
            tracing::debug!(phase = instance.name(), sessions = reserved, "sessions reserved");
            instance.attach(PhaseLinks {
                senders: senders.clone(),
                handles,
                hook: on_phase_change.clone(),
                notify: notify.clone(),
            });
        }

        let phase_count = instances.len();
        let worker_handles: Vec<_> = cells
            .into_iter()
            .enumerate()
            .zip(receivers)
            .map(|((id, cells), rx)| {
                let worker = Worker {
                    id,
                    cells,
                    driver: driver.clone(),
                    tx: senders[id].clone(),
                    phase_count,
                };
                tokio::spawn(worker.run(rx))
            })
            .collect();

        tracing::info!(
            benchmark = %benchmark_name,
            phases = phase_count,
            workers = worker_count,
            "run starting"
        );
        control_loop(&instances, &by_name, clock, &notify).await;

        tracing::info!(benchmark = %benchmark_name, "collecting statistics");
        let mut merged: Vec<Vec<Statistics>> = instances
            .iter()
            .map(|instance| {
                let sequences = instance.definition().scenario.sequences().len();
                (0..sequences).map(|_| Statistics::new()).collect()
            })
            .collect();
        let mut replies = Vec::with_capacity(worker_count);
        for sender in &senders {
            let (tx, rx) = oneshot::channel();
            let _ = sender.send(WorkerEvent::Collect { reply: tx });
            replies.push(rx);
        }
        for reply in replies {
            let Ok(worker_stats) = reply.await else { continue };
            for (phase_index, stats) in worker_stats.into_iter().enumerate() {
                for (into, from) in merged[phase_index].iter_mut().zip(&stats) {
                    into.merge(from);
                }
            }
        }
        join_all(worker_handles).await;

        let report = build_report(benchmark_name, &instances, merged);
        for instance in &instances {
            if let Some(error) = instance.error() {
                return Err(RunError::PhaseFailed {
                    phase: instance.name().to_string(),
                    error,
                });
            }
        }
        tracing::info!(benchmark = %report.benchmark, "run complete");
        Ok(report)
    }
}

/// Wall-clock lifecycle driver; mirrors the phase deadlines and dependency
/// gates until every phase reaches a terminal status.
async fn control_loop(
    instances: &[Arc<PhaseInstance>],
    by_name: &HashMap<String, usize>,
    clock: RunClock,
    notify: &Notify,
) {
    loop {
        let now_ns = clock.now_ns();
        for instance in instances {
            let def = instance.definition();
            match instance.status() {
                Status::Running => {
                    let started = instance.started_at_ns().expect("running phase start time");
                    if now_ns - started >= def.duration.as_nanos() as i64 {
                        instance.finish();
                    }
                }
                Status::Finished | Status::Terminating => {
                    let started = instance.started_at_ns().expect("finished phase start time");
                    let hard_cutoff = def.max_duration.map(|d| started + d.as_nanos() as i64);
                    if hard_cutoff.is_some_and(|deadline| now_ns >= deadline) {
                        instance.terminate();
                    } else if instance.status() == Status::Terminating
                        || def
                            .terminate_after_strict
                            .iter()
                            .all(|dep| instances[by_name[dep]].status().is_terminated())
                    {
                        instance.try_terminate();
                    }
                }
                Status::NotStarted => {
                    let dependency_doomed = def
                        .start_after
                        .iter()
                        .chain(&def.start_after_strict)
                        .any(|dep| {
                            let dependency = &instances[by_name[dep]];
                            dependency.error().is_some()
                                || dependency.status() == Status::Cancelled
                        });
                    if dependency_doomed {
                        instance.cancel();
                        continue;
                    }
                    let due = now_ns >= def.start_time.as_nanos() as i64;
                    let weak_ok = def
                        .start_after
                        .iter()
                        .all(|dep| instances[by_name[dep]].status().is_finished());
                    let strict_ok = def
                        .start_after_strict
                        .iter()
                        .all(|dep| instances[by_name[dep]].status().is_terminated());
                    if due && weak_ok && strict_ok {
                        instance.start(now_ns);
                        if def.model.is_open() {
                            tokio::spawn(open_model_loop(instance.clone(), clock));
                        }
                    }
                }
                _ => {}
            }
        }

        if instances.iter().all(|instance| instance.status().is_terminal()) {
            return;
        }

        // Sleep until the earliest deadline still in the future; everything
        // else (session completions, dependency satisfaction) arrives as a
        // status-change notification.
        let now_ns = clock.now_ns();
        let mut deadline_ns = i64::MAX;
        for instance in instances {
            let def = instance.definition();
            let candidate = match instance.status() {
                Status::NotStarted => def.start_time.as_nanos() as i64,
                Status::Running => {
                    instance.started_at_ns().unwrap_or(0) + def.duration.as_nanos() as i64
                }
                Status::Finished => match def.max_duration {
                    Some(max) => {
                        instance.started_at_ns().unwrap_or(0) + max.as_nanos() as i64
                    }
                    None => i64::MAX,
                },
                _ => i64::MAX,
            };
            if candidate > now_ns {
                deadline_ns = deadline_ns.min(candidate);
            }
        }
        let sleep_for = if deadline_ns == i64::MAX {
            MAX_CONTROL_SLEEP
        } else {
            Duration::from_nanos((deadline_ns - now_ns).max(1) as u64).min(MAX_CONTROL_SLEEP)
        };
        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}

fn build_report(
    benchmark: String,
    instances: &[Arc<PhaseInstance>],
    merged: Vec<Vec<Statistics>>,
) -> RunReport {
    let phases = instances
        .iter()
        .zip(merged)
        .map(|(instance, stats)| {
            let def = instance.definition();
            let status = instance.status();
            let error = instance.error();
            PhaseReport {
                name: def.name.clone(),
                status,
                success: error.is_none()
                    && !instance.session_limit_exceeded()
                    && status != Status::Cancelled,
                error: error.map(|e| e.to_string()),
                session_limit_exceeded: instance.session_limit_exceeded(),
                started_sessions: instance.started_sessions(),
                max_sessions_used: instance.max_sessions_used(),
                started_at_ms: instance.started_at_ns().map(|ns| ns as u64 / 1_000_000),
                terminated_at_ms: instance.terminated_at_ns().map(|ns| ns as u64 / 1_000_000),
                sequences: def
                    .scenario
                    .sequences()
                    .iter()
                    .zip(&stats)
                    .map(|(sequence, stat)| SequenceReport {
                        sequence: sequence.name().to_string(),
                        stats: stat.snapshot(),
                    })
                    .collect(),
            }
        })
        .collect();
    RunReport { benchmark, phases }
}
