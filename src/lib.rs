//! Stampede — a phase-driven load-generation engine for Rust.
//!
//! Stampede drives many concurrent synthetic user sessions against a target
//! according to a declarative workload: named phases, each with an arrival
//! model (a fixed cohort, saturating concurrency, or an open model firing
//! sessions from a rate function), its own duration and dependencies on
//! other phases. Open-model schedules are computed at nanosecond
//! granularity so that even six-figure arrival rates stay evenly spaced
//! instead of bursting on timer boundaries.
//!
//! The engine itself owns no protocol: steps hand requests to a pluggable
//! [`RequestDriver`] and get completions back through the session's owning
//! worker. Sessions, sequence instances and request slots are all pooled
//! and sized up front, so the steady-state hot path allocates nothing.
//!
//! # Architecture
//!
//! The main building blocks, leaf first:
//!
//! - [`RateGenerator`]: pure fire-time schedules for open arrival models.
//! - [`Pool`] and [`RequestQueue`]: fixed-capacity slots for sessions,
//!   sequence instances and in-flight requests; exhaustion is backpressure,
//!   never an error.
//! - [`Step`], [`Sequence`], [`Session`]: scenario logic. A step has a
//!   guard and an effect; a blocked guard suspends the whole sequence
//!   instance until a completion re-enters [`Session::run`] on the owning
//!   worker.
//! - [`Phase`] / [`PhaseInstance`]: the definition and the runtime state
//!   machine — a monotonic status plus atomic session accounting shared
//!   across worker threads.
//! - [`Benchmark`] and [`SimulationRunner`]: the workload description and
//!   the in-process orchestrator that takes every phase to a terminal
//!   status and returns a [`RunReport`].
//!
//! # Where to start
//!
//! Build a [`Scenario`] from sequences of steps, wrap phases around it,
//! validate them as a [`Benchmark`], and hand it to [`SimulationRunner`]:
//!
//! ```no_run
//! use std::time::Duration;
//! use stampede::{
//!     ArrivalModel, Benchmark, Phase, ScenarioBuilder, SequenceBuilder, SimulationRunner,
//!     RequestStep, VarRef,
//! };
//!
//! # async fn demo() -> Result<(), stampede::RunError> {
//! let scenario = ScenarioBuilder::new("browse")
//!     .declare_int("status")
//!     .initial_sequence(
//!         SequenceBuilder::new("front-page")
//!             .step(RequestStep::new("/").with_response_var(VarRef::scalar("status")))
//!             .think_time(Duration::from_millis(200)),
//!     )
//!     .build()?;
//!
//! let benchmark = Benchmark::new("smoke").phase(
//!     Phase::builder()
//!         .name("steady")
//!         .model(ArrivalModel::ConstantPerSec { rate: 100.0, variance: false, max_sessions: None })
//!         .scenario(scenario)
//!         .duration(Duration::from_secs(10))
//!         .build(),
//! );
//!
//! let report = SimulationRunner::builder().benchmark(benchmark).build().run().await?;
//! println!("{}", serde_json::to_string_pretty(&report).unwrap());
//! # Ok(())
//! # }
//! ```

/// Benchmark definitions and eager validation.
pub mod benchmark;
/// The seam to the wire-level I/O layer.
pub mod driver;
/// Error taxonomy.
pub mod error;
/// Phase definitions and the runtime state machine.
pub mod phase;
/// Fixed-capacity slot pools.
pub mod pool;
/// Bounded in-flight request queue.
pub mod queue;
/// Fire-time generation for open arrival models.
pub mod rate;
/// The simulation runner: workers and the lifecycle control loop.
pub mod runner;
/// Scenario, sequence and variable definitions.
pub mod scenario;
/// Sequence-instance cursors.
pub mod sequence;
/// The per-virtual-user execution context.
pub mod session;
/// Statistics accumulators and the run report.
pub mod stats;
/// Steps: guards and effects.
pub mod step;

pub use benchmark::Benchmark;
pub use driver::{Completion, OutboundRequest, Outcome, RequestDriver, SimDriver};
pub use error::{DefinitionError, RunError, SessionError};
pub use phase::{ArrivalModel, Phase, PhaseHook, PhaseInstance, Status};
pub use pool::Pool;
pub use queue::{RequestEntry, RequestQueue};
pub use rate::RateGenerator;
pub use runner::SimulationRunner;
pub use scenario::{Scenario, ScenarioBuilder, Sequence, SequenceBuilder};
pub use sequence::SequenceInstance;
pub use session::{RunClock, Session, VarKind, VarRef};
pub use stats::{PhaseReport, RunReport, SequenceReport, Statistics, StatisticsSnapshot};
pub use step::{
    AddToIntStep, AwaitVarStep, BreakSequenceStep, NewSequenceStep, NoopStep, RequestStep,
    ScheduleDelayStep, SetIntStep, Step, StepCtx,
};
