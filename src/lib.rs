//! Outcome tracking and adaptive orchestration.
//!
//! `arbiter` routes tasks among competing approaches and learns from the
//! results. Three decision surfaces share one append-only outcome log:
//!
//! - [`speculative`] races N candidate approaches against one input and keeps
//!   the first (or best) success.
//! - [`experiment`] runs named A/B experiments over live traffic and declares
//!   statistically significant winners.
//! - [`router`] gates an expensive approach behind a per-domain complexity
//!   threshold that self-tunes from recorded outcomes.
//!
//! The [`outcome`] module owns the durable log and its analytics. Every
//! producer converges on the same table, so success rates sliced by domain or
//! approach reflect activity from all three surfaces.
//!
//! All state lives in local SQLite files created on first use; nothing here
//! talks to the network.

pub mod experiment;
pub mod outcome;
pub mod router;
pub mod speculative;

pub use experiment::{
    AssignmentStrategy, Experiment, ExperimentCoordinator, ExperimentError, ExperimentResults,
    ExperimentSpec, ExperimentStatus,
};
pub use outcome::{
    ApproachStats, Granularity, NewOutcome, Outcome, OutcomeQuery, OutcomeStore, StoreError,
    StoreHealth, StoreStats, TrendPoint,
};
pub use router::{
    AdaptiveRouter, DomainStats, RouterConfig, RouterError, RoutingDecision, RoutingOutcome,
    ThresholdStore,
};
pub use speculative::{
    Approach, ApproachFn, AttemptRecord, ExecuteOptions, ExecutorConfig, SelectionStrategy,
    SpeculativeExecutor, SpeculativeResult, StopSignal,
};
