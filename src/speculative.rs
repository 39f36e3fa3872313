//! Speculative execution of competing approaches.
//!
//! [`SpeculativeExecutor`] races N candidate approaches against one shared
//! input and returns a single winner under a configurable selection strategy.
//! Individual approach failures never surface as errors; they are captured
//! per-attempt and the caller reads the structured result. Cancellation is
//! cooperative: once a winner is found the executor stops waiting on losing
//! work, but it never forcibly reclaims a still-running callable.

mod executor;
mod types;

pub use executor::SpeculativeExecutor;
pub use types::{
    Approach, ApproachFn, AttemptRecord, ExecuteOptions, ExecutorConfig, QualityExtractor,
    SelectionStrategy, SpeculativeResult, StopSignal,
};
