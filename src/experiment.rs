//! A/B experiment coordination.
//!
//! [`ExperimentCoordinator`] defines named experiments over two or more
//! variants, assigns traffic per variant (random, weighted, or sticky),
//! records variant outcomes into the shared outcome log, and declares winners
//! once a chi-squared independence test clears the configured confidence
//! threshold. Pause/conclude state changes affect only subsequent variant
//! assignments, never already-recorded outcomes.

mod coordinator;
mod stats;
mod types;

pub use coordinator::ExperimentCoordinator;
pub use stats::{contingency_test, ChiSquared};
pub use types::{
    AssignmentStrategy, Experiment, ExperimentResults, ExperimentSpec, ExperimentStatus,
};

use crate::outcome::StoreError;
use thiserror::Error;

/// Experiment coordination errors.
#[derive(Debug, Error)]
pub enum ExperimentError {
    /// Malformed experiment definition: <2 variants, duplicate names, or a
    /// traffic split that doesn't sum to 1.0.
    #[error("experiment validation failed: {0}")]
    Validation(String),

    #[error("unknown experiment: {0}")]
    UnknownExperiment(String),

    #[error("unknown variant '{variant}' for experiment {experiment_id}")]
    UnknownVariant {
        experiment_id: String,
        variant: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
