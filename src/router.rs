//! Adaptive complexity routing.
//!
//! [`AdaptiveRouter`] keeps one self-tuning numeric threshold per domain and
//! answers whether an expensive agent should be loaded for a task of a given
//! complexity. Thresholds move against a decayed window of recorded routing
//! outcomes and every material change lands in an append-only history table.
//! State lives in its own SQLite file, separate from the outcome log.

mod adaptive;
mod store;

pub use adaptive::{AdaptiveRouter, DomainStats, RouterConfig, RoutingDecision, RoutingOutcome};
pub use store::{ThresholdHistoryEntry, ThresholdState, ThresholdStore};

use thiserror::Error;

/// Adaptive router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Caller supplied an out-of-range field. Nothing was persisted.
    #[error("routing outcome validation failed: {0}")]
    Validation(String),

    #[error("threshold database error: {0}")]
    Database(#[from] sqlx::Error),
}
