//! Append-only outcome log and its analytics.
//!
//! [`OutcomeStore`] is the sole durable owner of decision outcomes and
//! experiment metadata, backed by a dedicated WAL-mode SQLite file. Writers
//! append; nothing is ever updated or deleted, so concurrent producers never
//! contend on rows. Read paths degrade to empty/zero results on storage
//! failure so dashboards stay non-fatal.

mod analytics;
mod experiments;
mod store;
mod types;

pub use store::OutcomeStore;
pub use types::{
    ApproachStats, Granularity, NewOutcome, Outcome, OutcomeQuery, StoreHealth, StoreStats,
    TrendPoint,
};

pub(crate) use types::{format_timestamp, parse_timestamp};

use thiserror::Error;

/// Outcome store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Caller supplied an out-of-range or malformed field. Nothing was
    /// persisted.
    #[error("outcome validation failed: {0}")]
    Validation(String),

    /// Caller supplied an id that already exists in the log.
    #[error("outcome id already recorded: {0}")]
    Conflict(String),

    #[error("outcome database error: {0}")]
    Database(#[from] sqlx::Error),
}
