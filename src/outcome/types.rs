//! Row and query types for the outcome log.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Default `LIMIT` applied when a query does not specify one.
pub(crate) const DEFAULT_QUERY_LIMIT: i64 = 100;

/// Render a timestamp in the fixed-width UTC form stored in SQLite.
///
/// RFC 3339 with microsecond precision and a `Z` suffix, so lexicographic
/// comparison in SQL matches chronological order.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp. Corrupt values fall back to the epoch rather
/// than failing a read path.
pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            tracing::warn!(raw, "unparseable stored timestamp");
            DateTime::<Utc>::UNIX_EPOCH
        })
}

/// One immutable decision outcome.
///
/// Created by any producer at decision-resolution time and never mutated.
/// `metadata` is an opaque JSON object owned by the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub domain: String,
    pub task_type: Option<String>,
    pub query_fingerprint: Option<String>,
    pub approach: String,
    pub variant_id: Option<String>,
    pub agent_used: Option<String>,
    pub success: bool,
    /// Heuristic output quality in `[0.0, 1.0]`.
    pub quality_score: Option<f64>,
    pub latency_ms: Option<i64>,
    pub error_kind: Option<String>,
    /// Explicit user feedback in `[1, 5]`.
    pub user_rating: Option<i64>,
    pub user_correction: bool,
    pub metadata: JsonValue,
}

/// Input for [`OutcomeStore::record_outcome`](super::OutcomeStore::record_outcome).
///
/// `id` and `timestamp` are auto-filled when absent. Callers wanting
/// idempotent re-submission omit `id`; supplying a duplicate fails with a
/// conflict error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewOutcome {
    pub id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub domain: String,
    pub task_type: Option<String>,
    pub query_fingerprint: Option<String>,
    pub approach: String,
    pub variant_id: Option<String>,
    pub agent_used: Option<String>,
    pub success: bool,
    pub quality_score: Option<f64>,
    pub latency_ms: Option<i64>,
    pub error_kind: Option<String>,
    pub user_rating: Option<i64>,
    pub user_correction: bool,
    pub metadata: JsonValue,
}

impl NewOutcome {
    pub fn new(domain: impl Into<String>, approach: impl Into<String>, success: bool) -> Self {
        Self {
            domain: domain.into(),
            approach: approach.into(),
            success,
            ..Self::default()
        }
    }

    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: i64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_error_kind(mut self, error_kind: impl Into<String>) -> Self {
        self.error_kind = Some(error_kind.into());
        self
    }

    pub fn with_variant_id(mut self, variant_id: impl Into<String>) -> Self {
        self.variant_id = Some(variant_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Filter for [`OutcomeStore::query_outcomes`](super::OutcomeStore::query_outcomes).
///
/// Unset fields match everything. Results are ordered newest-first and capped
/// at `limit` (default 100).
#[derive(Debug, Clone, Default)]
pub struct OutcomeQuery {
    pub domain: Option<String>,
    pub approach: Option<String>,
    pub variant_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Per-approach aggregate over a trailing window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApproachStats {
    pub count: i64,
    pub success_count: i64,
    pub success_rate: f64,
    pub avg_quality: Option<f64>,
    pub avg_latency_ms: Option<f64>,
}

/// Time-bucket width for trend queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Day,
    Week,
}

impl Granularity {
    /// SQLite expression that buckets the stored timestamp text.
    pub(crate) fn bucket_expr(&self) -> &'static str {
        match self {
            Self::Day => "date(timestamp)",
            Self::Week => "strftime('%Y-%W', timestamp)",
        }
    }
}

/// One point in a time-bucketed success-rate series.
#[derive(Debug, Clone, Serialize)]
pub struct TrendPoint {
    pub bucket: String,
    pub total: i64,
    pub successes: i64,
    pub success_rate: f64,
}

/// Result of [`OutcomeStore::health_check`](super::OutcomeStore::health_check).
/// Never fails; a broken store reports `healthy: false` with the error text.
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub healthy: bool,
    pub outcome_count: i64,
    pub experiment_count: i64,
    pub error: Option<String>,
}

/// Row counts and log extent for observability.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub outcome_count: i64,
    pub experiment_count: i64,
    pub active_experiment_count: i64,
    pub earliest_outcome: Option<String>,
    pub latest_outcome: Option<String>,
}
