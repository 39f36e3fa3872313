//! OutcomeStore: connection management and the append-only write path.

use super::types::{format_timestamp, parse_timestamp, NewOutcome, Outcome, OutcomeQuery};
use super::types::DEFAULT_QUERY_LIMIT;
use super::StoreError;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::Row as _;
use sqlx::SqlitePool;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Wraps a dedicated SQLite connection pool for the outcome log.
///
/// Separate from the threshold database so high-frequency outcome appends
/// don't contend with router read-modify-write cycles.
pub struct OutcomeStore {
    pool: SqlitePool,
}

impl OutcomeStore {
    /// Connect to (or create) the outcome database at the given path.
    ///
    /// Runs embedded migrations, enables WAL mode, and configures a small
    /// pool (one writer, one reader).
    pub async fn connect(path: &Path) -> Result<Arc<Self>, StoreError> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|error| StoreError::Validation(format!("invalid db path: {error}")))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA_V1).execute(&pool).await?;

        Ok(Arc::new(Self { pool }))
    }

    /// Expose pool for sibling modules that need direct query access.
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append one outcome and return its id.
    ///
    /// Validates `quality_score` and `user_rating` before touching storage;
    /// on violation nothing is persisted. An explicitly supplied duplicate id
    /// fails with [`StoreError::Conflict`].
    pub async fn record_outcome(&self, outcome: NewOutcome) -> Result<String, StoreError> {
        validate(&outcome)?;

        let id = outcome
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let timestamp = format_timestamp(outcome.timestamp.unwrap_or_else(Utc::now));
        let metadata = if outcome.metadata.is_null() {
            None
        } else {
            Some(outcome.metadata.to_string())
        };

        let result = sqlx::query(
            "INSERT INTO outcomes (id, timestamp, domain, task_type, query_fingerprint, \
             approach, variant_id, agent_used, success, quality_score, latency_ms, \
             error_kind, user_rating, user_correction, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&timestamp)
        .bind(&outcome.domain)
        .bind(&outcome.task_type)
        .bind(&outcome.query_fingerprint)
        .bind(&outcome.approach)
        .bind(&outcome.variant_id)
        .bind(&outcome.agent_used)
        .bind(outcome.success)
        .bind(outcome.quality_score)
        .bind(outcome.latency_ms)
        .bind(&outcome.error_kind)
        .bind(outcome.user_rating)
        .bind(outcome.user_correction)
        .bind(&metadata)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Conflict(id))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Append a batch of outcomes, each insert independent of its siblings.
    ///
    /// One element's failure does not roll back previously inserted items;
    /// callers get a per-element result in input order.
    pub async fn record_batch(
        &self,
        outcomes: Vec<NewOutcome>,
    ) -> Vec<Result<String, StoreError>> {
        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let result = self.record_outcome(outcome).await;
            if let Err(error) = &result {
                tracing::warn!(%error, "batch outcome insert failed");
            }
            results.push(result);
        }
        results
    }

    /// Point lookup by id.
    pub async fn get_outcome(&self, id: &str) -> Result<Option<Outcome>, StoreError> {
        let row = sqlx::query("SELECT * FROM outcomes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_outcome))
    }

    /// Filtered query over the log, ordered newest-first.
    pub async fn query_outcomes(&self, query: OutcomeQuery) -> Result<Vec<Outcome>, StoreError> {
        let mut sql = String::from("SELECT * FROM outcomes WHERE 1=1");
        if query.domain.is_some() {
            sql.push_str(" AND domain = ?");
        }
        if query.approach.is_some() {
            sql.push_str(" AND approach = ?");
        }
        if query.variant_id.is_some() {
            sql.push_str(" AND variant_id = ?");
        }
        if query.start.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        if query.end.is_some() {
            sql.push_str(" AND timestamp <= ?");
        }
        sql.push_str(" ORDER BY timestamp DESC, rowid DESC LIMIT ?");

        let mut stmt = sqlx::query(&sql);
        if let Some(domain) = &query.domain {
            stmt = stmt.bind(domain);
        }
        if let Some(approach) = &query.approach {
            stmt = stmt.bind(approach);
        }
        if let Some(variant_id) = &query.variant_id {
            stmt = stmt.bind(variant_id);
        }
        if let Some(start) = query.start {
            stmt = stmt.bind(format_timestamp(start));
        }
        if let Some(end) = query.end {
            stmt = stmt.bind(format_timestamp(end));
        }
        stmt = stmt.bind(query.limit.unwrap_or(DEFAULT_QUERY_LIMIT));

        let rows = stmt.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(row_to_outcome).collect())
    }
}

impl std::fmt::Debug for OutcomeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutcomeStore").finish_non_exhaustive()
    }
}

fn validate(outcome: &NewOutcome) -> Result<(), StoreError> {
    if let Some(score) = outcome.quality_score {
        if !(0.0..=1.0).contains(&score) {
            return Err(StoreError::Validation(format!(
                "quality_score {score} outside [0.0, 1.0]"
            )));
        }
    }
    if let Some(rating) = outcome.user_rating {
        if !(1..=5).contains(&rating) {
            return Err(StoreError::Validation(format!(
                "user_rating {rating} outside [1, 5]"
            )));
        }
    }
    if outcome.domain.is_empty() {
        return Err(StoreError::Validation("domain must not be empty".into()));
    }
    if outcome.approach.is_empty() {
        return Err(StoreError::Validation("approach must not be empty".into()));
    }
    Ok(())
}

pub(super) fn row_to_outcome(row: SqliteRow) -> Outcome {
    let raw_timestamp: String = row.get("timestamp");
    let raw_metadata: Option<String> = row.get("metadata");
    let metadata = raw_metadata
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or(serde_json::Value::Null);

    Outcome {
        id: row.get("id"),
        timestamp: parse_timestamp(&raw_timestamp),
        domain: row.get("domain"),
        task_type: row.get("task_type"),
        query_fingerprint: row.get("query_fingerprint"),
        approach: row.get("approach"),
        variant_id: row.get("variant_id"),
        agent_used: row.get("agent_used"),
        success: row.get("success"),
        quality_score: row.get("quality_score"),
        latency_ms: row.get("latency_ms"),
        error_kind: row.get("error_kind"),
        user_rating: row.get("user_rating"),
        user_correction: row.get("user_correction"),
        metadata,
    }
}

/// Embedded schema for the outcome database.
///
/// All tables use `IF NOT EXISTS` so re-running is safe.
const SCHEMA_V1: &str = r#"
-- Decision outcomes (append-only)
CREATE TABLE IF NOT EXISTS outcomes (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    domain TEXT NOT NULL,
    task_type TEXT,
    query_fingerprint TEXT,
    approach TEXT NOT NULL,
    variant_id TEXT,
    agent_used TEXT,
    success INTEGER NOT NULL,
    quality_score REAL,
    latency_ms INTEGER,
    error_kind TEXT,
    user_rating INTEGER,
    user_correction INTEGER NOT NULL DEFAULT 0,
    metadata TEXT
);
CREATE INDEX IF NOT EXISTS idx_outcomes_domain ON outcomes(domain, timestamp);
CREATE INDEX IF NOT EXISTS idx_outcomes_approach ON outcomes(approach, timestamp);
CREATE INDEX IF NOT EXISTS idx_outcomes_variant ON outcomes(variant_id, timestamp);

-- A/B experiment metadata
CREATE TABLE IF NOT EXISTS experiments (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    variants TEXT NOT NULL,
    traffic_split TEXT NOT NULL,
    success_metric TEXT NOT NULL DEFAULT 'success_rate',
    strategy TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    min_samples_per_variant INTEGER NOT NULL,
    significance_threshold REAL NOT NULL,
    auto_conclude INTEGER NOT NULL DEFAULT 0,
    early_stopping INTEGER NOT NULL DEFAULT 0,
    early_stop_threshold REAL NOT NULL DEFAULT 0.5,
    start_time TEXT NOT NULL,
    end_time TEXT,
    winner TEXT,
    conclusion_reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_experiments_status ON experiments(status);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::types::parse_timestamp;
    use serde_json::json;

    async fn setup() -> Arc<OutcomeStore> {
        let path = std::env::temp_dir().join(format!(
            "arbiter_test_outcomes_{}.db",
            uuid::Uuid::new_v4()
        ));
        OutcomeStore::connect(&path).await.unwrap()
    }

    #[tokio::test]
    async fn test_record_and_get_round_trips_every_field() {
        let store = setup().await;

        // Timestamp at microsecond precision so the stored form is lossless.
        let timestamp = parse_timestamp("2026-08-01T12:30:00.123456Z");
        let new = NewOutcome {
            id: Some("outcome-1".into()),
            timestamp: Some(timestamp),
            domain: "search".into(),
            task_type: Some("lookup".into()),
            query_fingerprint: Some("fp-abc".into()),
            approach: "rag".into(),
            variant_id: Some("rag".into()),
            agent_used: Some("researcher".into()),
            success: true,
            quality_score: Some(0.85),
            latency_ms: Some(412),
            error_kind: None,
            user_rating: Some(4),
            user_correction: false,
            metadata: json!({"model": "large", "retries": 1}),
        };

        let id = store.record_outcome(new).await.unwrap();
        assert_eq!(id, "outcome-1");

        let fetched = store.get_outcome(&id).await.unwrap().unwrap();
        assert_eq!(fetched.id, "outcome-1");
        assert_eq!(fetched.timestamp, timestamp);
        assert_eq!(fetched.domain, "search");
        assert_eq!(fetched.task_type.as_deref(), Some("lookup"));
        assert_eq!(fetched.query_fingerprint.as_deref(), Some("fp-abc"));
        assert_eq!(fetched.approach, "rag");
        assert_eq!(fetched.variant_id.as_deref(), Some("rag"));
        assert_eq!(fetched.agent_used.as_deref(), Some("researcher"));
        assert!(fetched.success);
        assert_eq!(fetched.quality_score, Some(0.85));
        assert_eq!(fetched.latency_ms, Some(412));
        assert_eq!(fetched.error_kind, None);
        assert_eq!(fetched.user_rating, Some(4));
        assert!(!fetched.user_correction);
        assert_eq!(fetched.metadata, json!({"model": "large", "retries": 1}));
    }

    #[tokio::test]
    async fn test_out_of_range_quality_score_rejected_before_persistence() {
        let store = setup().await;
        let new = NewOutcome::new("search", "rag", true).with_quality_score(1.5);
        let result = store.record_outcome(new).await;
        assert!(matches!(result, Err(StoreError::Validation(_))));

        // Nothing persisted.
        let rows = store.query_outcomes(OutcomeQuery::default()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_user_rating_rejected() {
        let store = setup().await;
        let mut new = NewOutcome::new("search", "rag", true);
        new.user_rating = Some(0);
        assert!(matches!(
            store.record_outcome(new).await,
            Err(StoreError::Validation(_))
        ));

        let mut new = NewOutcome::new("search", "rag", true);
        new.user_rating = Some(6);
        assert!(matches!(
            store.record_outcome(new).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_id_fails_with_conflict() {
        let store = setup().await;
        let mut new = NewOutcome::new("search", "rag", true);
        new.id = Some("dup".into());
        store.record_outcome(new.clone()).await.unwrap();

        let result = store.record_outcome(new).await;
        assert!(matches!(result, Err(StoreError::Conflict(id)) if id == "dup"));
    }

    #[tokio::test]
    async fn test_batch_failure_does_not_roll_back_siblings() {
        let store = setup().await;
        let batch = vec![
            NewOutcome::new("search", "rag", true),
            NewOutcome::new("search", "keyword", false).with_quality_score(2.0),
            NewOutcome::new("search", "rag", false),
        ];

        let results = store.record_batch(batch).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(StoreError::Validation(_))));
        assert!(results[2].is_ok());

        let rows = store.query_outcomes(OutcomeQuery::default()).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_query_filters_and_recency_order() {
        let store = setup().await;
        for (domain, approach, offset_secs) in [
            ("search", "rag", 30),
            ("search", "keyword", 20),
            ("codegen", "rag", 10),
        ] {
            let mut new = NewOutcome::new(domain, approach, true);
            new.timestamp = Some(
                parse_timestamp("2026-08-01T00:00:00.000000Z")
                    + chrono::Duration::seconds(offset_secs),
            );
            store.record_outcome(new).await.unwrap();
        }

        let search_only = store
            .query_outcomes(OutcomeQuery {
                domain: Some("search".into()),
                ..OutcomeQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(search_only.len(), 2);
        // Newest first.
        assert_eq!(search_only[0].approach, "rag");
        assert_eq!(search_only[1].approach, "keyword");

        let limited = store
            .query_outcomes(OutcomeQuery {
                limit: Some(1),
                ..OutcomeQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].domain, "search");
    }

    #[tokio::test]
    async fn test_get_outcome_not_found_returns_none() {
        let store = setup().await;
        assert!(store.get_outcome("missing").await.unwrap().is_none());
    }
}
