//! ThresholdStore: CRUD operations against the threshold database.

use super::RouterError;

use crate::outcome::{format_timestamp, parse_timestamp};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::Row as _;
use sqlx::SqlitePool;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// One domain's threshold row.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdState {
    pub domain: String,
    pub base_threshold: f64,
    pub current_threshold: f64,
    /// Decayed success rate from the last retune; 0.0 until samples exist.
    pub success_rate: f64,
    pub sample_count: i64,
    pub last_updated: DateTime<Utc>,
}

/// One append-only audit row for a threshold change.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdHistoryEntry {
    pub domain: String,
    pub timestamp: DateTime<Utc>,
    pub old_threshold: f64,
    pub new_threshold: f64,
    pub trigger_reason: String,
    pub sample_count: i64,
}

/// One recorded routing outcome row.
#[derive(Debug, Clone)]
pub(super) struct RoutingOutcomeRow {
    pub complexity: f64,
    pub agent_loaded: bool,
    pub success: bool,
}

/// Wraps a dedicated SQLite connection pool for threshold state.
///
/// Separate from the outcome log so router read-modify-write cycles don't
/// contend with high-frequency outcome appends.
pub struct ThresholdStore {
    pool: SqlitePool,
}

impl ThresholdStore {
    /// Connect to (or create) the threshold database at the given path.
    pub async fn connect(path: &Path) -> Result<Arc<Self>, RouterError> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|error| RouterError::Validation(format!("invalid db path: {error}")))?
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

    /// Fetch the domain's threshold row, creating it at the base threshold on
    /// first reference.
    pub(super) async fn ensure_domain(
        &self,
        domain: &str,
        base_threshold: f64,
    ) -> Result<ThresholdState, RouterError> {
        sqlx::query(
            "INSERT OR IGNORE INTO adaptive_thresholds \
             (domain, base_threshold, current_threshold, success_rate, sample_count, last_updated) \
             VALUES (?, ?, ?, 0.0, 0, ?)",
        )
        .bind(domain)
        .bind(base_threshold)
        .bind(base_threshold)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM adaptive_thresholds WHERE domain = ?")
            .bind(domain)
            .fetch_one(&self.pool)
            .await?;
        Ok(row_to_state(row))
    }

    /// The domain's threshold row, if it exists. Unlike
    /// [`ensure_domain`](Self::ensure_domain) this never creates one.
    pub(super) async fn get_threshold(
        &self,
        domain: &str,
    ) -> Result<Option<ThresholdState>, RouterError> {
        let row = sqlx::query("SELECT * FROM adaptive_thresholds WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_state))
    }

    /// Write back a retuned threshold and its window stats.
    pub(super) async fn update_threshold(
        &self,
        domain: &str,
        current_threshold: f64,
        success_rate: f64,
        sample_count: i64,
    ) -> Result<(), RouterError> {
        sqlx::query(
            "UPDATE adaptive_thresholds SET current_threshold = ?, success_rate = ?, \
             sample_count = ?, last_updated = ? WHERE domain = ?",
        )
        .bind(current_threshold)
        .bind(success_rate)
        .bind(sample_count)
        .bind(format_timestamp(Utc::now()))
        .bind(domain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append one audit row for a threshold change.
    pub(super) async fn insert_history(
        &self,
        domain: &str,
        old_threshold: f64,
        new_threshold: f64,
        trigger_reason: &str,
        sample_count: i64,
    ) -> Result<(), RouterError> {
        sqlx::query(
            "INSERT INTO threshold_history \
             (domain, timestamp, old_threshold, new_threshold, trigger_reason, sample_count) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(domain)
        .bind(format_timestamp(Utc::now()))
        .bind(old_threshold)
        .bind(new_threshold)
        .bind(trigger_reason)
        .bind(sample_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append one routing outcome row.
    pub(super) async fn insert_outcome(
        &self,
        task_id: &str,
        domain: &str,
        complexity: f64,
        agent_used: Option<&str>,
        agent_loaded: bool,
        success: bool,
        quality_score: f64,
        user_corrections: i64,
    ) -> Result<(), RouterError> {
        sqlx::query(
            "INSERT INTO routing_outcomes \
             (id, task_id, domain, complexity, agent_used, agent_loaded, success, \
             quality_score, user_corrections, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(task_id)
        .bind(domain)
        .bind(complexity)
        .bind(agent_used)
        .bind(agent_loaded)
        .bind(success)
        .bind(quality_score)
        .bind(user_corrections)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The domain's trailing window, newest first.
    pub(super) async fn recent_outcomes(
        &self,
        domain: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RoutingOutcomeRow>, RouterError> {
        let rows = sqlx::query(
            "SELECT complexity, agent_loaded, success FROM routing_outcomes \
             WHERE domain = ? AND timestamp >= ? \
             ORDER BY timestamp DESC, rowid DESC LIMIT ?",
        )
        .bind(domain)
        .bind(format_timestamp(since))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RoutingOutcomeRow {
                complexity: row.get("complexity"),
                agent_loaded: row.get("agent_loaded"),
                success: row.get("success"),
            })
            .collect())
    }

    /// Total/success/agent-loaded counts for a domain's trailing window.
    pub(super) async fn window_counts(
        &self,
        domain: &str,
        since: DateTime<Utc>,
    ) -> Result<(i64, i64, i64), RouterError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(success), 0) AS successes, \
             COALESCE(SUM(agent_loaded), 0) AS agent_loads \
             FROM routing_outcomes WHERE domain = ? AND timestamp >= ?",
        )
        .bind(domain)
        .bind(format_timestamp(since))
        .fetch_one(&self.pool)
        .await?;
        Ok((
            row.get("total"),
            row.get("successes"),
            row.get("agent_loads"),
        ))
    }

    /// Recent threshold changes for a domain, newest first.
    pub(super) async fn history(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<ThresholdHistoryEntry>, RouterError> {
        let rows = sqlx::query(
            "SELECT * FROM threshold_history WHERE domain = ? \
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(domain)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let raw_timestamp: String = row.get("timestamp");
                ThresholdHistoryEntry {
                    domain: row.get("domain"),
                    timestamp: parse_timestamp(&raw_timestamp),
                    old_threshold: row.get("old_threshold"),
                    new_threshold: row.get("new_threshold"),
                    trigger_reason: row.get("trigger_reason"),
                    sample_count: row.get("sample_count"),
                }
            })
            .collect())
    }

    /// Every domain with a threshold row.
    pub(super) async fn all_domains(&self) -> Result<Vec<String>, RouterError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT domain FROM adaptive_thresholds ORDER BY domain ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(domain,)| domain).collect())
    }
}

impl std::fmt::Debug for ThresholdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThresholdStore").finish_non_exhaustive()
    }
}

fn row_to_state(row: SqliteRow) -> ThresholdState {
    let raw_updated: String = row.get("last_updated");
    ThresholdState {
        domain: row.get("domain"),
        base_threshold: row.get("base_threshold"),
        current_threshold: row.get("current_threshold"),
        success_rate: row.get("success_rate"),
        sample_count: row.get("sample_count"),
        last_updated: parse_timestamp(&raw_updated),
    }
}

/// Embedded schema for the threshold database.
///
/// All tables use `IF NOT EXISTS` so re-running is safe.
const SCHEMA_V1: &str = r#"
-- Per-domain adaptive thresholds
CREATE TABLE IF NOT EXISTS adaptive_thresholds (
    domain TEXT PRIMARY KEY,
    base_threshold REAL NOT NULL,
    current_threshold REAL NOT NULL,
    success_rate REAL NOT NULL DEFAULT 0.0,
    sample_count INTEGER NOT NULL DEFAULT 0,
    last_updated TEXT NOT NULL
);

-- Threshold change audit trail (append-only)
CREATE TABLE IF NOT EXISTS threshold_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    old_threshold REAL NOT NULL,
    new_threshold REAL NOT NULL,
    trigger_reason TEXT NOT NULL,
    sample_count INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_threshold_history_domain ON threshold_history(domain, timestamp);

-- Routing outcomes (append-only)
CREATE TABLE IF NOT EXISTS routing_outcomes (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    domain TEXT NOT NULL,
    complexity REAL NOT NULL,
    agent_used TEXT,
    agent_loaded INTEGER NOT NULL,
    success INTEGER NOT NULL,
    quality_score REAL NOT NULL,
    user_corrections INTEGER NOT NULL DEFAULT 0,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_routing_outcomes_domain ON routing_outcomes(domain, timestamp);
"#;
