//! Aggregate analytics over the outcome log.
//!
//! Every read here degrades to empty/zero results on storage failure so
//! dashboards and reasoning paths stay non-fatal. Write-path errors still
//! propagate from `store.rs`.

use super::store::OutcomeStore;
use super::types::{format_timestamp, ApproachStats, Granularity, StoreHealth, StoreStats, TrendPoint};

use chrono::{Duration, Utc};
use sqlx::Row as _;

use std::collections::HashMap;

impl OutcomeStore {
    /// Fraction of successful outcomes within the trailing window.
    ///
    /// `domain` and `approach` narrow the slice when set. Returns 0.0 for an
    /// empty window and on storage failure.
    pub async fn success_rate(
        &self,
        domain: Option<&str>,
        approach: Option<&str>,
        days: u32,
    ) -> f64 {
        match self.windowed_counts(domain, approach, days).await {
            Ok((total, successes)) if total > 0 => successes as f64 / total as f64,
            Ok(_) => 0.0,
            Err(error) => {
                tracing::warn!(%error, "success_rate query failed, degrading to 0.0");
                0.0
            }
        }
    }

    /// Side-by-side stats for a set of approaches over the trailing window.
    ///
    /// Approaches with no recorded outcomes appear with zeroed stats so the
    /// caller always gets one entry per requested name.
    pub async fn approach_comparison(
        &self,
        approaches: &[String],
        domain: Option<&str>,
        days: u32,
    ) -> HashMap<String, ApproachStats> {
        let mut comparison = HashMap::with_capacity(approaches.len());
        for approach in approaches {
            let stats = match self.approach_stats(approach, domain, days).await {
                Ok(stats) => stats,
                Err(error) => {
                    tracing::warn!(%error, approach, "approach comparison query failed");
                    ApproachStats::default()
                }
            };
            comparison.insert(approach.clone(), stats);
        }
        comparison
    }

    /// Success-rate series bucketed by day or ISO week over the trailing
    /// window, oldest bucket first. Empty on storage failure.
    pub async fn trends(
        &self,
        domain: Option<&str>,
        granularity: Granularity,
        days: u32,
    ) -> Vec<TrendPoint> {
        match self.trends_inner(domain, granularity, days).await {
            Ok(points) => points,
            Err(error) => {
                tracing::warn!(%error, "trends query failed, degrading to empty");
                Vec::new()
            }
        }
    }

    /// Row counts plus a health flag. Never raises.
    pub async fn health_check(&self) -> StoreHealth {
        let counts = async {
            let (outcomes,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outcomes")
                .fetch_one(self.pool())
                .await?;
            let (experiments,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM experiments")
                .fetch_one(self.pool())
                .await?;
            Ok::<_, sqlx::Error>((outcomes, experiments))
        }
        .await;

        match counts {
            Ok((outcome_count, experiment_count)) => StoreHealth {
                healthy: true,
                outcome_count,
                experiment_count,
                error: None,
            },
            Err(error) => StoreHealth {
                healthy: false,
                outcome_count: 0,
                experiment_count: 0,
                error: Some(error.to_string()),
            },
        }
    }

    /// Row counts and log extent. Never raises; degrades to zeros.
    pub async fn stats(&self) -> StoreStats {
        match self.stats_inner().await {
            Ok(stats) => stats,
            Err(error) => {
                tracing::warn!(%error, "stats query failed, degrading to zeros");
                StoreStats::default()
            }
        }
    }

    /// Flat key-value snapshot for logging/dashboards.
    pub async fn export_metrics(&self) -> serde_json::Value {
        let stats = self.stats().await;
        let week_success_rate = self.success_rate(None, None, 7).await;
        serde_json::json!({
            "outcome_count": stats.outcome_count,
            "experiment_count": stats.experiment_count,
            "active_experiment_count": stats.active_experiment_count,
            "earliest_outcome": stats.earliest_outcome,
            "latest_outcome": stats.latest_outcome,
            "success_rate_7d": week_success_rate,
        })
    }

    // -- helpers ------------------------------------------------------------

    async fn windowed_counts(
        &self,
        domain: Option<&str>,
        approach: Option<&str>,
        days: u32,
    ) -> Result<(i64, i64), sqlx::Error> {
        let cutoff = format_timestamp(Utc::now() - Duration::days(i64::from(days)));

        let mut sql = String::from(
            "SELECT COUNT(*) AS total, COALESCE(SUM(success), 0) AS successes \
             FROM outcomes WHERE timestamp >= ?",
        );
        if domain.is_some() {
            sql.push_str(" AND domain = ?");
        }
        if approach.is_some() {
            sql.push_str(" AND approach = ?");
        }

        let mut stmt = sqlx::query(&sql).bind(&cutoff);
        if let Some(domain) = domain {
            stmt = stmt.bind(domain);
        }
        if let Some(approach) = approach {
            stmt = stmt.bind(approach);
        }

        let row = stmt.fetch_one(self.pool()).await?;
        Ok((row.get("total"), row.get("successes")))
    }

    async fn approach_stats(
        &self,
        approach: &str,
        domain: Option<&str>,
        days: u32,
    ) -> Result<ApproachStats, sqlx::Error> {
        let cutoff = format_timestamp(Utc::now() - Duration::days(i64::from(days)));

        let mut sql = String::from(
            "SELECT COUNT(*) AS total, COALESCE(SUM(success), 0) AS successes, \
             AVG(quality_score) AS avg_quality, AVG(latency_ms) AS avg_latency \
             FROM outcomes WHERE timestamp >= ? AND approach = ?",
        );
        if domain.is_some() {
            sql.push_str(" AND domain = ?");
        }

        let mut stmt = sqlx::query(&sql).bind(&cutoff).bind(approach);
        if let Some(domain) = domain {
            stmt = stmt.bind(domain);
        }

        let row = stmt.fetch_one(self.pool()).await?;
        let count: i64 = row.get("total");
        let success_count: i64 = row.get("successes");
        Ok(ApproachStats {
            count,
            success_count,
            success_rate: if count > 0 {
                success_count as f64 / count as f64
            } else {
                0.0
            },
            avg_quality: row.get("avg_quality"),
            avg_latency_ms: row.get("avg_latency"),
        })
    }

    async fn trends_inner(
        &self,
        domain: Option<&str>,
        granularity: Granularity,
        days: u32,
    ) -> Result<Vec<TrendPoint>, sqlx::Error> {
        let cutoff = format_timestamp(Utc::now() - Duration::days(i64::from(days)));
        let bucket = granularity.bucket_expr();

        let mut sql = format!(
            "SELECT {bucket} AS bucket, COUNT(*) AS total, \
             COALESCE(SUM(success), 0) AS successes \
             FROM outcomes WHERE timestamp >= ?"
        );
        if domain.is_some() {
            sql.push_str(" AND domain = ?");
        }
        sql.push_str(" GROUP BY bucket ORDER BY bucket ASC");

        let mut stmt = sqlx::query(&sql).bind(&cutoff);
        if let Some(domain) = domain {
            stmt = stmt.bind(domain);
        }

        let rows = stmt.fetch_all(self.pool()).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let total: i64 = row.get("total");
                let successes: i64 = row.get("successes");
                TrendPoint {
                    bucket: row.get("bucket"),
                    total,
                    successes,
                    success_rate: if total > 0 {
                        successes as f64 / total as f64
                    } else {
                        0.0
                    },
                }
            })
            .collect())
    }

    async fn stats_inner(&self) -> Result<StoreStats, sqlx::Error> {
        let (outcome_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outcomes")
            .fetch_one(self.pool())
            .await?;
        let (experiment_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM experiments")
            .fetch_one(self.pool())
            .await?;
        let (active_experiment_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM experiments WHERE status = 'active'")
                .fetch_one(self.pool())
                .await?;
        let extent: Option<(Option<String>, Option<String>)> =
            sqlx::query_as("SELECT MIN(timestamp), MAX(timestamp) FROM outcomes")
                .fetch_optional(self.pool())
                .await?;
        let (earliest_outcome, latest_outcome) = extent.unwrap_or((None, None));

        Ok(StoreStats {
            outcome_count,
            experiment_count,
            active_experiment_count,
            earliest_outcome,
            latest_outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::NewOutcome;

    use std::sync::Arc;

    async fn setup() -> Arc<OutcomeStore> {
        let path = std::env::temp_dir().join(format!(
            "arbiter_test_analytics_{}.db",
            uuid::Uuid::new_v4()
        ));
        OutcomeStore::connect(&path).await.unwrap()
    }

    async fn seed(store: &OutcomeStore, domain: &str, approach: &str, successes: u32, failures: u32) {
        for _ in 0..successes {
            store
                .record_outcome(NewOutcome::new(domain, approach, true))
                .await
                .unwrap();
        }
        for _ in 0..failures {
            store
                .record_outcome(NewOutcome::new(domain, approach, false))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_success_rate_is_successes_over_total_in_window() {
        let store = setup().await;
        seed(&store, "search", "rag", 3, 1).await;
        seed(&store, "codegen", "template", 0, 2).await;

        let rate = store.success_rate(Some("search"), None, 30).await;
        assert!((rate - 0.75).abs() < 1e-9, "expected 0.75, got {rate}");

        let overall = store.success_rate(None, None, 30).await;
        assert!((overall - 0.5).abs() < 1e-9, "expected 0.5, got {overall}");
    }

    #[tokio::test]
    async fn test_success_rate_empty_window_is_zero() {
        let store = setup().await;
        assert_eq!(store.success_rate(Some("nothing"), None, 30).await, 0.0);
    }

    #[tokio::test]
    async fn test_approach_comparison_includes_zeroed_entries() {
        let store = setup().await;
        store
            .record_outcome(
                NewOutcome::new("search", "rag", true)
                    .with_quality_score(0.9)
                    .with_latency_ms(100),
            )
            .await
            .unwrap();
        store
            .record_outcome(
                NewOutcome::new("search", "rag", false)
                    .with_quality_score(0.3)
                    .with_latency_ms(300),
            )
            .await
            .unwrap();

        let comparison = store
            .approach_comparison(&["rag".into(), "keyword".into()], Some("search"), 30)
            .await;

        let rag = &comparison["rag"];
        assert_eq!(rag.count, 2);
        assert_eq!(rag.success_count, 1);
        assert!((rag.success_rate - 0.5).abs() < 1e-9);
        assert!((rag.avg_quality.unwrap() - 0.6).abs() < 1e-9);
        assert!((rag.avg_latency_ms.unwrap() - 200.0).abs() < 1e-9);

        let keyword = &comparison["keyword"];
        assert_eq!(keyword.count, 0);
        assert_eq!(keyword.success_rate, 0.0);
        assert!(keyword.avg_quality.is_none());
    }

    #[tokio::test]
    async fn test_trends_bucket_by_day() {
        let store = setup().await;
        let base = Utc::now() - Duration::days(1);
        for (offset, success) in [(0, true), (0, false), (1, true)] {
            let mut new = NewOutcome::new("search", "rag", success);
            new.timestamp = Some(base + Duration::days(offset));
            store.record_outcome(new).await.unwrap();
        }

        let points = store.trends(Some("search"), Granularity::Day, 7).await;
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].total, 2);
        assert!((points[0].success_rate - 0.5).abs() < 1e-9);
        assert_eq!(points[1].total, 1);
        assert!((points[1].success_rate - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_health_check_reports_counts() {
        let store = setup().await;
        seed(&store, "search", "rag", 2, 0).await;

        let health = store.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.outcome_count, 2);
        assert_eq!(health.experiment_count, 0);
        assert!(health.error.is_none());
    }

    #[tokio::test]
    async fn test_export_metrics_has_flat_fields() {
        let store = setup().await;
        seed(&store, "search", "rag", 1, 1).await;

        let metrics = store.export_metrics().await;
        assert_eq!(metrics["outcome_count"], 2);
        assert!((metrics["success_rate_7d"].as_f64().unwrap() - 0.5).abs() < 1e-9);
    }
}
