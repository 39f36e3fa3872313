//! Experiment-table bookkeeping.
//!
//! The coordinator in `crate::experiment` delegates all durable experiment
//! state here so the outcome store stays the single owner of both tables.

use super::store::OutcomeStore;
use super::types::{format_timestamp, parse_timestamp, ApproachStats};
use super::StoreError;

use crate::experiment::{AssignmentStrategy, Experiment, ExperimentStatus};

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row as _;

use std::collections::HashMap;

impl OutcomeStore {
    /// Persist a newly created experiment.
    pub async fn insert_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        let variants = serde_json::to_string(&experiment.variants).unwrap_or_else(|_| "[]".into());
        let traffic_split =
            serde_json::to_string(&experiment.traffic_split).unwrap_or_else(|_| "[]".into());

        sqlx::query(
            "INSERT INTO experiments (id, name, description, variants, traffic_split, \
             success_metric, strategy, status, min_samples_per_variant, \
             significance_threshold, auto_conclude, early_stopping, early_stop_threshold, \
             start_time, end_time, winner, conclusion_reason) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&experiment.id)
        .bind(&experiment.name)
        .bind(&experiment.description)
        .bind(&variants)
        .bind(&traffic_split)
        .bind(&experiment.success_metric)
        .bind(experiment.strategy.as_str())
        .bind(experiment.status.as_str())
        .bind(experiment.min_samples_per_variant)
        .bind(experiment.significance_threshold)
        .bind(experiment.auto_conclude)
        .bind(experiment.early_stopping)
        .bind(experiment.early_stop_threshold)
        .bind(format_timestamp(experiment.start_time))
        .bind(experiment.end_time.map(format_timestamp))
        .bind(&experiment.winner)
        .bind(&experiment.conclusion_reason)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Point lookup by experiment id.
    pub async fn get_experiment(&self, id: &str) -> Result<Option<Experiment>, StoreError> {
        let row = sqlx::query("SELECT * FROM experiments WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(row_to_experiment))
    }

    /// All experiments, optionally filtered by status, newest first.
    pub async fn list_experiments(
        &self,
        status: Option<ExperimentStatus>,
    ) -> Result<Vec<Experiment>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM experiments WHERE status = ? ORDER BY start_time DESC",
                )
                .bind(status.as_str())
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM experiments ORDER BY start_time DESC")
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(rows.into_iter().map(row_to_experiment).collect())
    }

    /// Flip an experiment between active and paused.
    pub async fn update_experiment_status(
        &self,
        id: &str,
        status: ExperimentStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE experiments SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Terminal transition: record the winner and close the experiment.
    pub async fn conclude_experiment(
        &self,
        id: &str,
        winner: &str,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE experiments SET status = 'concluded', winner = ?, end_time = ?, \
             conclusion_reason = ? WHERE id = ?",
        )
        .bind(winner)
        .bind(format_timestamp(Utc::now()))
        .bind(reason)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Per-variant stats for one experiment, computed like approach
    /// comparison but filtered by variant_id. Read path: degrades to zeroed
    /// stats on storage failure.
    pub async fn variant_stats(
        &self,
        experiment_id: &str,
        variants: &[String],
    ) -> HashMap<String, ApproachStats> {
        let domain = format!("ab_test:{experiment_id}");
        let mut stats = HashMap::with_capacity(variants.len());
        for variant in variants {
            let entry = match self.variant_stats_inner(&domain, variant).await {
                Ok(entry) => entry,
                Err(error) => {
                    tracing::warn!(%error, variant, "variant stats query failed");
                    ApproachStats::default()
                }
            };
            stats.insert(variant.clone(), entry);
        }
        stats
    }

    async fn variant_stats_inner(
        &self,
        domain: &str,
        variant: &str,
    ) -> Result<ApproachStats, sqlx::Error> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(success), 0) AS successes, \
             AVG(quality_score) AS avg_quality, AVG(latency_ms) AS avg_latency \
             FROM outcomes WHERE domain = ? AND variant_id = ?",
        )
        .bind(domain)
        .bind(variant)
        .fetch_one(self.pool())
        .await?;

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
}

fn row_to_experiment(row: SqliteRow) -> Experiment {
    let raw_variants: String = row.get("variants");
    let raw_split: String = row.get("traffic_split");
    let raw_strategy: String = row.get("strategy");
    let raw_status: String = row.get("status");
    let raw_start: String = row.get("start_time");
    let raw_end: Option<String> = row.get("end_time");

    Experiment {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        variants: serde_json::from_str(&raw_variants).unwrap_or_default(),
        traffic_split: serde_json::from_str(&raw_split).unwrap_or_default(),
        success_metric: row.get("success_metric"),
        strategy: AssignmentStrategy::parse(&raw_strategy).unwrap_or(AssignmentStrategy::Random),
        status: ExperimentStatus::parse(&raw_status).unwrap_or(ExperimentStatus::Active),
        min_samples_per_variant: row.get("min_samples_per_variant"),
        significance_threshold: row.get("significance_threshold"),
        auto_conclude: row.get("auto_conclude"),
        early_stopping: row.get("early_stopping"),
        early_stop_threshold: row.get("early_stop_threshold"),
        start_time: parse_timestamp(&raw_start),
        end_time: raw_end.as_deref().map(parse_timestamp),
        winner: row.get("winner"),
        conclusion_reason: row.get("conclusion_reason"),
    }
}
