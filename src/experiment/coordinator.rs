//! ExperimentCoordinator: traffic assignment, outcome recording, and
//! significance checks.

use super::stats::contingency_test;
use super::types::{
    AssignmentStrategy, Experiment, ExperimentResults, ExperimentSpec, ExperimentStatus,
};
use super::ExperimentError;

use crate::outcome::{NewOutcome, OutcomeStore};

use chrono::Utc;
use sha2::{Digest, Sha256};

use tokio::sync::Mutex;

use std::collections::HashMap;
use std::sync::Arc;

/// Minimum per-variant sample size before early stopping may flag a variant.
const EARLY_STOP_MIN_SAMPLES: i64 = 30;

/// Permitted deviation of a traffic split's sum from 1.0.
const SPLIT_TOLERANCE: f64 = 0.01;

/// Coordinates named A/B experiments over the shared outcome log.
///
/// Durable experiment state lives in the [`OutcomeStore`]; the coordinator
/// holds only the sticky assignment map, which is scoped to this process and
/// dropped per-experiment at conclusion.
pub struct ExperimentCoordinator {
    store: Arc<OutcomeStore>,
    /// (experiment_id, user_id) → memoized variant.
    assignments: Mutex<HashMap<(String, String), String>>,
}

impl ExperimentCoordinator {
    pub fn new(store: Arc<OutcomeStore>) -> Self {
        Self {
            store,
            assignments: Mutex::new(HashMap::new()),
        }
    }

    /// Define a new experiment and return its id.
    pub async fn create_experiment(&self, spec: ExperimentSpec) -> Result<String, ExperimentError> {
        let variant_count = spec.variants.len();
        if variant_count < 2 {
            return Err(ExperimentError::Validation(format!(
                "experiment needs at least 2 variants, got {variant_count}"
            )));
        }
        let unique: std::collections::HashSet<&String> = spec.variants.iter().collect();
        if unique.len() != variant_count {
            return Err(ExperimentError::Validation(
                "variant names must be unique".into(),
            ));
        }
        if !(0.0..1.0).contains(&spec.significance_threshold) || spec.significance_threshold == 0.0
        {
            return Err(ExperimentError::Validation(format!(
                "significance_threshold {} outside (0, 1)",
                spec.significance_threshold
            )));
        }

        let traffic_split = match spec.traffic_split {
            Some(split) => {
                if split.len() != variant_count {
                    return Err(ExperimentError::Validation(format!(
                        "traffic_split has {} weights for {variant_count} variants",
                        split.len()
                    )));
                }
                let sum: f64 = split.iter().sum();
                if (sum - 1.0).abs() > SPLIT_TOLERANCE {
                    return Err(ExperimentError::Validation(format!(
                        "traffic_split sums to {sum:.4}, expected 1.0"
                    )));
                }
                split
            }
            None => vec![1.0 / variant_count as f64; variant_count],
        };

        let experiment = Experiment {
            id: uuid::Uuid::new_v4().to_string(),
            name: spec.name,
            description: spec.description,
            variants: spec.variants,
            traffic_split,
            success_metric: spec.success_metric,
            strategy: spec.strategy,
            status: ExperimentStatus::Active,
            min_samples_per_variant: spec.min_samples_per_variant,
            significance_threshold: spec.significance_threshold,
            auto_conclude: spec.auto_conclude,
            early_stopping: spec.early_stopping,
            early_stop_threshold: spec.early_stop_threshold,
            start_time: Utc::now(),
            end_time: None,
            winner: None,
            conclusion_reason: None,
        };

        self.store.insert_experiment(&experiment).await?;
        tracing::info!(
            experiment_id = %experiment.id,
            name = %experiment.name,
            variants = experiment.variants.len(),
            strategy = experiment.strategy.as_str(),
            "experiment created",
        );
        Ok(experiment.id)
    }

    /// Assign a variant for one request.
    ///
    /// Paused experiments route everything to the first variant; concluded
    /// ones to the declared winner. Sticky assignment memoizes per user and
    /// is idempotent on repeat calls.
    pub async fn get_variant(
        &self,
        experiment_id: &str,
        user_id: Option<&str>,
    ) -> Result<String, ExperimentError> {
        let experiment = self.require_experiment(experiment_id).await?;

        match experiment.status {
            ExperimentStatus::Paused => Ok(experiment.variants[0].clone()),
            ExperimentStatus::Concluded => Ok(experiment
                .winner
                .clone()
                .unwrap_or_else(|| experiment.variants[0].clone())),
            ExperimentStatus::Active => match (experiment.strategy, user_id) {
                (AssignmentStrategy::Sticky, Some(user)) => {
                    let key = (experiment.id.clone(), user.to_owned());
                    let mut assignments = self.assignments.lock().await;
                    if let Some(existing) = assignments.get(&key) {
                        return Ok(existing.clone());
                    }
                    let roll = sticky_fraction(&experiment.id, user);
                    let variant =
                        pick_variant(&experiment.variants, &experiment.traffic_split, roll);
                    assignments.insert(key, variant.clone());
                    Ok(variant)
                }
                // Sticky without a user id degenerates to a fresh draw.
                _ => Ok(pick_variant(
                    &experiment.variants,
                    &experiment.traffic_split,
                    rand::random::<f64>(),
                )),
            },
        }
    }

    /// Record one realized variant outcome.
    ///
    /// Persists an outcome under domain `ab_test:<id>` so cross-cutting
    /// analytics see experiment traffic. With `auto_conclude` set, a
    /// significance check runs after every record.
    pub async fn record_outcome(
        &self,
        experiment_id: &str,
        variant: &str,
        success: bool,
        quality_score: Option<f64>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), ExperimentError> {
        let experiment = self.require_experiment(experiment_id).await?;
        if !experiment.variants.iter().any(|v| v == variant) {
            return Err(ExperimentError::UnknownVariant {
                experiment_id: experiment_id.to_owned(),
                variant: variant.to_owned(),
            });
        }

        let mut outcome = NewOutcome::new(
            format!("ab_test:{experiment_id}"),
            variant.to_owned(),
            success,
        )
        .with_variant_id(variant.to_owned());
        outcome.quality_score = quality_score;
        if let Some(metadata) = metadata {
            outcome.metadata = metadata;
        }
        self.store.record_outcome(outcome).await?;

        if experiment.auto_conclude && experiment.status == ExperimentStatus::Active {
            let results = self.compute_results(&experiment).await;
            if results.is_significant {
                if let Some(winner) = &results.winner {
                    let reason =
                        format!("auto-concluded at confidence {:.3}", results.confidence);
                    self.conclude_experiment(experiment_id, winner, Some(&reason))
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Current per-variant stats plus the significance verdict.
    pub async fn get_results(
        &self,
        experiment_id: &str,
    ) -> Result<ExperimentResults, ExperimentError> {
        let experiment = self.require_experiment(experiment_id).await?;
        Ok(self.compute_results(&experiment).await)
    }

    /// Terminal transition: declare a winner and stop assigning traffic to
    /// the losers.
    pub async fn conclude_experiment(
        &self,
        experiment_id: &str,
        winner: &str,
        reason: Option<&str>,
    ) -> Result<(), ExperimentError> {
        let experiment = self.require_experiment(experiment_id).await?;
        if !experiment.variants.iter().any(|v| v == winner) {
            return Err(ExperimentError::UnknownVariant {
                experiment_id: experiment_id.to_owned(),
                variant: winner.to_owned(),
            });
        }

        self.store
            .conclude_experiment(experiment_id, winner, reason)
            .await?;

        // Sticky assignments are scoped to the experiment's lifetime.
        self.assignments
            .lock()
            .await
            .retain(|(id, _), _| id != experiment_id);

        tracing::info!(
            %experiment_id,
            winner,
            reason = reason.unwrap_or("manual"),
            "experiment concluded",
        );
        Ok(())
    }

    /// Park an active experiment; reversible via [`resume_experiment`](Self::resume_experiment).
    pub async fn pause_experiment(&self, experiment_id: &str) -> Result<(), ExperimentError> {
        let experiment = self.require_experiment(experiment_id).await?;
        if experiment.status != ExperimentStatus::Active {
            return Err(ExperimentError::Validation(format!(
                "cannot pause experiment in status '{}'",
                experiment.status.as_str()
            )));
        }
        self.store
            .update_experiment_status(experiment_id, ExperimentStatus::Paused)
            .await?;
        tracing::info!(%experiment_id, "experiment paused");
        Ok(())
    }

    /// Reactivate a paused experiment.
    pub async fn resume_experiment(&self, experiment_id: &str) -> Result<(), ExperimentError> {
        let experiment = self.require_experiment(experiment_id).await?;
        if experiment.status != ExperimentStatus::Paused {
            return Err(ExperimentError::Validation(format!(
                "cannot resume experiment in status '{}'",
                experiment.status.as_str()
            )));
        }
        self.store
            .update_experiment_status(experiment_id, ExperimentStatus::Active)
            .await?;
        tracing::info!(%experiment_id, "experiment resumed");
        Ok(())
    }

    /// All experiments, optionally filtered by status.
    pub async fn list_experiments(
        &self,
        status: Option<ExperimentStatus>,
    ) -> Result<Vec<Experiment>, ExperimentError> {
        Ok(self.store.list_experiments(status).await?)
    }

    // -- helpers ------------------------------------------------------------

    async fn require_experiment(&self, id: &str) -> Result<Experiment, ExperimentError> {
        self.store
            .get_experiment(id)
            .await?
            .ok_or_else(|| ExperimentError::UnknownExperiment(id.to_owned()))
    }

    async fn compute_results(&self, experiment: &Experiment) -> ExperimentResults {
        let variants = self
            .store
            .variant_stats(&experiment.id, &experiment.variants)
            .await;

        let underperforming_variants = if experiment.early_stopping {
            underperformers(experiment, &variants)
        } else {
            Vec::new()
        };

        let starving: Vec<&String> = experiment
            .variants
            .iter()
            .filter(|variant| {
                variants
                    .get(*variant)
                    .map(|stats| stats.count < experiment.min_samples_per_variant)
                    .unwrap_or(true)
            })
            .collect();

        if !starving.is_empty() {
            let names: Vec<&str> = starving.iter().map(|s| s.as_str()).collect();
            return ExperimentResults {
                experiment_id: experiment.id.clone(),
                status: experiment.status,
                is_significant: false,
                confidence: 0.0,
                winner: None,
                underperforming_variants,
                message: format!(
                    "insufficient samples: {} below {} per variant",
                    names.join(", "),
                    experiment.min_samples_per_variant
                ),
                variants,
            };
        }

        let table: Vec<(u64, u64)> = experiment
            .variants
            .iter()
            .map(|variant| {
                let stats = &variants[variant];
                (
                    stats.success_count as u64,
                    (stats.count - stats.success_count) as u64,
                )
            })
            .collect();

        let (confidence, statistic) = match contingency_test(&table) {
            Some(test) => (1.0 - test.p_value, test.statistic),
            None => (0.0, 0.0),
        };
        let is_significant = confidence >= experiment.significance_threshold;

        let winner = if is_significant {
            experiment
                .variants
                .iter()
                .max_by(|a, b| {
                    variants[*a]
                        .success_rate
                        .total_cmp(&variants[*b].success_rate)
                })
                .cloned()
        } else {
            None
        };

        let message = if is_significant {
            format!(
                "significant at confidence {confidence:.3} (chi-squared {statistic:.2})"
            )
        } else {
            format!(
                "not significant: confidence {confidence:.3} below threshold {:.3}",
                experiment.significance_threshold
            )
        };

        ExperimentResults {
            experiment_id: experiment.id.clone(),
            status: experiment.status,
            variants,
            is_significant,
            confidence,
            winner,
            underperforming_variants,
            message,
        }
    }
}

impl std::fmt::Debug for ExperimentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentCoordinator").finish_non_exhaustive()
    }
}

/// Walk the cumulative traffic split with a roll in `[0, 1)`.
fn pick_variant(variants: &[String], traffic_split: &[f64], roll: f64) -> String {
    let mut cumulative = 0.0;
    for (variant, weight) in variants.iter().zip(traffic_split) {
        cumulative += weight;
        if roll < cumulative {
            return variant.clone();
        }
    }
    // Split sums to ~1.0; rounding can leave the last sliver uncovered.
    variants[variants.len() - 1].clone()
}

/// Deterministic `[0, 1)` value for a (experiment, user) pair.
fn sticky_fraction(experiment_id: &str, user_id: &str) -> f64 {
    let digest = Sha256::digest(format!("{experiment_id}:{user_id}").as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) as f64 / (u64::MAX as f64 + 1.0)
}

/// Variants whose success rate has fallen below `early_stop_threshold` of the
/// best variant's, once both sides have enough samples.
fn underperformers(
    experiment: &Experiment,
    variants: &HashMap<String, crate::outcome::ApproachStats>,
) -> Vec<String> {
    let best = experiment
        .variants
        .iter()
        .filter(|v| variants[*v].count >= EARLY_STOP_MIN_SAMPLES)
        .map(|v| variants[v].success_rate)
        .fold(f64::NEG_INFINITY, f64::max);
    if !best.is_finite() || best <= 0.0 {
        return Vec::new();
    }

    experiment
        .variants
        .iter()
        .filter(|variant| {
            let stats = &variants[*variant];
            stats.count >= EARLY_STOP_MIN_SAMPLES
                && stats.success_rate < best * experiment.early_stop_threshold
        })
        .cloned()
        .collect()
}
