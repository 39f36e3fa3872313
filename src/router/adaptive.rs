//! AdaptiveRouter: per-domain gating decisions and closed-loop threshold
//! tuning.

use super::store::{RoutingOutcomeRow, ThresholdHistoryEntry, ThresholdStore};
use super::RouterError;

use crate::outcome::{NewOutcome, OutcomeStore};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use std::collections::HashMap;
use std::sync::Arc;

/// Half-width of the dead band around the target success rate. Rates inside
/// the band leave the threshold alone.
const RATE_BAND: f64 = 0.1;

/// Share of successes that must have run without the agent before the
/// threshold is allowed to rise.
const AGENT_OPTIONAL_SHARE: f64 = 0.8;

/// Router tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RouterConfig {
    /// Threshold assigned to a domain on first reference.
    pub base_threshold: f64,
    pub threshold_min: f64,
    pub threshold_max: f64,
    /// Step size of one adjustment.
    pub learning_rate: f64,
    /// Per-rank weight decay for the trailing window (newest rank 0).
    pub decay_factor: f64,
    /// Samples required before any adjustment.
    pub min_samples: usize,
    pub target_success_rate: f64,
    /// Trailing window extent in days.
    pub window_days: u32,
    /// Hard cap on window size regardless of age.
    pub window_max_samples: usize,
    /// Complexity distance from the threshold that still counts as "near".
    pub near_threshold_band: f64,
    /// Minimum |Δthreshold| that earns a history row.
    pub history_epsilon: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            base_threshold: 3.0,
            threshold_min: 1.0,
            threshold_max: 9.0,
            learning_rate: 0.2,
            decay_factor: 0.95,
            min_samples: 5,
            target_success_rate: 0.7,
            window_days: 30,
            window_max_samples: 100,
            near_threshold_band: 1.0,
            history_epsilon: 0.05,
        }
    }
}

/// Answer to one gating question.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub load_agent: bool,
    pub threshold: f64,
    /// Human-readable explanation of the comparison, citing window stats
    /// once enough samples exist.
    pub reasoning: String,
}

/// One resolved routing decision reported back to the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingOutcome {
    pub task_id: String,
    pub domain: String,
    pub complexity: f64,
    pub agent_used: Option<String>,
    pub agent_loaded: bool,
    pub success: bool,
    pub quality_score: f64,
    pub user_corrections: i64,
}

impl RoutingOutcome {
    pub fn new(
        task_id: impl Into<String>,
        domain: impl Into<String>,
        complexity: f64,
        agent_loaded: bool,
        success: bool,
        quality_score: f64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            domain: domain.into(),
            complexity,
            agent_used: None,
            agent_loaded,
            success,
            quality_score,
            user_corrections: 0,
        }
    }

    pub fn with_agent_used(mut self, agent_used: impl Into<String>) -> Self {
        self.agent_used = Some(agent_used.into());
        self
    }

    pub fn with_user_corrections(mut self, user_corrections: i64) -> Self {
        self.user_corrections = user_corrections;
        self
    }
}

/// Per-domain snapshot for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct DomainStats {
    pub domain: String,
    pub current_threshold: f64,
    pub base_threshold: f64,
    pub success_rate: f64,
    pub sample_count: i64,
    /// Tasks in the trailing window.
    pub task_count: i64,
    /// Fraction of windowed tasks that loaded the agent.
    pub agent_usage_rate: f64,
    pub last_updated: DateTime<Utc>,
}

/// Maintains one self-tuning complexity threshold per domain.
///
/// Threshold updates are read-modify-write, so they serialize behind a
/// per-domain lock; outcome appends themselves never block each other. An
/// optional [`OutcomeStore`] receives a mirrored copy of every routing
/// outcome for cross-cutting analytics.
pub struct AdaptiveRouter {
    store: Arc<ThresholdStore>,
    outcome_store: Option<Arc<OutcomeStore>>,
    config: RouterConfig,
    /// domain → update lock, created lazily.
    domain_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AdaptiveRouter {
    pub fn new(store: Arc<ThresholdStore>, config: RouterConfig) -> Self {
        Self {
            store,
            outcome_store: None,
            config,
            domain_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Mirror every routing outcome into the shared outcome log.
    pub fn with_outcome_store(mut self, outcome_store: Arc<OutcomeStore>) -> Self {
        self.outcome_store = Some(outcome_store);
        self
    }

    /// Should the expensive agent be loaded for this task?
    ///
    /// The domain is auto-created at the base threshold on first use. The
    /// decision is a plain comparison: load when `complexity` reaches the
    /// domain's current threshold.
    pub async fn should_load_agent(
        &self,
        domain: &str,
        complexity: f64,
    ) -> Result<RoutingDecision, RouterError> {
        let state = self
            .store
            .ensure_domain(domain, self.config.base_threshold)
            .await?;
        let load_agent = complexity >= state.current_threshold;
        let verdict = if load_agent { "meets" } else { "is below" };

        let reasoning = if state.sample_count >= self.config.min_samples as i64 {
            format!(
                "complexity {complexity:.1} {verdict} threshold {:.2} for '{domain}' \
                 (tuned from {} samples at {:.0}% success)",
                state.current_threshold,
                state.sample_count,
                state.success_rate * 100.0,
            )
        } else {
            format!(
                "complexity {complexity:.1} {verdict} threshold {:.2} for '{domain}' \
                 ({} samples so far, threshold untuned)",
                state.current_threshold, state.sample_count,
            )
        };

        Ok(RoutingDecision {
            load_agent,
            threshold: state.current_threshold,
            reasoning,
        })
    }

    /// Record one resolved decision and retune the domain's threshold.
    ///
    /// The insert is append-only; the retune runs behind the domain's lock so
    /// concurrent reporters can't lose updates.
    pub async fn record_outcome(&self, outcome: RoutingOutcome) -> Result<(), RouterError> {
        if !(0.0..=1.0).contains(&outcome.quality_score) {
            return Err(RouterError::Validation(format!(
                "quality_score {} outside [0.0, 1.0]",
                outcome.quality_score
            )));
        }

        let lock = self.domain_lock(&outcome.domain).await;
        let _guard = lock.lock().await;

        let state = self
            .store
            .ensure_domain(&outcome.domain, self.config.base_threshold)
            .await?;

        self.store
            .insert_outcome(
                &outcome.task_id,
                &outcome.domain,
                outcome.complexity,
                outcome.agent_used.as_deref(),
                outcome.agent_loaded,
                outcome.success,
                outcome.quality_score,
                outcome.user_corrections,
            )
            .await?;

        if let Some(outcome_store) = &self.outcome_store {
            let mut mirrored = NewOutcome::new(
                outcome.domain.clone(),
                format!("complexity_{}", outcome.complexity),
                outcome.success,
            )
            .with_quality_score(outcome.quality_score);
            mirrored.agent_used = outcome.agent_used.clone();
            mirrored.user_correction = outcome.user_corrections > 0;
            if let Err(error) = outcome_store.record_outcome(mirrored).await {
                tracing::warn!(%error, domain = %outcome.domain, "routing outcome mirror failed");
            }
        }

        let since = Utc::now() - Duration::days(i64::from(self.config.window_days));
        let rows = self
            .store
            .recent_outcomes(&outcome.domain, since, self.config.window_max_samples)
            .await?;

        let (new_threshold, decayed_rate, reason) =
            retune(&rows, state.current_threshold, &self.config);
        self.store
            .update_threshold(
                &outcome.domain,
                new_threshold,
                decayed_rate,
                rows.len() as i64,
            )
            .await?;

        if let Some(reason) = reason {
            if (new_threshold - state.current_threshold).abs() >= self.config.history_epsilon {
                self.store
                    .insert_history(
                        &outcome.domain,
                        state.current_threshold,
                        new_threshold,
                        &reason,
                        rows.len() as i64,
                    )
                    .await?;
                tracing::info!(
                    domain = %outcome.domain,
                    old = state.current_threshold,
                    new = new_threshold,
                    %reason,
                    "threshold adjusted",
                );
            }
        }

        Ok(())
    }

    /// Snapshot for one domain; `None` until the domain has been referenced.
    pub async fn domain_stats(&self, domain: &str) -> Result<Option<DomainStats>, RouterError> {
        let Some(state) = self.store.get_threshold(domain).await? else {
            return Ok(None);
        };
        let since = Utc::now() - Duration::days(i64::from(self.config.window_days));
        let (task_count, _successes, agent_loads) =
            self.store.window_counts(domain, since).await?;

        Ok(Some(DomainStats {
            domain: state.domain,
            current_threshold: state.current_threshold,
            base_threshold: state.base_threshold,
            success_rate: state.success_rate,
            sample_count: state.sample_count,
            task_count,
            agent_usage_rate: if task_count > 0 {
                agent_loads as f64 / task_count as f64
            } else {
                0.0
            },
            last_updated: state.last_updated,
        }))
    }

    /// Snapshots for every known domain.
    pub async fn all_stats(&self) -> Result<Vec<DomainStats>, RouterError> {
        let mut stats = Vec::new();
        for domain in self.store.all_domains().await? {
            if let Some(entry) = self.domain_stats(&domain).await? {
                stats.push(entry);
            }
        }
        Ok(stats)
    }

    /// Recent threshold changes for a domain, newest first.
    pub async fn threshold_history(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<ThresholdHistoryEntry>, RouterError> {
        self.store.history(domain, limit).await
    }

    /// Restore the domain's base threshold, with a manual-reset audit row.
    pub async fn reset_domain(&self, domain: &str) -> Result<(), RouterError> {
        let lock = self.domain_lock(domain).await;
        let _guard = lock.lock().await;

        let state = self
            .store
            .ensure_domain(domain, self.config.base_threshold)
            .await?;
        self.store
            .update_threshold(
                domain,
                state.base_threshold,
                state.success_rate,
                state.sample_count,
            )
            .await?;
        self.store
            .insert_history(
                domain,
                state.current_threshold,
                state.base_threshold,
                "manual reset",
                state.sample_count,
            )
            .await?;

        tracing::info!(
            domain,
            from = state.current_threshold,
            to = state.base_threshold,
            "threshold manually reset",
        );
        Ok(())
    }

    async fn domain_lock(&self, domain: &str) -> Arc<Mutex<()>> {
        let mut locks = self.domain_locks.lock().await;
        locks
            .entry(domain.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl std::fmt::Debug for AdaptiveRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRouter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tuning arithmetic (db-free, shared with tests)
// ---------------------------------------------------------------------------

/// Exponentially decayed success rate over a window ordered newest first.
fn decayed_success_rate(rows: &[RoutingOutcomeRow], decay_factor: f64) -> f64 {
    let mut weighted_successes = 0.0;
    let mut total_weight = 0.0;
    for (rank, row) in rows.iter().enumerate() {
        let weight = decay_factor.powi(rank as i32);
        total_weight += weight;
        if row.success {
            weighted_successes += weight;
        }
    }
    if total_weight > 0.0 {
        weighted_successes / total_weight
    } else {
        0.0
    }
}

/// Compute the retuned threshold for one domain window.
///
/// Returns `(new_threshold, decayed_rate, reason)` where `reason` is set only
/// when the threshold moved. Below `min_samples` the threshold never moves.
///
/// Lowering rule: the window is failing and the failures cluster near the
/// gate without the agent loaded, outnumbering agent-assisted successes, so
/// load the expensive path earlier. Raising rule: the window is comfortably
/// succeeding and the agent was rarely part of those successes, so demand
/// more complexity before paying for it.
fn retune(
    rows: &[RoutingOutcomeRow],
    current: f64,
    config: &RouterConfig,
) -> (f64, f64, Option<String>) {
    let rate = decayed_success_rate(rows, config.decay_factor);
    if rows.len() < config.min_samples {
        return (current, rate, None);
    }

    if rate < config.target_success_rate - RATE_BAND {
        let unassisted_failures_near = rows
            .iter()
            .filter(|row| {
                !row.success
                    && !row.agent_loaded
                    && (row.complexity - current).abs() <= config.near_threshold_band
            })
            .count();
        let assisted_successes = rows
            .iter()
            .filter(|row| row.success && row.agent_loaded)
            .count();
        if unassisted_failures_near > assisted_successes {
            let new = (current - config.learning_rate)
                .clamp(config.threshold_min, config.threshold_max);
            let reason = format!(
                "success rate {rate:.2} below target {:.2}: {unassisted_failures_near} \
                 unassisted failures near threshold vs {assisted_successes} agent-assisted \
                 successes",
                config.target_success_rate,
            );
            return (new, rate, Some(reason));
        }
    } else if rate > config.target_success_rate + RATE_BAND {
        let successes = rows.iter().filter(|row| row.success).count();
        let unassisted_successes = rows
            .iter()
            .filter(|row| row.success && !row.agent_loaded)
            .count();
        if successes > 0
            && unassisted_successes as f64 / successes as f64 >= AGENT_OPTIONAL_SHARE
        {
            let new = (current + config.learning_rate)
                .clamp(config.threshold_min, config.threshold_max);
            let reason = format!(
                "success rate {rate:.2} above target {:.2}: {unassisted_successes}/{successes} \
                 successes needed no agent",
                config.target_success_rate,
            );
            return (new, rate, Some(reason));
        }
    }

    (current, rate, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(complexity: f64, agent_loaded: bool, success: bool) -> RoutingOutcomeRow {
        RoutingOutcomeRow {
            complexity,
            agent_loaded,
            success,
        }
    }

    // -----------------------------------------------------------------------
    // Tuning arithmetic
    // -----------------------------------------------------------------------

    #[test]
    fn test_decayed_rate_weights_recent_rows_more() {
        let newest_success = vec![row(3.0, false, true), row(3.0, false, false)];
        let newest_failure = vec![row(3.0, false, false), row(3.0, false, true)];

        let up = decayed_success_rate(&newest_success, 0.5);
        let down = decayed_success_rate(&newest_failure, 0.5);
        assert!((up - 2.0 / 3.0).abs() < 1e-9, "expected 0.667, got {up}");
        assert!((down - 1.0 / 3.0).abs() < 1e-9, "expected 0.333, got {down}");
    }

    #[test]
    fn test_decayed_rate_empty_window_is_zero() {
        assert_eq!(decayed_success_rate(&[], 0.95), 0.0);
    }

    #[test]
    fn test_retune_needs_min_samples() {
        let config = RouterConfig::default();
        let rows: Vec<_> = (0..4).map(|_| row(3.0, false, false)).collect();
        let (new, _rate, reason) = retune(&rows, 3.0, &config);
        assert_eq!(new, 3.0);
        assert!(reason.is_none());
    }

    #[test]
    fn test_retune_lowers_under_unassisted_failure_pressure() {
        let config = RouterConfig::default();
        let rows: Vec<_> = (0..6).map(|_| row(2.8, false, false)).collect();
        let (new, rate, reason) = retune(&rows, 3.0, &config);
        assert!((new - 2.8).abs() < 1e-9, "expected 2.8, got {new}");
        assert_eq!(rate, 0.0);
        assert!(reason.unwrap().contains("below target"));
    }

    #[test]
    fn test_retune_ignores_failures_far_from_threshold() {
        let config = RouterConfig::default();
        // Failing window, but the failures sit far above the gate; lowering
        // it wouldn't have loaded the agent for them anyway.
        let rows: Vec<_> = (0..6).map(|_| row(8.0, true, false)).collect();
        let (new, _rate, reason) = retune(&rows, 3.0, &config);
        assert_eq!(new, 3.0);
        assert!(reason.is_none());
    }

    #[test]
    fn test_retune_raises_when_agent_rarely_needed() {
        let config = RouterConfig::default();
        let rows: Vec<_> = (0..6).map(|_| row(3.5, false, true)).collect();
        let (new, rate, reason) = retune(&rows, 3.0, &config);
        assert!((new - 3.2).abs() < 1e-9, "expected 3.2, got {new}");
        assert!((rate - 1.0).abs() < 1e-9);
        assert!(reason.unwrap().contains("needed no agent"));
    }

    #[test]
    fn test_retune_holds_when_successes_lean_on_agent() {
        let config = RouterConfig::default();
        // High success rate, but the agent carried it; raising the gate
        // would take the agent away.
        let rows: Vec<_> = (0..6).map(|_| row(4.0, true, true)).collect();
        let (new, _rate, reason) = retune(&rows, 3.0, &config);
        assert_eq!(new, 3.0);
        assert!(reason.is_none());
    }

    #[test]
    fn test_retune_dead_band_leaves_threshold_alone() {
        let config = RouterConfig::default();
        // 7/10 success sits inside target ± band.
        let mut rows: Vec<_> = (0..7).map(|_| row(3.0, false, true)).collect();
        rows.extend((0..3).map(|_| row(3.0, false, false)));
        let (new, _rate, reason) = retune(&rows, 3.0, &config);
        assert_eq!(new, 3.0);
        assert!(reason.is_none());
    }

    #[test]
    fn test_retune_clamps_to_bounds() {
        let config = RouterConfig::default();
        let failing: Vec<_> = (0..6).map(|_| row(1.0, false, false)).collect();
        let (new, _rate, _reason) = retune(&failing, 1.05, &config);
        assert_eq!(new, config.threshold_min);

        let succeeding: Vec<_> = (0..6).map(|_| row(8.95, false, true)).collect();
        let (new, _rate, _reason) = retune(&succeeding, 8.95, &config);
        assert_eq!(new, config.threshold_max);
    }

    // -----------------------------------------------------------------------
    // Integration (throwaway SQLite)
    // -----------------------------------------------------------------------

    async fn setup() -> AdaptiveRouter {
        let path = std::env::temp_dir().join(format!(
            "arbiter_test_router_{}.db",
            uuid::Uuid::new_v4()
        ));
        let store = ThresholdStore::connect(&path).await.unwrap();
        AdaptiveRouter::new(store, RouterConfig::default())
    }

    #[tokio::test]
    async fn test_decision_flips_exactly_at_threshold() {
        let router = setup().await;

        let below = router.should_load_agent("codegen", 2.9).await.unwrap();
        assert!(!below.load_agent);
        assert!((below.threshold - 3.0).abs() < 1e-9);
        assert!(below.reasoning.contains("is below"));

        let at = router.should_load_agent("codegen", 3.0).await.unwrap();
        assert!(at.load_agent);
        assert!(at.reasoning.contains("meets"));

        let above = router.should_load_agent("codegen", 3.1).await.unwrap();
        assert!(above.load_agent);
    }

    #[tokio::test]
    async fn test_failure_pressure_lowers_threshold_within_bounds() {
        let router = setup().await;
        for i in 0..8 {
            router
                .record_outcome(RoutingOutcome::new(
                    format!("task-{i}"),
                    "codegen",
                    2.8,
                    false,
                    false,
                    0.2,
                ))
                .await
                .unwrap();
        }

        let stats = router.domain_stats("codegen").await.unwrap().unwrap();
        assert!(
            stats.current_threshold < 3.0,
            "threshold should have dropped, got {}",
            stats.current_threshold
        );
        assert!(stats.current_threshold >= RouterConfig::default().threshold_min);

        let history = router.threshold_history("codegen", 10).await.unwrap();
        assert!(!history.is_empty());
        assert!(history[0].new_threshold < history[0].old_threshold);
        assert!(history[0].trigger_reason.contains("below target"));
    }

    #[tokio::test]
    async fn test_reasoning_cites_samples_once_tuned() {
        let router = setup().await;
        for i in 0..5 {
            router
                .record_outcome(RoutingOutcome::new(
                    format!("task-{i}"),
                    "search",
                    3.5,
                    true,
                    true,
                    0.9,
                ))
                .await
                .unwrap();
        }

        let decision = router.should_load_agent("search", 3.5).await.unwrap();
        assert!(decision.reasoning.contains("5 samples"));
    }

    #[tokio::test]
    async fn test_reset_domain_restores_base_and_logs_history() {
        let router = setup().await;
        for i in 0..8 {
            router
                .record_outcome(RoutingOutcome::new(
                    format!("task-{i}"),
                    "codegen",
                    2.8,
                    false,
                    false,
                    0.2,
                ))
                .await
                .unwrap();
        }
        let lowered = router.domain_stats("codegen").await.unwrap().unwrap();
        assert!(lowered.current_threshold < 3.0);

        router.reset_domain("codegen").await.unwrap();

        let restored = router.domain_stats("codegen").await.unwrap().unwrap();
        assert!((restored.current_threshold - 3.0).abs() < 1e-9);

        let history = router.threshold_history("codegen", 1).await.unwrap();
        assert_eq!(history[0].trigger_reason, "manual reset");
    }

    #[tokio::test]
    async fn test_invalid_quality_score_rejected() {
        let router = setup().await;
        let result = router
            .record_outcome(RoutingOutcome::new("t", "codegen", 3.0, false, true, 1.5))
            .await;
        assert!(matches!(result, Err(RouterError::Validation(_))));
        assert!(router.domain_stats("codegen").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_report_agent_usage_rate() {
        let router = setup().await;
        for (i, loaded) in [true, true, false, false].iter().enumerate() {
            router
                .record_outcome(RoutingOutcome::new(
                    format!("task-{i}"),
                    "search",
                    4.0,
                    *loaded,
                    true,
                    0.8,
                ))
                .await
                .unwrap();
        }

        let stats = router.domain_stats("search").await.unwrap().unwrap();
        assert_eq!(stats.task_count, 4);
        assert!((stats.agent_usage_rate - 0.5).abs() < 1e-9);

        let all = router.all_stats().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].domain, "search");
    }

    #[tokio::test]
    async fn test_outcomes_mirror_into_outcome_store() {
        let threshold_path = std::env::temp_dir().join(format!(
            "arbiter_test_router_mirror_{}.db",
            uuid::Uuid::new_v4()
        ));
        let outcome_path = std::env::temp_dir().join(format!(
            "arbiter_test_router_mirror_outcomes_{}.db",
            uuid::Uuid::new_v4()
        ));
        let store = ThresholdStore::connect(&threshold_path).await.unwrap();
        let outcome_store = OutcomeStore::connect(&outcome_path).await.unwrap();
        let router = AdaptiveRouter::new(store, RouterConfig::default())
            .with_outcome_store(outcome_store.clone());

        router
            .record_outcome(
                RoutingOutcome::new("task-1", "codegen", 4.0, true, true, 0.9)
                    .with_agent_used("architect"),
            )
            .await
            .unwrap();

        let rows = outcome_store
            .query_outcomes(crate::outcome::OutcomeQuery {
                domain: Some("codegen".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].approach, "complexity_4");
        assert_eq!(rows[0].agent_used.as_deref(), Some("architect"));
        assert!(rows[0].success);
    }
}
