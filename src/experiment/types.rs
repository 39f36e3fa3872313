//! Experiment definitions, lifecycle states, and result types.

use crate::outcome::ApproachStats;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::collections::HashMap;

/// Current lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Assigning traffic and accepting outcomes.
    Active,
    /// Temporarily parked; all traffic goes to the first variant.
    Paused,
    /// Finished with a declared winner (terminal state).
    Concluded,
}

impl ExperimentStatus {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Concluded => "concluded",
        }
    }

    /// Parse from database string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "concluded" => Some(Self::Concluded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Concluded)
    }
}

/// How traffic is assigned to variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Fresh uniform draw per call, walked over the cumulative split.
    #[default]
    Random,
    /// Same mechanism as `Random`; the name signals a non-uniform split.
    Weighted,
    /// Deterministic per-user hash, memoized for the experiment's lifetime.
    Sticky,
}

impl AssignmentStrategy {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Weighted => "weighted",
            Self::Sticky => "sticky",
        }
    }

    /// Parse from database string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "random" => Some(Self::Random),
            "weighted" => Some(Self::Weighted),
            "sticky" => Some(Self::Sticky),
            _ => None,
        }
    }
}

/// A named A/B experiment over two or more variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Variant names, unique, at least two.
    pub variants: Vec<String>,
    /// Per-variant weights parallel to `variants`, summing to 1.0 ± 0.01.
    pub traffic_split: Vec<f64>,
    pub success_metric: String,
    pub strategy: AssignmentStrategy,
    pub status: ExperimentStatus,
    pub min_samples_per_variant: i64,
    /// Required confidence (1 − p) for significance, in (0, 1).
    pub significance_threshold: f64,
    /// Conclude automatically once the significance check passes.
    pub auto_conclude: bool,
    pub early_stopping: bool,
    /// A variant is flagged underperforming below this fraction of the best
    /// variant's success rate.
    pub early_stop_threshold: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub winner: Option<String>,
    pub conclusion_reason: Option<String>,
}

/// Parameters for creating an experiment.
///
/// `traffic_split: None` means a uniform split across the variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub name: String,
    pub variants: Vec<String>,
    pub description: String,
    pub success_metric: String,
    pub traffic_split: Option<Vec<f64>>,
    pub strategy: AssignmentStrategy,
    pub min_samples_per_variant: i64,
    pub significance_threshold: f64,
    pub auto_conclude: bool,
    pub early_stopping: bool,
    pub early_stop_threshold: f64,
}

impl ExperimentSpec {
    /// A spec with the default knobs: uniform split, random assignment,
    /// 30 samples per variant, 95% confidence, no auto-conclude.
    pub fn new(name: impl Into<String>, variants: Vec<String>) -> Self {
        Self {
            name: name.into(),
            variants,
            description: String::new(),
            success_metric: "success_rate".into(),
            traffic_split: None,
            strategy: AssignmentStrategy::Random,
            min_samples_per_variant: 30,
            significance_threshold: 0.95,
            auto_conclude: false,
            early_stopping: false,
            early_stop_threshold: 0.5,
        }
    }

    pub fn with_strategy(mut self, strategy: AssignmentStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_traffic_split(mut self, split: Vec<f64>) -> Self {
        self.traffic_split = Some(split);
        self
    }

    pub fn with_min_samples(mut self, min_samples_per_variant: i64) -> Self {
        self.min_samples_per_variant = min_samples_per_variant;
        self
    }

    pub fn with_auto_conclude(mut self) -> Self {
        self.auto_conclude = true;
        self
    }

    pub fn with_early_stopping(mut self) -> Self {
        self.early_stopping = true;
        self
    }
}

/// Snapshot returned by [`ExperimentCoordinator::get_results`](super::ExperimentCoordinator::get_results).
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentResults {
    pub experiment_id: String,
    pub status: ExperimentStatus,
    pub variants: HashMap<String, ApproachStats>,
    pub is_significant: bool,
    /// 1 − p from the chi-squared independence test; 0.0 until every variant
    /// has enough samples.
    pub confidence: f64,
    /// Highest observed success rate; populated only when significant.
    pub winner: Option<String>,
    /// Variants flagged by early stopping, empty unless enabled.
    pub underperforming_variants: Vec<String>,
    pub message: String,
}
