//! Approach definitions and result types for speculative execution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Advisory stop flag shared across the approaches of one `execute` call.
///
/// Set when a FIRST_SUCCESS winner is found so not-yet-started or polling
/// approaches may abandon early. Checking it is optional; the executor never
/// preempts a callable that ignores it.
#[derive(Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StopSignal").field(&self.is_stopped()).finish()
    }
}

/// An approach's callable: one attempt at producing a result for the input.
#[async_trait]
pub trait ApproachFn: Send + Sync {
    async fn run(&self, input: Arc<JsonValue>, stop: StopSignal) -> anyhow::Result<JsonValue>;
}

struct FnApproach<F>(F);

#[async_trait]
impl<F, Fut> ApproachFn for FnApproach<F>
where
    F: Fn(Arc<JsonValue>, StopSignal) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send,
{
    async fn run(&self, input: Arc<JsonValue>, stop: StopSignal) -> anyhow::Result<JsonValue> {
        (self.0)(input, stop).await
    }
}

/// A named candidate approach for one task.
#[derive(Clone)]
pub struct Approach {
    pub name: String,
    /// Hard wall-clock bound for this approach; falls back to the executor's
    /// default when unset.
    pub timeout: Option<Duration>,
    /// Higher wins under [`SelectionStrategy::Priority`].
    pub priority: i64,
    pub metadata: JsonValue,
    callable: Arc<dyn ApproachFn>,
}

impl Approach {
    pub fn new(name: impl Into<String>, callable: Arc<dyn ApproachFn>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            priority: 0,
            metadata: JsonValue::Null,
            callable,
        }
    }

    /// Wrap a plain async closure as an approach.
    pub fn from_fn<F, Fut>(name: impl Into<String>, callable: F) -> Self
    where
        F: Fn(Arc<JsonValue>, StopSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
    {
        Self::new(name, Arc::new(FnApproach(callable)))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    pub(crate) fn callable(&self) -> Arc<dyn ApproachFn> {
        self.callable.clone()
    }
}

impl std::fmt::Debug for Approach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Approach")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// How the executor picks a winner among concurrent approaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Return the first approach to complete successfully and stop waiting
    /// on the rest.
    #[default]
    FirstSuccess,
    /// Run everything to completion; highest declared priority among the
    /// successes wins, ties broken by completion order.
    Priority,
    /// Run everything to completion; a caller-supplied quality extractor
    /// scores each success and the maximum wins, ties by first seen.
    BestQuality,
}

/// Scores a successful approach's output for [`SelectionStrategy::BestQuality`].
pub type QualityExtractor = Arc<dyn Fn(&JsonValue) -> Option<f64> + Send + Sync>;

/// One approach's recorded attempt within an `execute` call.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub approach: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// `timeout`, `error`, or `abandoned`; unset for successes.
    pub error_kind: Option<String>,
}

/// Structured outcome of one `execute` call.
///
/// Callers treat `success`/`error` as authoritative; `execute` itself never
/// returns an `Err`.
#[derive(Debug, Clone, Serialize)]
pub struct SpeculativeResult {
    pub success: bool,
    pub value: Option<JsonValue>,
    pub approach_name: Option<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub all_attempts: Vec<AttemptRecord>,
}

impl SpeculativeResult {
    pub(crate) fn failure(
        error: impl Into<String>,
        duration_ms: u64,
        all_attempts: Vec<AttemptRecord>,
    ) -> Self {
        Self {
            success: false,
            value: None,
            approach_name: None,
            duration_ms,
            error: Some(error.into()),
            all_attempts,
        }
    }
}

/// Executor tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutorConfig {
    /// Approaches running at once; the rest queue for a worker slot.
    pub max_concurrency: usize,
    /// Wall-clock bound for approaches that don't declare their own.
    pub default_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            default_timeout_secs: 30,
        }
    }
}

/// Per-call options for [`SpeculativeExecutor::execute`](super::SpeculativeExecutor::execute).
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    pub strategy: SelectionStrategy,
    /// When set (and the executor has a store), every attempt is logged as
    /// an outcome under this domain.
    pub domain: Option<String>,
    /// Invoked after the race when no approach succeeded. Its own name is
    /// ignored; the result reports `approach_name: "fallback"`.
    pub fallback: Option<Approach>,
    /// Required by [`SelectionStrategy::BestQuality`]; without it every
    /// success scores equal and the first one seen wins.
    pub quality_extractor: Option<QualityExtractor>,
}

impl ExecuteOptions {
    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_fallback(mut self, fallback: Approach) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_quality_extractor(mut self, extractor: QualityExtractor) -> Self {
        self.quality_extractor = Some(extractor);
        self
    }
}

impl std::fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("strategy", &self.strategy)
            .field("domain", &self.domain)
            .field("fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}
