//! SpeculativeExecutor: bounded concurrent racing with cooperative stop.

use super::types::{
    Approach, AttemptRecord, ExecuteOptions, ExecutorConfig, SelectionStrategy, SpeculativeResult,
    StopSignal,
};

use crate::outcome::{NewOutcome, OutcomeStore};

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, Semaphore};

use std::sync::Arc;
use std::time::{Duration, Instant};

/// One spawned approach's terminal state, sent back over the completion
/// channel in arrival order.
struct Completion {
    index: usize,
    duration_ms: u64,
    outcome: Result<JsonValue, (String, &'static str)>,
}

/// Races candidate approaches and selects a single winner.
///
/// Each approach runs in its own task behind a shared worker-slot semaphore;
/// approaches beyond `max_concurrency` queue for a slot. The per-approach
/// deadline is a hard bound on how long the executor *waits*
/// (`tokio::time::timeout`); the [`StopSignal`] handed to each callable stays
/// purely cooperative, so a callable that ignores both simply keeps running
/// detached after the executor moves on.
pub struct SpeculativeExecutor {
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
    store: Option<Arc<OutcomeStore>>,
}

impl SpeculativeExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            config,
            semaphore,
            store: None,
        }
    }

    /// Mirror every attempt into the outcome log when `ExecuteOptions::domain`
    /// is set.
    pub fn with_store(mut self, store: Arc<OutcomeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Race `approaches` against `input` and return the structured result.
    ///
    /// Never returns an error: an empty approach list, individual approach
    /// failures, timeouts, and a failed fallback all surface as fields on
    /// [`SpeculativeResult`].
    pub async fn execute(
        &self,
        approaches: Vec<Approach>,
        input: JsonValue,
        options: ExecuteOptions,
    ) -> SpeculativeResult {
        let started = Instant::now();

        if approaches.is_empty() {
            return SpeculativeResult::failure(
                "no approaches supplied",
                started.elapsed().as_millis() as u64,
                Vec::new(),
            );
        }

        tracing::debug!(
            count = approaches.len(),
            strategy = ?options.strategy,
            "speculative execution started",
        );

        let stop = StopSignal::new();
        let input = Arc::new(input);
        let (tx, mut rx) = mpsc::channel::<Completion>(approaches.len());

        for (index, approach) in approaches.iter().enumerate() {
            let semaphore = self.semaphore.clone();
            let callable = approach.callable();
            let timeout = approach
                .timeout
                .unwrap_or(Duration::from_secs(self.config.default_timeout_secs));
            let stop = stop.clone();
            let input = input.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let run_started = Instant::now();
                let outcome = match tokio::time::timeout(timeout, callable.run(input, stop)).await
                {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(error)) => Err((error.to_string(), "error")),
                    Err(_) => Err((
                        format!("timed out after {}ms", timeout.as_millis()),
                        "timeout",
                    )),
                };
                let _ = tx
                    .send(Completion {
                        index,
                        duration_ms: run_started.elapsed().as_millis() as u64,
                        outcome,
                    })
                    .await;
            });
        }
        drop(tx);

        let mut attempts: Vec<Option<AttemptRecord>> = vec![None; approaches.len()];
        let mut successes: Vec<(usize, JsonValue)> = Vec::new();

        while let Some(done) = rx.recv().await {
            let name = approaches[done.index].name.clone();
            match done.outcome {
                Ok(value) => {
                    attempts[done.index] = Some(AttemptRecord {
                        approach: name,
                        success: true,
                        duration_ms: done.duration_ms,
                        error: None,
                        error_kind: None,
                    });
                    successes.push((done.index, value));
                    if options.strategy == SelectionStrategy::FirstSuccess {
                        // Winner found: advise everything else to wind down
                        // and stop waiting.
                        stop.stop();
                        break;
                    }
                }
                Err((error, kind)) => {
                    tracing::debug!(approach = %name, %error, "approach attempt failed");
                    attempts[done.index] = Some(AttemptRecord {
                        approach: name,
                        success: false,
                        duration_ms: done.duration_ms,
                        error: Some(error),
                        error_kind: Some(kind.to_owned()),
                    });
                }
            }
        }

        // Siblings still in flight when a FirstSuccess winner broke the loop.
        for (index, slot) in attempts.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(AttemptRecord {
                    approach: approaches[index].name.clone(),
                    success: false,
                    duration_ms: 0,
                    error: Some("abandoned after winner".into()),
                    error_kind: Some("abandoned".to_owned()),
                });
            }
        }
        let mut attempts: Vec<AttemptRecord> = attempts.into_iter().flatten().collect();

        let winner = select_winner(&approaches, &successes, &options);

        if let Some((index, value)) = winner {
            let result = SpeculativeResult {
                success: true,
                value: Some(value),
                approach_name: Some(approaches[index].name.clone()),
                duration_ms: started.elapsed().as_millis() as u64,
                error: None,
                all_attempts: attempts,
            };
            self.log_attempts(options.domain.as_deref(), &result.all_attempts)
                .await;
            return result;
        }

        // Nothing succeeded: give the fallback one synchronous shot.
        if let Some(fallback) = &options.fallback {
            let run_started = Instant::now();
            let callable = fallback.callable();
            match callable.run(input.clone(), stop.clone()).await {
                Ok(value) => {
                    attempts.push(AttemptRecord {
                        approach: "fallback".into(),
                        success: true,
                        duration_ms: run_started.elapsed().as_millis() as u64,
                        error: None,
                        error_kind: None,
                    });
                    let result = SpeculativeResult {
                        success: true,
                        value: Some(value),
                        approach_name: Some("fallback".into()),
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: None,
                        all_attempts: attempts,
                    };
                    self.log_attempts(options.domain.as_deref(), &result.all_attempts)
                        .await;
                    return result;
                }
                Err(error) => {
                    attempts.push(AttemptRecord {
                        approach: "fallback".into(),
                        success: false,
                        duration_ms: run_started.elapsed().as_millis() as u64,
                        error: Some(error.to_string()),
                        error_kind: Some("error".to_owned()),
                    });
                }
            }
        }

        let summary: Vec<String> = attempts
            .iter()
            .filter_map(|attempt| {
                attempt
                    .error
                    .as_ref()
                    .map(|error| format!("{}: {error}", attempt.approach))
            })
            .collect();
        let result = SpeculativeResult::failure(
            format!("all approaches failed: {}", summary.join("; ")),
            started.elapsed().as_millis() as u64,
            attempts,
        );
        self.log_attempts(options.domain.as_deref(), &result.all_attempts)
            .await;
        result
    }

    /// Mirror attempts into the outcome log. Best-effort: failures are
    /// logged and swallowed so orchestration stays non-blocking.
    async fn log_attempts(&self, domain: Option<&str>, attempts: &[AttemptRecord]) {
        let (Some(store), Some(domain)) = (&self.store, domain) else {
            return;
        };
        for attempt in attempts {
            let mut outcome = NewOutcome::new(domain, attempt.approach.clone(), attempt.success)
                .with_latency_ms(attempt.duration_ms as i64);
            outcome.error_kind = attempt.error_kind.clone();
            if let Err(error) = store.record_outcome(outcome).await {
                tracing::warn!(%error, approach = %attempt.approach, "attempt mirror failed");
            }
        }
    }
}

impl std::fmt::Debug for SpeculativeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeculativeExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Apply the selection strategy to the successes gathered so far.
///
/// `successes` is in completion order, which is what breaks ties for
/// `Priority` (strict comparison keeps the earlier arrival) and
/// `BestQuality` (first seen wins among equal scores).
fn select_winner(
    approaches: &[Approach],
    successes: &[(usize, JsonValue)],
    options: &ExecuteOptions,
) -> Option<(usize, JsonValue)> {
    if successes.is_empty() {
        return None;
    }
    match options.strategy {
        SelectionStrategy::FirstSuccess => successes.first().cloned(),
        SelectionStrategy::Priority => {
            let mut best: Option<&(usize, JsonValue)> = None;
            for success in successes {
                let better = match best {
                    Some(current) => {
                        approaches[success.0].priority > approaches[current.0].priority
                    }
                    None => true,
                };
                if better {
                    best = Some(success);
                }
            }
            best.cloned()
        }
        SelectionStrategy::BestQuality => {
            let mut best: Option<(&(usize, JsonValue), f64)> = None;
            for success in successes {
                let score = options
                    .quality_extractor
                    .as_ref()
                    .and_then(|extract| extract(&success.1))
                    .unwrap_or(0.0);
                let better = match best {
                    Some((_, best_score)) => score > best_score,
                    None => true,
                };
                if better {
                    best = Some((success, score));
                }
            }
            best.map(|(success, _)| success.clone())
        }
    }
}
