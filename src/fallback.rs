//! Walks a routing decision's attempt order until one strategy trains.
//!
//! Each attempt runs on the blocking pool under a hard budget. An attempt that
//! overruns or is cancelled is abandoned: its thread finishes in the background
//! and the result is dropped.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use crate::cancel::CancellationToken;
use crate::dataset::Dataset;
use crate::forecaster::{ForecasterError, ForecasterHandle, StrategyFactory, StrategyId};
use crate::metrics::TrainingMetrics;
use crate::router::RoutingDecision;

/// Why one attempt did not produce a model. Every variant moves on to the next
/// candidate except `Cancelled`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AttemptError {
    #[error(transparent)]
    Training(#[from] ForecasterError),
    #[error("{strategy} exceeded its {budget_ms} ms training budget")]
    Timeout { strategy: StrategyId, budget_ms: u64 },
    #[error("attempt cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("no strategy in the fallback chain produced a model (attempted: {attempted:?})")]
pub struct FatalPipelineError {
    pub attempted: Vec<StrategyId>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FallbackError {
    #[error(transparent)]
    Fatal(#[from] FatalPipelineError),
    #[error("training was cancelled")]
    Cancelled,
    #[error("{strategy} panicked during training: {detail}")]
    StrategyPanicked { strategy: StrategyId, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub strategy: StrategyId,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct FallbackOutcome {
    pub handle: ForecasterHandle,
    pub metrics: TrainingMetrics,
    pub attempts: Vec<AttemptRecord>,
}

impl FallbackOutcome {
    pub fn strategy(&self) -> StrategyId {
        self.handle.strategy()
    }
}

pub async fn execute_with_fallback(
    dataset: Arc<Dataset>,
    decision: &RoutingDecision,
    factory: Arc<dyn StrategyFactory>,
    budget: Duration,
    cancel: &CancellationToken,
) -> Result<FallbackOutcome, FallbackError> {
    let order = decision.attempt_order();
    let budget_ms = budget.as_millis() as u64;
    let mut attempts: Vec<AttemptRecord> = Vec::with_capacity(order.len());

    for (position, strategy) in order.iter().copied().enumerate() {
        if cancel.is_cancelled() {
            return Err(FallbackError::Cancelled);
        }

        info!(
            component = "fallback",
            event = "fallback.attempt.start",
            strategy = %strategy,
            position,
            budget_ms
        );
        let started = Instant::now();
        let attempt = run_attempt(strategy, Arc::clone(&dataset), &factory, budget, cancel).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        match attempt {
            Ok((handle, metrics)) => {
                info!(
                    component = "fallback",
                    event = "fallback.attempt.succeeded",
                    strategy = %strategy,
                    position,
                    duration_ms,
                    mape = metrics.mape
                );
                attempts.push(AttemptRecord {
                    strategy,
                    outcome: AttemptOutcome::Succeeded,
                    duration_ms,
                    error: None,
                });
                return Ok(FallbackOutcome {
                    handle,
                    metrics,
                    attempts,
                });
            }
            Err(AttemptError::Cancelled) => return Err(FallbackError::Cancelled),
            Err(err) => {
                warn!(
                    component = "fallback",
                    event = "fallback.attempt.skipped",
                    strategy = %strategy,
                    position,
                    duration_ms,
                    error = %err
                );
                let outcome = if matches!(err, AttemptError::Timeout { .. }) {
                    AttemptOutcome::TimedOut
                } else {
                    AttemptOutcome::Failed
                };
                attempts.push(AttemptRecord {
                    strategy,
                    outcome,
                    duration_ms,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    error!(
        component = "fallback",
        event = "fallback.chain.exhausted",
        attempted = ?order
    );
    Err(FallbackError::Fatal(FatalPipelineError { attempted: order }))
}

/// The outer `Result` carries defects that must stop the run; the inner one
/// carries ordinary reasons to move to the next candidate.
async fn run_attempt(
    strategy: StrategyId,
    dataset: Arc<Dataset>,
    factory: &Arc<dyn StrategyFactory>,
    budget: Duration,
    cancel: &CancellationToken,
) -> Result<Result<(ForecasterHandle, TrainingMetrics), AttemptError>, FallbackError> {
    let mut handle = ForecasterHandle::new(factory.create(strategy));
    let task = tokio::task::spawn_blocking(move || {
        let outcome = handle.train(&dataset);
        (handle, outcome)
    });

    tokio::select! {
        _ = cancel.cancelled() => Ok(Err(AttemptError::Cancelled)),
        joined = tokio::time::timeout(budget, task) => match joined {
            Err(_) => Ok(Err(AttemptError::Timeout {
                strategy,
                budget_ms: budget.as_millis() as u64,
            })),
            Ok(Err(join_err)) => Err(FallbackError::StrategyPanicked {
                strategy,
                detail: panic_detail(join_err),
            }),
            Ok(Ok((handle, Ok(metrics)))) => Ok(Ok((handle, metrics))),
            Ok(Ok((_, Err(err)))) => Ok(Err(AttemptError::Training(err))),
        },
    }
}

pub(crate) fn panic_detail(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
