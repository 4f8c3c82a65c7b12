//! Drives one forecasting run through the fixed stage sequence.
//!
//! Every stage is wrapped the same way: check for cancellation, record timing
//! into the run's `PipelineContext`, and turn a stage error into a
//! `PipelineError` tagged with whether the caller can fix it and retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::config::{ConfigError, PipelineConfig};
use crate::context::{
    PipelineContext, RunState, RunStatus, StageName, StageRecord, StageStatus,
    INITIAL_QUALITY_SCORE,
};
use crate::dataset::{Dataset, DatasetError};
use crate::ensemble::EnsembleReport;
use crate::fallback::{
    execute_with_fallback, panic_detail, AttemptRecord, FallbackError, FallbackOutcome,
};
use crate::forecaster::{ForecastResult, ForecasterError, StrategyFactory, StrategyId};
use crate::gates::{run_gates, Boundary, GateInput, GateResult, StageValidation, ValidationError};
use crate::metrics::TrainingMetrics;
use crate::observability::{log_run_finish, log_run_start, run_span};
use crate::profiler::{profile, DataProfile};
use crate::router::{route, RoutingDecision};
use crate::stages;
use crate::store::RunStore;
use crate::strategies::BuiltinStrategies;

pub const GENERIC_FAILURE_MESSAGE: &str =
    "the forecast could not be produced because of an internal error; quote the correlation id when contacting support";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Training(FallbackError),
    #[error("forecast generation failed: {0}")]
    Forecast(#[from] ForecasterError),
    #[error("run cancelled")]
    Cancelled,
    #[error("dataset transformation failed: {0}")]
    Dataset(String),
}

impl StageError {
    /// Validation failures and cancellations can be retried by the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StageError::Validation(_) | StageError::Cancelled)
    }
}

impl From<FallbackError> for StageError {
    fn from(err: FallbackError) -> Self {
        match err {
            FallbackError::Cancelled => StageError::Cancelled,
            other => StageError::Training(other),
        }
    }
}

impl From<DatasetError> for StageError {
    fn from(err: DatasetError) -> Self {
        StageError::Dataset(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{stage} stage failed ({context}): {cause}")]
pub struct PipelineError {
    pub stage: StageName,
    pub context: String,
    pub recoverable: bool,
    #[source]
    pub cause: StageError,
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session_id: String,
    pub dataset: Dataset,
    pub horizon: Option<usize>,
    pub confidence_level: Option<f64>,
}

impl RunRequest {
    pub fn new(session_id: impl Into<String>, dataset: Dataset) -> Self {
        Self {
            session_id: session_id.into(),
            dataset,
            horizon: None,
            confidence_level: None,
        }
    }

    pub fn with_horizon(mut self, horizon: usize) -> Self {
        self.horizon = Some(horizon);
        self
    }

    pub fn with_confidence_level(mut self, confidence_level: f64) -> Self {
        self.confidence_level = Some(confidence_level);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub model_type: StrategyId,
    pub profile: DataProfile,
    pub decision: RoutingDecision,
    pub metrics: TrainingMetrics,
    pub forecast: ForecastResult,
    pub attempts: Vec<AttemptRecord>,
    pub ensemble: Option<EnsembleReport>,
    pub validations: Vec<StageValidation>,
    pub context: PipelineContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub run_id: Uuid,
    pub correlation_id: Uuid,
    pub stage: Option<StageName>,
    pub recoverable: bool,
    pub message: String,
    /// Actionable fixes; empty for internal failures.
    pub remediation: Vec<String>,
    /// Absent when the run task itself died.
    pub context: Option<PipelineContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(Box<RunReport>),
    Failed(Box<RunFailure>),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    pub fn report(&self) -> Option<&RunReport> {
        match self {
            RunOutcome::Completed(report) => Some(report),
            RunOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        match self {
            RunOutcome::Completed(_) => None,
            RunOutcome::Failed(failure) => Some(failure),
        }
    }
}

/// Caller-side handle of a spawned run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    status: watch::Receiver<RunStatus>,
    cancel: CancellationToken,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> RunOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                let correlation_id = Uuid::new_v4();
                error!(
                    component = "pipeline",
                    event = "pipeline.run.internal_error",
                    run_id = %self.run_id,
                    correlation_id = %correlation_id,
                    error = %join_err
                );
                RunOutcome::Failed(Box::new(RunFailure {
                    run_id: self.run_id,
                    correlation_id,
                    stage: self.status.borrow().current_stage,
                    recoverable: false,
                    message: GENERIC_FAILURE_MESSAGE.to_string(),
                    remediation: Vec::new(),
                    context: None,
                }))
            }
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    factory: Arc<dyn StrategyFactory>,
    store: Option<Arc<dyn RunStore>>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let factory = Arc::new(BuiltinStrategies::new(&config));
        Ok(Self {
            config: Arc::new(config),
            factory,
            store: None,
        })
    }

    pub fn with_factory(mut self, factory: Arc<dyn StrategyFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Spawns the run on the current tokio runtime.
    pub fn start(&self, request: RunRequest) -> RunHandle {
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let ctx = PipelineContext::new(run_id, request.session_id.clone());
        let (status_tx, status_rx) = watch::channel(ctx.status());

        let run = PipelineRun {
            config: Arc::clone(&self.config),
            factory: Arc::clone(&self.factory),
            store: self.store.clone(),
            horizon: request.horizon.unwrap_or(self.config.horizon),
            confidence_level: request.confidence_level.unwrap_or(self.config.confidence_level),
            ctx,
            status: status_tx,
            cancel: cancel.clone(),
            validations: Vec::new(),
        };
        let span = run_span(run_id, &request.session_id);
        let join = tokio::spawn(run.drive(request.dataset).instrument(span));

        RunHandle {
            run_id,
            status: status_rx,
            cancel,
            join,
        }
    }

    pub async fn execute(&self, request: RunRequest) -> RunOutcome {
        self.start(request).wait().await
    }

    /// Runs one request on a dedicated runtime and shuts it down.
    ///
    /// Attempts abandoned on timeout or cancellation keep their blocking
    /// thread until the strategy returns. Shutdown waits at most `grace` for
    /// them, then leaves them detached. Must not be called from inside a
    /// tokio runtime.
    pub fn execute_blocking(
        &self,
        request: RunRequest,
        grace: Duration,
    ) -> std::io::Result<RunOutcome> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let outcome = runtime.block_on(self.execute(request));
        runtime.shutdown_timeout(grace);
        Ok(outcome)
    }
}

struct StageClock {
    started_at: DateTime<Utc>,
    started: Instant,
}

struct TrainedModel {
    strategy: StrategyId,
    metrics: TrainingMetrics,
    forecast: ForecastResult,
    attempts: Vec<AttemptRecord>,
    ensemble: Option<EnsembleReport>,
}

struct RunArtifacts {
    profile: DataProfile,
    decision: RoutingDecision,
    metrics: TrainingMetrics,
    forecast: ForecastResult,
    attempts: Vec<AttemptRecord>,
    ensemble: Option<EnsembleReport>,
    model_type: StrategyId,
}

struct PipelineRun {
    config: Arc<PipelineConfig>,
    factory: Arc<dyn StrategyFactory>,
    store: Option<Arc<dyn RunStore>>,
    horizon: usize,
    confidence_level: f64,
    ctx: PipelineContext,
    status: watch::Sender<RunStatus>,
    cancel: CancellationToken,
    validations: Vec<StageValidation>,
}

impl PipelineRun {
    async fn drive(mut self, dataset: Dataset) -> RunOutcome {
        let run_id = self.ctx.run_id();
        log_run_start(
            run_id,
            self.ctx.session_id(),
            dataset.row_count(),
            dataset.column_count(),
            self.horizon,
        );

        let started = Instant::now();
        let result = self.run_stages(dataset).await;
        let state = if result.is_ok() {
            RunState::Completed
        } else {
            RunState::Failed
        };
        self.ctx.finish(state);
        self.publish();
        self.archive().await;

        log_run_finish(
            run_id,
            state,
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            self.ctx.quality_score(),
            self.ctx.warnings().len(),
        );

        match result {
            Ok(artifacts) => RunOutcome::Completed(Box::new(RunReport {
                run_id,
                model_type: artifacts.model_type,
                profile: artifacts.profile,
                decision: artifacts.decision,
                metrics: artifacts.metrics,
                forecast: artifacts.forecast,
                attempts: artifacts.attempts,
                ensemble: artifacts.ensemble,
                validations: self.validations,
                context: self.ctx,
            })),
            Err(err) => RunOutcome::Failed(Box::new(failure_for(err, self.ctx))),
        }
    }

    async fn run_stages(&mut self, dataset: Dataset) -> Result<RunArtifacts, PipelineError> {
        let (horizon, confidence_level) = (self.horizon, self.confidence_level);
        let dataset = self.run_stage(StageName::Ingestion, |ctx, _| {
            ingest(dataset, horizon, confidence_level, ctx)
        })?;

        let upload = self.run_stage(StageName::UploadValidation, |ctx, config| {
            apply_gates(ctx, run_gates(&GateInput::Upload(&dataset), &config.gates))
        })?;
        self.validations.push(upload);

        let dataset = self.run_stage(StageName::Sanitization, |ctx, _| {
            let (clean, report) = stages::sanitize(&dataset)?;
            ctx.set_metadata("sanitization", serde_json::to_value(&report).unwrap_or_default());
            Ok(clean)
        })?;

        let (checked, data_profile) = self.run_stage(StageName::Profiling, |ctx, config| {
            let checked = apply_gates(ctx, run_gates(&GateInput::Profile(&dataset), &config.gates))?;
            let data_profile = profile(&dataset);
            let penalty = ctx.quality_score() - INITIAL_QUALITY_SCORE;
            ctx.set_quality_score(INITIAL_QUALITY_SCORE * (1.0 - data_profile.missing_ratio) + penalty);
            ctx.set_metadata("profile", serde_json::to_value(&data_profile).unwrap_or_default());
            info!(
                component = "pipeline",
                event = "pipeline.profile.built",
                run_id = %ctx.run_id(),
                rows = data_profile.row_count,
                complexity = ?data_profile.complexity,
                has_usable_date = data_profile.has_usable_date,
                is_feature_rich = data_profile.is_feature_rich,
                has_seasonality = data_profile.has_seasonality,
                has_trend = data_profile.has_trend,
                quality_score = ctx.quality_score()
            );
            Ok((checked, data_profile))
        })?;
        self.validations.push(checked);

        let (checked, dataset) = self.run_stage(StageName::Preprocessing, |ctx, config| {
            let (prepared, report) = stages::preprocess(&dataset)?;
            ctx.set_metadata("preprocessing", serde_json::to_value(&report).unwrap_or_default());
            let checked = apply_gates(ctx, run_gates(&GateInput::Preprocess(&prepared), &config.gates))?;
            Ok((checked, prepared))
        })?;
        self.validations.push(checked);

        let dataset = self.run_stage(StageName::FeatureEngineering, |ctx, _| {
            let (engineered, added) = stages::engineer_features(&dataset)?;
            ctx.set_metadata("engineered_features", json!(added));
            Ok(engineered)
        })?;

        let decision = self.run_stage(StageName::ModelRouting, |ctx, _| {
            let decision = route(&data_profile);
            for warning in &decision.warnings {
                ctx.add_warning(warning.clone());
            }
            ctx.set_metadata(
                "routing",
                json!({
                    "primary": decision.primary,
                    "fallback_chain": decision.fallback_chain,
                    "rationale": decision.rationale,
                }),
            );
            Ok(decision)
        })?;

        let history: Vec<f64> = dataset
            .numeric_values(&dataset.roles().target)
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .collect();
        let dataset = Arc::new(dataset);

        let clock = self.begin(StageName::Training);
        let trained = match self.checkpoint() {
            Ok(()) => self.train(dataset, &decision).await,
            Err(err) => Err(err),
        };
        let trained = self.finish(StageName::Training, clock, trained)?;

        let checked = self.run_stage(StageName::TrainValidation, |ctx, config| {
            let input = GateInput::Train {
                metrics: &trained.metrics,
                forecast: &trained.forecast,
                history: &history,
            };
            apply_gates(ctx, run_gates(&input, &config.gates))
        })?;
        self.validations.push(checked);

        Ok(RunArtifacts {
            profile: data_profile,
            decision,
            metrics: trained.metrics,
            forecast: trained.forecast,
            attempts: trained.attempts,
            ensemble: trained.ensemble,
            model_type: trained.strategy,
        })
    }

    async fn train(
        &mut self,
        dataset: Arc<Dataset>,
        decision: &RoutingDecision,
    ) -> Result<TrainedModel, StageError> {
        let outcome = execute_with_fallback(
            dataset,
            decision,
            Arc::clone(&self.factory),
            self.config.attempt_budget(),
            &self.cancel,
        )
        .await?;

        let strategy = outcome.strategy();
        let FallbackOutcome {
            handle,
            metrics,
            attempts,
        } = outcome;
        let (horizon, confidence_level) = (self.horizon, self.confidence_level);
        let (handle, predicted) = tokio::task::spawn_blocking(move || {
            let predicted = handle.predict(horizon, confidence_level);
            (handle, predicted)
        })
        .await
        .map_err(|join_err| {
            StageError::Training(FallbackError::StrategyPanicked {
                strategy,
                detail: panic_detail(join_err),
            })
        })?;
        let forecast = predicted?;

        if strategy != decision.primary {
            self.ctx.add_warning(format!(
                "{} could not be trained; forecast produced by {strategy}",
                decision.primary
            ));
        }
        self.ctx.set_metadata("model_type", json!(strategy.as_str()));
        self.ctx.set_metadata("mape", json!(metrics.mape));
        self.ctx.set_metadata("accuracy_tier", json!(metrics.accuracy_tier().as_str()));
        self.ctx.set_metadata(
            "attempts",
            serde_json::to_value(&attempts).unwrap_or_default(),
        );

        Ok(TrainedModel {
            strategy,
            ensemble: handle.ensemble_report().cloned(),
            metrics,
            forecast,
            attempts,
        })
    }

    fn run_stage<T>(
        &mut self,
        stage: StageName,
        body: impl FnOnce(&mut PipelineContext, &PipelineConfig) -> Result<T, StageError>,
    ) -> Result<T, PipelineError> {
        let clock = self.begin(stage);
        let result = match self.checkpoint() {
            Ok(()) => body(&mut self.ctx, self.config.as_ref()),
            Err(err) => Err(err),
        };
        self.finish(stage, clock, result)
    }

    fn checkpoint(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn begin(&mut self, stage: StageName) -> StageClock {
        self.ctx.enter_stage(stage);
        self.publish();
        info!(
            component = "pipeline",
            event = "pipeline.stage.start",
            run_id = %self.ctx.run_id(),
            stage = %stage
        );
        StageClock {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    fn finish<T>(
        &mut self,
        stage: StageName,
        clock: StageClock,
        result: Result<T, StageError>,
    ) -> Result<T, PipelineError> {
        let duration_ms = clock.started.elapsed().as_millis() as u64;
        let record = StageRecord {
            stage,
            started_at: clock.started_at,
            finished_at: Utc::now(),
            duration_ms,
            status: if result.is_ok() {
                StageStatus::Completed
            } else {
                StageStatus::Failed
            },
            error: result.as_ref().err().map(ToString::to_string),
        };
        self.ctx.record_stage(record);
        self.publish();

        match result {
            Ok(value) => {
                info!(
                    component = "pipeline",
                    event = "pipeline.stage.finish",
                    run_id = %self.ctx.run_id(),
                    stage = %stage,
                    duration_ms
                );
                Ok(value)
            }
            Err(cause) => {
                let recoverable = cause.is_recoverable();
                warn!(
                    component = "pipeline",
                    event = "pipeline.stage.failed",
                    run_id = %self.ctx.run_id(),
                    stage = %stage,
                    duration_ms,
                    recoverable,
                    error = %cause
                );
                Err(PipelineError {
                    stage,
                    context: format!("run {} after {duration_ms} ms", self.ctx.run_id()),
                    recoverable,
                    cause,
                })
            }
        }
    }

    fn publish(&self) {
        self.status.send_replace(self.ctx.status());
    }

    async fn archive(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let ctx = self.ctx.clone();
        let run_id = ctx.run_id();
        let archived = tokio::task::spawn_blocking(move || store.archive(&ctx))
            .await
            .map_err(|err| err.to_string())
            .and_then(|res| res.map_err(|err| err.to_string()));
        if let Err(error) = archived {
            warn!(
                component = "pipeline",
                event = "pipeline.archive.failed",
                run_id = %run_id,
                error = %error
            );
        }
    }
}

fn ingest(
    dataset: Dataset,
    horizon: usize,
    confidence_level: f64,
    ctx: &mut PipelineContext,
) -> Result<Dataset, StageError> {
    let mut failures = Vec::new();
    if dataset.row_count() == 0 {
        failures.push(GateResult::fail(
            "dataset_not_empty",
            "dataset has no rows; upload at least one record",
            json!({ "rows": 0 }),
        ));
    }
    let missing = dataset.missing_roles();
    if !missing.is_empty() {
        failures.push(GateResult::fail(
            "roles_resolved",
            format!(
                "column(s) {} were not found; check the column mapping",
                missing.join(", ")
            ),
            json!({ "missing": missing, "columns": dataset.columns() }),
        ));
    }
    if horizon == 0 {
        failures.push(GateResult::fail(
            "horizon",
            "forecast horizon must be at least one period",
            json!({ "horizon": horizon }),
        ));
    }
    if !(confidence_level > 0.0 && confidence_level < 1.0) {
        failures.push(GateResult::fail(
            "confidence_level",
            "confidence level must be between 0 and 1, for example 0.95",
            json!({ "confidence_level": confidence_level }),
        ));
    }
    if !failures.is_empty() {
        return Err(ValidationError::new(Boundary::Upload, failures).into());
    }

    ctx.set_metadata("dataset_fingerprint", json!(dataset.fingerprint()));
    ctx.set_metadata(
        "dataset_shape",
        json!({ "rows": dataset.row_count(), "columns": dataset.column_count() }),
    );
    Ok(dataset)
}

/// Gate warnings go into the context; a failing boundary becomes a stage error.
fn apply_gates(
    ctx: &mut PipelineContext,
    validation: StageValidation,
) -> Result<StageValidation, StageError> {
    for warning in validation.warnings() {
        ctx.add_gate_warning(warning.message.clone());
    }
    ctx.set_metadata(
        &format!("validation.{}", validation.boundary),
        json!({
            "passed": validation.passed,
            "warnings": validation.warnings().count(),
            "failures": validation.failures().count(),
        }),
    );
    validation.into_result().map_err(StageError::from)
}

fn failure_for(err: PipelineError, ctx: PipelineContext) -> RunFailure {
    let correlation_id = Uuid::new_v4();
    let run_id = ctx.run_id();

    let (message, remediation) = match (&err.cause, err.recoverable) {
        (StageError::Validation(validation), true) => (
            format!(
                "the dataset did not pass {} validation during {}",
                validation.boundary, err.stage
            ),
            validation.messages(),
        ),
        (StageError::Cancelled, true) => (
            format!("the run was cancelled during {}", err.stage),
            vec!["start a new run when ready".to_string()],
        ),
        _ => {
            error!(
                component = "pipeline",
                event = "pipeline.run.internal_error",
                run_id = %run_id,
                correlation_id = %correlation_id,
                stage = %err.stage,
                error = %err
            );
            (GENERIC_FAILURE_MESSAGE.to_string(), Vec::new())
        }
    };

    RunFailure {
        run_id,
        correlation_id,
        stage: Some(err.stage),
        recoverable: err.recoverable,
        message,
        remediation,
        context: Some(ctx),
    }
}
