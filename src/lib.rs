//! Adaptive forecasting pipeline core crate.
//!
//! Current implemented scope:
//! - dataset snapshots, CSV loading and the sanitize/preprocess/feature stages
//! - data profiling and deterministic model routing
//! - fallback training under per-attempt time budgets, with a weighted ensemble
//! - validation gates at the upload, profile, preprocess and train boundaries
//! - the run orchestrator, its status channel and context archival

mod cancel;
mod config;
mod context;
mod dataset;
mod ensemble;
mod fallback;
mod forecaster;
mod gates;
mod metrics;
mod observability;
mod orchestrator;
mod profiler;
mod router;
mod stages;
mod store;
mod strategies;

pub use cancel::CancellationToken;
pub use config::{
    pipeline_config_from_env, ConfigError, GateConfig, PipelineConfig, SmallDatasetPolicy,
};
pub use context::{
    PipelineContext, RunState, RunStatus, StageName, StageRecord, StageStatus,
    INITIAL_QUALITY_SCORE, WARNING_PENALTY,
};
pub use dataset::{
    dataset_from_csv_reader, load_csv_dataset, parse_datetime, parse_numeric_text, Dataset,
    DatasetError, SemanticRoles, Value,
};
pub use ensemble::{
    compute_weights, Contribution, DroppedBase, EnsembleForecaster, EnsembleReport,
    EnsembleWeights, MIN_WEIGHTING_ERROR,
};
pub use fallback::{
    execute_with_fallback, AttemptError, AttemptOutcome, AttemptRecord, FallbackError,
    FallbackOutcome, FatalPipelineError,
};
pub use forecaster::{
    z_for_confidence, ForecastResult, Forecaster, ForecasterError, ForecasterHandle,
    HandleState, StrategyFactory, StrategyId, TrainingFrame,
};
pub use gates::{
    run_gates, Boundary, GateInput, GateResult, GateStatus, StageValidation, ValidationError,
};
pub use metrics::{
    coefficient_of_variation, mae, percentage_error, r_squared, rmse, AccuracyTier,
    TrainingMetrics,
};
pub use observability::{
    init_logging, log_app_start, logging_config_from_env, run_span, LogFormat, LoggingConfig,
    LoggingInitError, RUN_SPAN_NAME,
};
pub use orchestrator::{
    Orchestrator, PipelineError, RunFailure, RunHandle, RunOutcome, RunReport, RunRequest,
    StageError, GENERIC_FAILURE_MESSAGE,
};
pub use profiler::{
    profile, ComplexityTier, DataProfile, FEATURE_RICH_MIN_COLUMNS, SEASONALITY_THRESHOLD,
    TREND_THRESHOLD, USABLE_DATE_PARSE_RATE,
};
pub use router::{
    route, RoutingDecision, FEATURE_MODEL_MIN_ROWS, SMALL_DATASET_ROWS, TEMPORAL_MIN_ROWS,
};
pub use stages::{
    engineer_features, preprocess, sanitize, usable_date_column, PreprocessReport,
    SanitizeReport, CALENDAR_FEATURES,
};
pub use store::{InMemoryRunStore, RunStore, SqliteRunStore, StoreError};
pub use strategies::BuiltinStrategies;
