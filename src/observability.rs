//! Shared logging configuration and initialization.

use std::env;

use thiserror::Error;
use tracing::{info, info_span, warn, Span};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::context::RunState;

/// Span name every event of a pipeline run is nested under.
pub const RUN_SPAN_NAME: &str = "pipeline_run";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Ok(level) = env::var("FORECAST_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Ok(format) = env::var("FORECAST_LOG_FORMAT") {
        if let Some(parsed) = parse_log_format(&format) {
            config.format = parsed;
        }
    }

    if let Ok(include_target) = env::var("FORECAST_LOG_TARGET") {
        if let Some(parsed) = parse_bool(&include_target) {
            config.include_target = parsed;
        }
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_writer(std::io::stderr)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(logging: &LoggingConfig, pipeline: &PipelineConfig) {
    info!(
        component = "forecast_run",
        event = "app.start",
        log_level = %logging.level,
        log_format = ?logging.format,
        include_target = logging.include_target,
        horizon = pipeline.horizon,
        confidence_level = pipeline.confidence_level,
        attempt_budget_ms = pipeline.attempt_budget_ms,
        ensemble_workers = pipeline.ensemble_workers
    );
}

/// Span carrying `run_id` and `session_id` for the lifetime of one run.
///
/// The orchestrator instruments the run task with it, so stage, gate and
/// fallback events logged inside the run inherit both ids.
pub fn run_span(run_id: Uuid, session_id: &str) -> Span {
    info_span!(
        "pipeline_run",
        component = "pipeline",
        run_id = %run_id,
        session_id = %session_id
    )
}

pub(crate) fn log_run_start(
    run_id: Uuid,
    session_id: &str,
    rows: usize,
    columns: usize,
    horizon: usize,
) {
    info!(
        component = "pipeline",
        event = "pipeline.run.start",
        run_id = %run_id,
        session_id = %session_id,
        rows,
        columns,
        horizon
    );
}

pub(crate) fn log_run_finish(
    run_id: Uuid,
    state: RunState,
    duration_ms: u64,
    quality_score: f64,
    warnings: usize,
) {
    match state {
        RunState::Completed => info!(
            component = "pipeline",
            event = "pipeline.run.finish",
            run_id = %run_id,
            state = ?state,
            duration_ms,
            quality_score,
            warnings
        ),
        RunState::Failed | RunState::Running => warn!(
            component = "pipeline",
            event = "pipeline.run.finish",
            run_id = %run_id,
            state = ?state,
            duration_ms,
            quality_score,
            warnings
        ),
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}
