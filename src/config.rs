//! Pipeline tuning knobs and their environment overrides.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmallDatasetPolicy {
    /// Datasets under `min_rows` raise a warning and take the small-data route.
    Degrade,
    /// Datasets under `min_rows` fail the upload gate.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    pub min_rows: usize,
    pub warn_rows: usize,
    pub min_columns: usize,
    pub max_missing_ratio: f64,
    pub warn_missing_ratio: f64,
    pub min_date_parse_rate: f64,
    pub max_mape: f64,
    pub outlier_sigma: f64,
    pub max_fold_cv: f64,
    pub small_dataset_policy: SmallDatasetPolicy,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_rows: 10,
            warn_rows: 30,
            min_columns: 2,
            max_missing_ratio: 0.5,
            warn_missing_ratio: 0.2,
            min_date_parse_rate: 0.5,
            max_mape: 50.0,
            outlier_sigma: 3.0,
            max_fold_cv: 0.3,
            small_dataset_policy: SmallDatasetPolicy::Degrade,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub horizon: usize,
    pub confidence_level: f64,
    pub attempt_budget_ms: u64,
    pub ensemble_workers: usize,
    pub moving_average_window: usize,
    pub gates: GateConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            horizon: 30,
            confidence_level: 0.95,
            attempt_budget_ms: 60_000,
            ensemble_workers: 3,
            moving_average_window: 7,
            gates: GateConfig::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid pipeline config: {0}")]
    Invalid(String),
}

impl PipelineConfig {
    pub fn attempt_budget(&self) -> Duration {
        Duration::from_millis(self.attempt_budget_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.horizon == 0 {
            return Err(ConfigError::Invalid("horizon must be > 0".to_string()));
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(ConfigError::Invalid(
                "confidence_level must be within (0, 1)".to_string(),
            ));
        }
        if self.attempt_budget_ms == 0 {
            return Err(ConfigError::Invalid(
                "attempt_budget_ms must be > 0".to_string(),
            ));
        }
        if self.ensemble_workers == 0 {
            return Err(ConfigError::Invalid(
                "ensemble_workers must be >= 1".to_string(),
            ));
        }
        if self.moving_average_window == 0 {
            return Err(ConfigError::Invalid(
                "moving_average_window must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn pipeline_config_from_env() -> PipelineConfig {
    let mut config = PipelineConfig::default();

    if let Some(horizon) = env_parse::<usize>("FORECAST_HORIZON") {
        config.horizon = horizon;
    }
    if let Some(level) = env_parse::<f64>("FORECAST_CONFIDENCE_LEVEL") {
        config.confidence_level = level;
    }
    if let Some(budget) = env_parse::<u64>("FORECAST_ATTEMPT_BUDGET_MS") {
        config.attempt_budget_ms = budget;
    }
    if let Some(workers) = env_parse::<usize>("FORECAST_ENSEMBLE_WORKERS") {
        config.ensemble_workers = workers;
    }
    if let Ok(raw) = env::var("FORECAST_SMALL_DATASET_POLICY") {
        if let Some(policy) = parse_small_dataset_policy(&raw) {
            config.gates.small_dataset_policy = policy;
        }
    }

    config
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|raw| raw.trim().parse::<T>().ok())
}

fn parse_small_dataset_policy(raw: &str) -> Option<SmallDatasetPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "degrade" => Some(SmallDatasetPolicy::Degrade),
        "reject" => Some(SmallDatasetPolicy::Reject),
        _ => None,
    }
}
