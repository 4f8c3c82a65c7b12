//! Ordered validation checks run at the four pipeline boundaries.
//!
//! Warnings never block a run; a boundary passes iff none of its checks fail.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::config::{GateConfig, SmallDatasetPolicy};
use crate::dataset::Dataset;
use crate::forecaster::ForecastResult;
use crate::metrics::{coefficient_of_variation, TrainingMetrics};
use crate::profiler::mean_std;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    Upload,
    Profile,
    Preprocess,
    Train,
}

impl Boundary {
    pub fn as_str(self) -> &'static str {
        match self {
            Boundary::Upload => "upload",
            Boundary::Profile => "profile",
            Boundary::Preprocess => "preprocess",
            Boundary::Train => "train",
        }
    }
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pass,
    Warning,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub status: GateStatus,
    pub message: String,
    pub detail: serde_json::Value,
}

impl GateResult {
    fn new(
        name: &str,
        status: GateStatus,
        message: impl Into<String>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            detail,
        }
    }

    pub fn pass(name: &str, message: impl Into<String>, detail: serde_json::Value) -> Self {
        Self::new(name, GateStatus::Pass, message, detail)
    }

    pub fn warning(name: &str, message: impl Into<String>, detail: serde_json::Value) -> Self {
        Self::new(name, GateStatus::Warning, message, detail)
    }

    pub fn fail(name: &str, message: impl Into<String>, detail: serde_json::Value) -> Self {
        Self::new(name, GateStatus::Fail, message, detail)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageValidation {
    pub boundary: Boundary,
    pub results: Vec<GateResult>,
    pub passed: bool,
}

impl StageValidation {
    pub fn from_results(boundary: Boundary, results: Vec<GateResult>) -> Self {
        let passed = results.iter().all(|r| r.status != GateStatus::Fail);
        Self {
            boundary,
            results,
            passed,
        }
    }

    pub fn warnings(&self) -> impl Iterator<Item = &GateResult> {
        self.results
            .iter()
            .filter(|r| r.status == GateStatus::Warning)
    }

    pub fn failures(&self) -> impl Iterator<Item = &GateResult> {
        self.results.iter().filter(|r| r.status == GateStatus::Fail)
    }

    /// `Err` with the failed checks when the boundary did not pass.
    pub fn into_result(self) -> Result<StageValidation, ValidationError> {
        if self.passed {
            Ok(self)
        } else {
            Err(ValidationError {
                boundary: self.boundary,
                failures: self.failures().cloned().collect(),
            })
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{boundary} validation failed: {}", join_messages(.failures))]
pub struct ValidationError {
    pub boundary: Boundary,
    pub failures: Vec<GateResult>,
}

impl ValidationError {
    pub fn new(boundary: Boundary, failures: Vec<GateResult>) -> Self {
        Self { boundary, failures }
    }

    pub fn messages(&self) -> Vec<String> {
        self.failures.iter().map(|r| r.message.clone()).collect()
    }
}

fn join_messages(failures: &[GateResult]) -> String {
    failures
        .iter()
        .map(|r| r.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// What a boundary's checks look at. The variant selects the boundary.
#[derive(Debug, Clone, Copy)]
pub enum GateInput<'a> {
    Upload(&'a Dataset),
    Profile(&'a Dataset),
    Preprocess(&'a Dataset),
    Train {
        metrics: &'a TrainingMetrics,
        forecast: &'a ForecastResult,
        history: &'a [f64],
    },
}

impl GateInput<'_> {
    pub fn boundary(&self) -> Boundary {
        match self {
            GateInput::Upload(_) => Boundary::Upload,
            GateInput::Profile(_) => Boundary::Profile,
            GateInput::Preprocess(_) => Boundary::Preprocess,
            GateInput::Train { .. } => Boundary::Train,
        }
    }
}

pub fn run_gates(input: &GateInput<'_>, config: &GateConfig) -> StageValidation {
    let results = match input {
        GateInput::Upload(dataset) => upload_checks(dataset, config),
        GateInput::Profile(dataset) => profile_checks(dataset, config),
        GateInput::Preprocess(dataset) => preprocess_checks(dataset),
        GateInput::Train {
            metrics,
            forecast,
            history,
        } => train_checks(metrics, forecast, history, config),
    };

    let boundary = input.boundary();
    for result in &results {
        match result.status {
            GateStatus::Pass => {}
            GateStatus::Warning => warn!(
                component = "gates",
                event = "gates.check.warning",
                boundary = %boundary,
                gate = %result.name,
                message = %result.message
            ),
            GateStatus::Fail => warn!(
                component = "gates",
                event = "gates.check.failed",
                boundary = %boundary,
                gate = %result.name,
                message = %result.message
            ),
        }
    }

    StageValidation::from_results(boundary, results)
}

fn upload_checks(dataset: &Dataset, config: &GateConfig) -> Vec<GateResult> {
    let rows = dataset.row_count();
    let row_detail = json!({ "rows": rows, "min_rows": config.min_rows, "warn_rows": config.warn_rows });
    let row_check = if rows == 0 {
        GateResult::fail("row_count", "dataset has no rows; upload at least one record", row_detail)
    } else if rows < config.min_rows {
        match config.small_dataset_policy {
            SmallDatasetPolicy::Degrade => GateResult::warning(
                "row_count",
                format!(
                    "very small dataset: {rows} rows (fewer than {}); forecasts will use a simple baseline",
                    config.min_rows
                ),
                row_detail,
            ),
            SmallDatasetPolicy::Reject => GateResult::fail(
                "row_count",
                format!(
                    "dataset has {rows} rows; at least {} are required, upload more history",
                    config.min_rows
                ),
                row_detail,
            ),
        }
    } else if rows < config.warn_rows {
        GateResult::warning(
            "row_count",
            format!(
                "{rows} rows is below the recommended {}; accuracy may be limited",
                config.warn_rows
            ),
            row_detail,
        )
    } else {
        GateResult::pass("row_count", format!("{rows} rows"), row_detail)
    };

    let columns = dataset.column_count();
    let column_detail = json!({ "columns": columns, "min_columns": config.min_columns });
    let column_check = if columns < config.min_columns {
        GateResult::fail(
            "column_count",
            format!(
                "dataset has {columns} column(s); at least {} are required (a date and a target)",
                config.min_columns
            ),
            column_detail,
        )
    } else {
        GateResult::pass("column_count", format!("{columns} columns"), column_detail)
    };

    vec![row_check, column_check]
}

fn profile_checks(dataset: &Dataset, config: &GateConfig) -> Vec<GateResult> {
    let ratio = dataset.missing_ratio();
    let missing_detail = json!({
        "missing_ratio": ratio,
        "max_missing_ratio": config.max_missing_ratio,
        "warn_missing_ratio": config.warn_missing_ratio,
    });
    let missing_check = if ratio >= config.max_missing_ratio {
        GateResult::fail(
            "missing_values",
            format!(
                "{:.0}% of values are missing; fill gaps so fewer than {:.0}% are empty",
                ratio * 100.0,
                config.max_missing_ratio * 100.0
            ),
            missing_detail,
        )
    } else if ratio > config.warn_missing_ratio {
        GateResult::warning(
            "missing_values",
            format!("{:.0}% of values are missing and will be imputed", ratio * 100.0),
            missing_detail,
        )
    } else {
        GateResult::pass(
            "missing_values",
            format!("{:.1}% missing", ratio * 100.0),
            missing_detail,
        )
    };

    let date_check = match dataset.date_parse_rate() {
        None => GateResult::pass("date_parse_rate", "no date column configured", json!({})),
        Some(rate) if rate < config.min_date_parse_rate => GateResult::warning(
            "date_parse_rate",
            format!(
                "only {:.0}% of date values could be parsed; use ISO dates such as 2024-01-31",
                rate * 100.0
            ),
            json!({ "parse_rate": rate, "min_parse_rate": config.min_date_parse_rate }),
        ),
        Some(rate) => GateResult::pass(
            "date_parse_rate",
            format!("{:.0}% of dates parsed", rate * 100.0),
            json!({ "parse_rate": rate }),
        ),
    };

    let target = &dataset.roles().target;
    let valid = dataset
        .numeric_values(target)
        .map(|values| values.iter().flatten().count())
        .unwrap_or(0);
    let target_detail = json!({ "target": target, "valid_values": valid });
    let target_check = if valid == 0 {
        GateResult::fail(
            "target_numeric",
            format!("target column '{target}' has no numeric values"),
            target_detail,
        )
    } else {
        GateResult::pass(
            "target_numeric",
            format!("{valid} numeric target values"),
            target_detail,
        )
    };

    vec![missing_check, date_check, target_check]
}

fn preprocess_checks(dataset: &Dataset) -> Vec<GateResult> {
    let rows = dataset.row_count();
    let rows_check = if rows == 0 {
        GateResult::fail(
            "rows_remaining",
            "no rows remain after cleaning; check the date and target columns",
            json!({ "rows": rows }),
        )
    } else {
        GateResult::pass(
            "rows_remaining",
            format!("{rows} rows remain"),
            json!({ "rows": rows }),
        )
    };

    let numeric = dataset.numeric_columns();
    let numeric_detail = json!({ "numeric_columns": numeric });
    let numeric_check = if numeric.is_empty() {
        GateResult::fail(
            "numeric_columns",
            "no numeric columns remain after preprocessing",
            numeric_detail,
        )
    } else {
        GateResult::pass(
            "numeric_columns",
            format!("{} numeric columns", numeric.len()),
            numeric_detail,
        )
    };

    vec![rows_check, numeric_check]
}

fn train_checks(
    metrics: &TrainingMetrics,
    forecast: &ForecastResult,
    history: &[f64],
    config: &GateConfig,
) -> Vec<GateResult> {
    let accuracy_detail = json!({
        "mape": metrics.mape,
        "max_mape": config.max_mape,
        "tier": metrics.accuracy_tier().as_str(),
    });
    let accuracy_check = if metrics.mape > config.max_mape {
        GateResult::warning(
            "accuracy",
            format!(
                "held-out error is {:.1}% (above {:.0}%); treat the forecast as indicative",
                metrics.mape, config.max_mape
            ),
            accuracy_detail,
        )
    } else {
        GateResult::pass(
            "accuracy",
            format!("held-out error {:.1}% ({})", metrics.mape, metrics.accuracy_tier().as_str()),
            accuracy_detail,
        )
    };

    let floor_check = if forecast.floored_count > 0 {
        GateResult::warning(
            "negative_predictions",
            format!(
                "{} negative predictions were floored to zero",
                forecast.floored_count
            ),
            json!({ "floored": forecast.floored_count }),
        )
    } else {
        GateResult::pass(
            "negative_predictions",
            "no negative predictions",
            json!({ "floored": 0 }),
        )
    };

    let (mean, std) = mean_std(history);
    let outliers = if std > f64::EPSILON {
        forecast
            .predictions
            .iter()
            .filter(|p| (*p - mean).abs() > config.outlier_sigma * std)
            .count()
    } else {
        0
    };
    let outlier_detail = json!({
        "outliers": outliers,
        "history_mean": mean,
        "history_std": std,
        "sigma": config.outlier_sigma,
    });
    let outlier_check = if outliers > 0 {
        GateResult::warning(
            "prediction_range",
            format!(
                "{outliers} predictions fall more than {} standard deviations from the historical mean",
                config.outlier_sigma
            ),
            outlier_detail,
        )
    } else {
        GateResult::pass(
            "prediction_range",
            "predictions within historical range",
            outlier_detail,
        )
    };

    let folds = &metrics.fold_errors;
    let stability_check = match coefficient_of_variation(folds) {
        None if folds.len() < 2 => GateResult::pass(
            "fold_stability",
            "not enough folds to measure stability",
            json!({ "folds": folds.len() }),
        ),
        Some(cv) if cv <= config.max_fold_cv => GateResult::pass(
            "fold_stability",
            format!("fold error variation {cv:.2}"),
            json!({ "folds": folds.len(), "cv": cv }),
        ),
        cv => GateResult::warning(
            "fold_stability",
            format!(
                "error varies strongly across refits (cv {}); the model may be unstable",
                cv.map(|v| format!("{v:.2}")).unwrap_or_else(|| "undefined".to_string())
            ),
            json!({ "folds": folds.len(), "cv": cv, "max_cv": config.max_fold_cv }),
        ),
    };

    vec![accuracy_check, floor_check, outlier_check, stability_check]
}
