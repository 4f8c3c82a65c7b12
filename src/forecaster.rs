//! Train/predict contract for forecasting strategies and the handle that
//! tracks a strategy instance through `Untrained -> Trained | Failed`.

use std::fmt;
use std::time::Instant;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::Dataset;
use crate::ensemble::EnsembleReport;
use crate::metrics::TrainingMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyId {
    SeasonalDecomposition,
    FeatureBoosting,
    StatisticalAutoregressive,
    Ensemble,
    LastValue,
    MovingAverage,
}

impl StrategyId {
    /// Strategies that cannot structurally fail, in chain-tail order.
    pub const GUARANTEED_TAIL: [StrategyId; 2] = [StrategyId::LastValue, StrategyId::MovingAverage];

    pub const ENSEMBLE_BASES: [StrategyId; 3] = [
        StrategyId::SeasonalDecomposition,
        StrategyId::FeatureBoosting,
        StrategyId::StatisticalAutoregressive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyId::SeasonalDecomposition => "seasonal_decomposition",
            StrategyId::FeatureBoosting => "feature_boosting",
            StrategyId::StatisticalAutoregressive => "statistical_autoregressive",
            StrategyId::Ensemble => "ensemble",
            StrategyId::LastValue => "last_value",
            StrategyId::MovingAverage => "moving_average",
        }
    }

    pub fn is_guaranteed(self) -> bool {
        Self::GUARANTEED_TAIL.contains(&self)
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ForecasterError {
    #[error("{strategy} could not fit: {reason}")]
    Training { strategy: StrategyId, reason: String },
    #[error("{strategy} reported an unusable error metric ({value})")]
    InvalidMetric { strategy: StrategyId, value: f64 },
    #[error("{strategy} has not been trained")]
    NotTrained { strategy: StrategyId },
}

impl ForecasterError {
    pub fn training(strategy: StrategyId, reason: impl Into<String>) -> Self {
        ForecasterError::Training {
            strategy,
            reason: reason.into(),
        }
    }
}

/// One forecasting strategy. Implementations hold their fitted state and must
/// be movable onto a worker thread.
pub trait Forecaster: Send {
    fn strategy(&self) -> StrategyId;

    /// Fits against the dataset's resolved target (and date, when present).
    fn train(&mut self, dataset: &Dataset) -> Result<TrainingMetrics, ForecasterError>;

    fn predict(
        &self,
        periods: usize,
        confidence_level: f64,
    ) -> Result<ForecastResult, ForecasterError>;

    /// Per-member breakdown for strategies that combine other strategies.
    fn ensemble_report(&self) -> Option<&EnsembleReport> {
        None
    }
}

/// Builds strategy instances for the closed set of strategy ids.
pub trait StrategyFactory: Send + Sync + 'static {
    fn create(&self, strategy: StrategyId) -> Box<dyn Forecaster>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub strategy: StrategyId,
    pub timestamps: Option<Vec<NaiveDateTime>>,
    pub predictions: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    pub confidence_level: f64,
    pub metrics: TrainingMetrics,
    /// Negative raw predictions that were floored to zero.
    pub floored_count: usize,
}

impl ForecastResult {
    /// Floors negative predictions to zero and builds symmetric bounds from
    /// `half_widths` around the floored values.
    pub fn from_raw(
        strategy: StrategyId,
        timestamps: Option<Vec<NaiveDateTime>>,
        raw_predictions: Vec<f64>,
        half_widths: &[f64],
        confidence_level: f64,
        metrics: TrainingMetrics,
    ) -> Self {
        let mut floored_count = 0usize;
        let predictions: Vec<f64> = raw_predictions
            .into_iter()
            .map(|p| {
                if p < 0.0 {
                    floored_count += 1;
                    0.0
                } else {
                    p
                }
            })
            .collect();
        let lower = predictions
            .iter()
            .zip(half_widths.iter().chain(std::iter::repeat(&0.0)))
            .map(|(p, w)| (p - w.abs()).max(0.0))
            .collect();
        let upper = predictions
            .iter()
            .zip(half_widths.iter().chain(std::iter::repeat(&0.0)))
            .map(|(p, w)| p + w.abs())
            .collect();

        Self {
            strategy,
            timestamps,
            predictions,
            lower,
            upper,
            confidence_level,
            metrics,
            floored_count,
        }
    }

    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Untrained,
    Trained,
    Failed,
}

pub struct ForecasterHandle {
    forecaster: Box<dyn Forecaster>,
    state: HandleState,
    metrics: Option<TrainingMetrics>,
    failure: Option<ForecasterError>,
}

impl fmt::Debug for ForecasterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForecasterHandle")
            .field("strategy", &self.forecaster.strategy())
            .field("state", &self.state)
            .field("metrics", &self.metrics)
            .field("failure", &self.failure)
            .finish()
    }
}

impl ForecasterHandle {
    pub fn new(forecaster: Box<dyn Forecaster>) -> Self {
        Self {
            forecaster,
            state: HandleState::Untrained,
            metrics: None,
            failure: None,
        }
    }

    pub fn strategy(&self) -> StrategyId {
        self.forecaster.strategy()
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn metrics(&self) -> Option<&TrainingMetrics> {
        self.metrics.as_ref()
    }

    pub fn failure(&self) -> Option<&ForecasterError> {
        self.failure.as_ref()
    }

    pub fn ensemble_report(&self) -> Option<&EnsembleReport> {
        self.forecaster.ensemble_report()
    }

    /// Trains the wrapped strategy. A returned error metric that is NaN,
    /// infinite or negative moves the handle to `Failed`.
    pub fn train(&mut self, dataset: &Dataset) -> Result<TrainingMetrics, ForecasterError> {
        let strategy = self.strategy();
        let started = Instant::now();
        let outcome = self.forecaster.train(dataset).and_then(|mut metrics| {
            if !metrics.has_valid_error_metric() {
                return Err(ForecasterError::InvalidMetric {
                    strategy,
                    value: metrics.error_metric(),
                });
            }
            metrics.duration_ms = started.elapsed().as_millis() as u64;
            Ok(metrics)
        });

        match outcome {
            Ok(metrics) => {
                self.state = HandleState::Trained;
                self.metrics = Some(metrics.clone());
                self.failure = None;
                Ok(metrics)
            }
            Err(err) => {
                self.state = HandleState::Failed;
                self.metrics = None;
                self.failure = Some(err.clone());
                Err(err)
            }
        }
    }

    pub fn predict(
        &self,
        periods: usize,
        confidence_level: f64,
    ) -> Result<ForecastResult, ForecasterError> {
        if self.state != HandleState::Trained {
            return Err(ForecasterError::NotTrained {
                strategy: self.strategy(),
            });
        }
        self.forecaster.predict(periods, confidence_level)
    }
}

/// Numeric training view extracted from a dataset: rows with a valid target,
/// aligned dates when every kept row has one, and forward-filled features.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingFrame {
    pub target: Vec<f64>,
    pub dates: Option<Vec<NaiveDateTime>>,
    pub feature_names: Vec<String>,
    /// One vector per feature column, aligned with `target`.
    pub features: Vec<Vec<f64>>,
}

impl TrainingFrame {
    pub fn from_dataset(dataset: &Dataset) -> Self {
        let roles = dataset.roles();
        let target_values = dataset.numeric_values(&roles.target).unwrap_or_default();
        let kept: Vec<usize> = target_values
            .iter()
            .enumerate()
            .filter_map(|(idx, value)| value.map(|_| idx))
            .collect();
        let target: Vec<f64> = kept.iter().filter_map(|idx| target_values[*idx]).collect();

        let dates = roles
            .date
            .as_deref()
            .and_then(|date| dataset.temporal_values(date))
            .and_then(|values| kept.iter().map(|idx| values[*idx]).collect::<Option<Vec<_>>>())
            .filter(|dates| !dates.is_empty());

        let mut feature_names = Vec::new();
        let mut features = Vec::new();
        for name in &roles.features {
            if name == &roles.target || !dataset.is_numeric_column(name) {
                continue;
            }
            let Some(values) = dataset.numeric_values(name) else {
                continue;
            };
            let selected: Vec<Option<f64>> = kept.iter().map(|idx| values[*idx]).collect();
            feature_names.push(name.clone());
            features.push(forward_fill(&selected));
        }

        Self {
            target,
            dates,
            feature_names,
            features,
        }
    }

    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }

    /// Future timestamps stepped by the median observed spacing.
    pub fn future_timestamps(&self, periods: usize) -> Option<Vec<NaiveDateTime>> {
        let dates = self.dates.as_ref()?;
        let last = *dates.last()?;
        let mut gaps: Vec<chrono::Duration> = dates
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .filter(|gap| *gap > chrono::Duration::zero())
            .collect();
        if gaps.is_empty() {
            return None;
        }
        gaps.sort();
        let step = gaps[gaps.len() / 2];
        // None once the horizon runs past the representable calendar.
        (1..=periods)
            .map(|k| {
                let k = i32::try_from(k).ok()?;
                last.checked_add_signed(step.checked_mul(k)?)
            })
            .collect()
    }
}

fn forward_fill(values: &[Option<f64>]) -> Vec<f64> {
    let first_valid = values.iter().flatten().next().copied().unwrap_or(0.0);
    let mut last = first_valid;
    values
        .iter()
        .map(|value| {
            if let Some(v) = value {
                last = *v;
            }
            last
        })
        .collect()
}

/// Two-sided normal quantile for common confidence levels.
pub fn z_for_confidence(confidence_level: f64) -> f64 {
    match confidence_level {
        c if c >= 0.99 => 2.576,
        c if c >= 0.95 => 1.96,
        c if c >= 0.90 => 1.645,
        c if c >= 0.80 => 1.282,
        _ => 1.0,
    }
}
