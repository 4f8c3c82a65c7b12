//! Built-in reference strategies and the scoring scaffold they share.
//!
//! Every single-series strategy is scored the same way: hold out the tail of
//! the series, score a few rolling-origin folds, then refit on everything.

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::dataset::Dataset;
use crate::ensemble::EnsembleForecaster;
use crate::forecaster::{
    z_for_confidence, ForecastResult, Forecaster, ForecasterError, StrategyFactory, StrategyId,
    TrainingFrame,
};
use crate::metrics::{percentage_error, TrainingMetrics};
use crate::profiler::mean_std;

const HOLDOUT_SHARE: f64 = 0.2;
const STABILITY_FOLDS: usize = 3;
const SEASON_LENGTH: usize = 7;
const AR_ORDER: usize = 3;
const BOOSTING_ROUNDS: usize = 50;
const BOOSTING_LEARNING_RATE: f64 = 0.1;
const BOOSTING_LAGS: [usize; 3] = [1, 2, 7];
const BOOSTING_MAX_THRESHOLDS: usize = 16;
const PIVOT_EPSILON: f64 = 1e-10;

/// Factory for the reference strategy set.
#[derive(Debug, Clone)]
pub struct BuiltinStrategies {
    moving_average_window: usize,
    ensemble_workers: usize,
}

impl Default for BuiltinStrategies {
    fn default() -> Self {
        Self::new(&PipelineConfig::default())
    }
}

impl BuiltinStrategies {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            moving_average_window: config.moving_average_window.max(1),
            ensemble_workers: config.ensemble_workers.max(1),
        }
    }
}

impl StrategyFactory for BuiltinStrategies {
    fn create(&self, strategy: StrategyId) -> Box<dyn Forecaster> {
        let kind = match strategy {
            StrategyId::Ensemble => {
                return Box::new(EnsembleForecaster::new(
                    Arc::new(self.clone()),
                    self.ensemble_workers,
                ))
            }
            StrategyId::LastValue => SeriesKind::LastValue,
            StrategyId::MovingAverage => SeriesKind::MovingAverage {
                window: self.moving_average_window,
            },
            StrategyId::SeasonalDecomposition => SeriesKind::Seasonal,
            StrategyId::FeatureBoosting => SeriesKind::Boosting,
            StrategyId::StatisticalAutoregressive => SeriesKind::Autoregressive,
        };
        Box::new(SeriesForecaster::new(kind))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeriesKind {
    LastValue,
    MovingAverage { window: usize },
    Seasonal,
    Boosting,
    Autoregressive,
}

impl SeriesKind {
    fn strategy(self) -> StrategyId {
        match self {
            SeriesKind::LastValue => StrategyId::LastValue,
            SeriesKind::MovingAverage { .. } => StrategyId::MovingAverage,
            SeriesKind::Seasonal => StrategyId::SeasonalDecomposition,
            SeriesKind::Boosting => StrategyId::FeatureBoosting,
            SeriesKind::Autoregressive => StrategyId::StatisticalAutoregressive,
        }
    }

    /// Training rows the fit needs, measured on the prefix before the holdout.
    fn min_training_rows(self) -> usize {
        match self {
            SeriesKind::LastValue | SeriesKind::MovingAverage { .. } => 0,
            SeriesKind::Seasonal => 2 * SEASON_LENGTH,
            SeriesKind::Boosting => 20,
            SeriesKind::Autoregressive => 10,
        }
    }

    fn fit(self, view: &SeriesView<'_>) -> Result<Box<dyn FittedModel>, String> {
        match self {
            SeriesKind::LastValue => Ok(Box::new(Constant(
                view.target.last().copied().unwrap_or(0.0),
            ))),
            SeriesKind::MovingAverage { window } => {
                let tail = &view.target[view.target.len().saturating_sub(window)..];
                let (mean, _) = mean_std(tail);
                Ok(Box::new(Constant(mean)))
            }
            SeriesKind::Seasonal => {
                fit_seasonal(view.target).map(|m| Box::new(m) as Box<dyn FittedModel>)
            }
            SeriesKind::Boosting => {
                fit_boosting(view).map(|m| Box::new(m) as Box<dyn FittedModel>)
            }
            SeriesKind::Autoregressive => {
                fit_autoregressive(view.target).map(|m| Box::new(m) as Box<dyn FittedModel>)
            }
        }
    }
}

/// Prefix of a training frame handed to a fit.
struct SeriesView<'a> {
    target: &'a [f64],
    features: Vec<&'a [f64]>,
}

impl<'a> SeriesView<'a> {
    fn prefix(frame: &'a TrainingFrame, len: usize) -> Self {
        Self {
            target: &frame.target[..len],
            features: frame.features.iter().map(|f| &f[..len]).collect(),
        }
    }
}

trait FittedModel: Send + Sync {
    fn forecast(&self, periods: usize) -> Vec<f64>;
}

struct SeriesFit {
    model: Box<dyn FittedModel>,
    metrics: TrainingMetrics,
    frame: TrainingFrame,
}

struct SeriesForecaster {
    kind: SeriesKind,
    fit: Option<SeriesFit>,
}

impl SeriesForecaster {
    fn new(kind: SeriesKind) -> Self {
        Self { kind, fit: None }
    }
}

impl Forecaster for SeriesForecaster {
    fn strategy(&self) -> StrategyId {
        self.kind.strategy()
    }

    fn train(&mut self, dataset: &Dataset) -> Result<TrainingMetrics, ForecasterError> {
        self.fit = None;
        let frame = TrainingFrame::from_dataset(dataset);
        let (model, metrics) = score_and_fit(self.kind, &frame)?;
        self.fit = Some(SeriesFit {
            model,
            metrics: metrics.clone(),
            frame,
        });
        Ok(metrics)
    }

    fn predict(
        &self,
        periods: usize,
        confidence_level: f64,
    ) -> Result<ForecastResult, ForecasterError> {
        let fit = self.fit.as_ref().ok_or(ForecasterError::NotTrained {
            strategy: self.strategy(),
        })?;
        let raw = fit.model.forecast(periods);
        let z = z_for_confidence(confidence_level);
        let half_widths: Vec<f64> = (1..=periods)
            .map(|h| z * fit.metrics.rmse * (h as f64).sqrt())
            .collect();

        Ok(ForecastResult::from_raw(
            self.strategy(),
            fit.frame.future_timestamps(periods),
            raw,
            &half_widths,
            confidence_level,
            fit.metrics.clone(),
        ))
    }
}

fn holdout_len(n: usize) -> usize {
    if n < 2 {
        return 0;
    }
    ((n as f64 * HOLDOUT_SHARE).round() as usize).clamp(1, n - 1)
}

fn score_and_fit(
    kind: SeriesKind,
    frame: &TrainingFrame,
) -> Result<(Box<dyn FittedModel>, TrainingMetrics), ForecasterError> {
    let strategy = kind.strategy();
    let n = frame.len();
    let holdout = holdout_len(n);
    let train_len = n - holdout;
    let min_rows = kind.min_training_rows();
    if train_len < min_rows {
        return Err(ForecasterError::training(
            strategy,
            format!("needs {min_rows} training rows, has {train_len}"),
        ));
    }

    let mut fold_errors = Vec::with_capacity(STABILITY_FOLDS);
    if holdout > 0 {
        for fold in 1..=STABILITY_FOLDS {
            let Some(origin) = n.checked_sub(fold * holdout) else {
                break;
            };
            if origin < min_rows.max(1) {
                break;
            }
            let Ok(model) = kind.fit(&SeriesView::prefix(frame, origin)) else {
                continue;
            };
            let actual = &frame.target[origin..origin + holdout];
            fold_errors.push(percentage_error(actual, &model.forecast(holdout)));
        }
    }

    let metrics = if holdout > 0 {
        let model = kind
            .fit(&SeriesView::prefix(frame, train_len))
            .map_err(|reason| ForecasterError::training(strategy, reason))?;
        let predicted = model.forecast(holdout);
        TrainingMetrics::from_holdout(&frame.target[train_len..], &predicted, train_len, fold_errors)
    } else {
        TrainingMetrics::from_holdout(&[], &[], n, fold_errors)
    };

    let model = kind
        .fit(&SeriesView::prefix(frame, n))
        .map_err(|reason| ForecasterError::training(strategy, reason))?;
    Ok((model, metrics))
}

struct Constant(f64);

impl FittedModel for Constant {
    fn forecast(&self, periods: usize) -> Vec<f64> {
        vec![self.0; periods]
    }
}

/// Additive linear trend plus a weekly seasonal index.
struct SeasonalModel {
    intercept: f64,
    slope: f64,
    seasonal: [f64; SEASON_LENGTH],
    len: usize,
}

fn fit_seasonal(target: &[f64]) -> Result<SeasonalModel, String> {
    if target.len() < 2 * SEASON_LENGTH {
        return Err(format!(
            "needs two full seasons ({} rows)",
            2 * SEASON_LENGTH
        ));
    }
    let (_, std) = mean_std(target);
    if std <= f64::EPSILON {
        return Err("target has no variance".to_string());
    }

    let (intercept, slope) = linear_trend(target);
    let mut sums = [0.0; SEASON_LENGTH];
    let mut counts = [0usize; SEASON_LENGTH];
    for (t, y) in target.iter().enumerate() {
        let residual = y - (intercept + slope * t as f64);
        sums[t % SEASON_LENGTH] += residual;
        counts[t % SEASON_LENGTH] += 1;
    }
    let mut seasonal = [0.0; SEASON_LENGTH];
    for j in 0..SEASON_LENGTH {
        seasonal[j] = sums[j] / counts[j].max(1) as f64;
    }
    let center = seasonal.iter().sum::<f64>() / SEASON_LENGTH as f64;
    for s in &mut seasonal {
        *s -= center;
    }

    Ok(SeasonalModel {
        intercept,
        slope,
        seasonal,
        len: target.len(),
    })
}

impl FittedModel for SeasonalModel {
    fn forecast(&self, periods: usize) -> Vec<f64> {
        (self.len..self.len + periods)
            .map(|t| self.intercept + self.slope * t as f64 + self.seasonal[t % SEASON_LENGTH])
            .collect()
    }
}

fn linear_trend(target: &[f64]) -> (f64, f64) {
    let n = target.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let (mean_y, _) = mean_std(target);
    let mut cov = 0.0;
    let mut var = 0.0;
    for (t, y) in target.iter().enumerate() {
        let dx = t as f64 - mean_x;
        cov += dx * (y - mean_y);
        var += dx * dx;
    }
    let slope = if var > 0.0 { cov / var } else { 0.0 };
    (mean_y - slope * mean_x, slope)
}

#[derive(Debug, Clone, Copy)]
struct Stump {
    column: usize,
    threshold: f64,
    left: f64,
    right: f64,
}

impl Stump {
    fn apply(&self, x: &[f64]) -> f64 {
        if x[self.column] <= self.threshold {
            self.left
        } else {
            self.right
        }
    }
}

/// Gradient-boosted stumps over target lags, the time index and feature columns.
/// Exogenous features are held at their last observed value when forecasting.
struct BoostingModel {
    base: f64,
    stumps: Vec<Stump>,
    history: Vec<f64>,
    last_features: Vec<f64>,
}

fn boosting_row(history: &[f64], t: usize, features: &[f64]) -> Vec<f64> {
    let mut row: Vec<f64> = BOOSTING_LAGS.iter().map(|lag| history[t - lag]).collect();
    row.push(t as f64);
    row.extend_from_slice(features);
    row
}

fn fit_boosting(view: &SeriesView<'_>) -> Result<BoostingModel, String> {
    let max_lag = BOOSTING_LAGS.iter().copied().max().unwrap_or(1);
    let n = view.target.len();
    if n <= max_lag + 1 {
        return Err(format!("needs more than {} rows for lag features", max_lag + 1));
    }

    let rows: Vec<Vec<f64>> = (max_lag..n)
        .map(|t| {
            let features: Vec<f64> = view.features.iter().map(|f| f[t]).collect();
            boosting_row(view.target, t, &features)
        })
        .collect();
    let labels = &view.target[max_lag..];
    let (base, _) = mean_std(labels);
    let mut fitted = vec![base; labels.len()];
    let mut stumps = Vec::with_capacity(BOOSTING_ROUNDS);

    for _ in 0..BOOSTING_ROUNDS {
        let residuals: Vec<f64> = labels.iter().zip(&fitted).map(|(y, f)| y - f).collect();
        let Some(stump) = best_stump(&rows, &residuals) else {
            break;
        };
        for (row, f) in rows.iter().zip(fitted.iter_mut()) {
            *f += BOOSTING_LEARNING_RATE * stump.apply(row);
        }
        stumps.push(stump);
    }

    Ok(BoostingModel {
        base,
        stumps,
        history: view.target.to_vec(),
        last_features: view.features.iter().map(|f| f[n - 1]).collect(),
    })
}

fn best_stump(rows: &[Vec<f64>], residuals: &[f64]) -> Option<Stump> {
    let columns = rows.first()?.len();
    let mut best: Option<(f64, Stump)> = None;

    for column in 0..columns {
        let mut values: Vec<f64> = rows.iter().map(|row| row[column]).collect();
        values.sort_by(|a, b| a.total_cmp(b));
        values.dedup();
        if values.len() < 2 {
            continue;
        }
        let step = (values.len() / BOOSTING_MAX_THRESHOLDS).max(1);
        for threshold in values[..values.len() - 1].iter().step_by(step) {
            let (mut left_sum, mut left_n, mut right_sum, mut right_n) = (0.0, 0usize, 0.0, 0usize);
            for (row, r) in rows.iter().zip(residuals) {
                if row[column] <= *threshold {
                    left_sum += r;
                    left_n += 1;
                } else {
                    right_sum += r;
                    right_n += 1;
                }
            }
            if left_n == 0 || right_n == 0 {
                continue;
            }
            let left = left_sum / left_n as f64;
            let right = right_sum / right_n as f64;
            let sse: f64 = rows
                .iter()
                .zip(residuals)
                .map(|(row, r)| {
                    let fit = if row[column] <= *threshold { left } else { right };
                    (r - fit) * (r - fit)
                })
                .sum();
            if best.as_ref().map_or(true, |(best_sse, _)| sse < *best_sse) {
                best = Some((
                    sse,
                    Stump {
                        column,
                        threshold: *threshold,
                        left,
                        right,
                    },
                ));
            }
        }
    }

    best.map(|(_, stump)| stump)
}

impl FittedModel for BoostingModel {
    fn forecast(&self, periods: usize) -> Vec<f64> {
        let mut history = self.history.clone();
        let mut out = Vec::with_capacity(periods);
        for _ in 0..periods {
            let t = history.len();
            let row = boosting_row(&history, t, &self.last_features);
            let value = self.base
                + self
                    .stumps
                    .iter()
                    .map(|stump| BOOSTING_LEARNING_RATE * stump.apply(&row))
                    .sum::<f64>();
            history.push(value);
            out.push(value);
        }
        out
    }
}

/// AR(p) with intercept, fitted by ordinary least squares.
struct AutoregressiveModel {
    coefficients: Vec<f64>,
    history: Vec<f64>,
}

fn fit_autoregressive(target: &[f64]) -> Result<AutoregressiveModel, String> {
    let p = AR_ORDER;
    if target.len() <= p + 1 {
        return Err(format!("needs more than {} rows for AR({p})", p + 1));
    }

    let k = p + 1;
    let mut xtx = vec![vec![0.0; k]; k];
    let mut xty = vec![0.0; k];
    for t in p..target.len() {
        let mut x = Vec::with_capacity(k);
        x.push(1.0);
        x.extend((1..=p).map(|lag| target[t - lag]));
        for i in 0..k {
            xty[i] += x[i] * target[t];
            for j in 0..k {
                xtx[i][j] += x[i] * x[j];
            }
        }
    }

    let coefficients = solve_linear_system(xtx, xty)
        .ok_or_else(|| "singular system in least-squares fit".to_string())?;
    Ok(AutoregressiveModel {
        coefficients,
        history: target.to_vec(),
    })
}

impl FittedModel for AutoregressiveModel {
    fn forecast(&self, periods: usize) -> Vec<f64> {
        let p = self.coefficients.len() - 1;
        let mut history = self.history.clone();
        let mut out = Vec::with_capacity(periods);
        for _ in 0..periods {
            let t = history.len();
            let value = self.coefficients[0]
                + (1..=p)
                    .map(|lag| self.coefficients[lag] * history[t - lag])
                    .sum::<f64>();
            history.push(value);
            out.push(value);
        }
        out
    }
}

/// Gaussian elimination with partial pivoting. `None` when the system is singular.
fn solve_linear_system(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|i, j| a[*i][col].abs().total_cmp(&a[*j][col].abs()))?;
        if a[pivot][col].abs() < PIVOT_EPSILON {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for c in col..n {
                a[row][c] -= factor * a[col][c];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|c| a[row][c] * x[c]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}
