//! Inverse-error weighted combination of independently trained base strategies.

use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dataset::Dataset;
use crate::forecaster::{
    ForecastResult, Forecaster, ForecasterError, ForecasterHandle, StrategyFactory, StrategyId,
};
use crate::metrics::TrainingMetrics;

/// Error floor applied before inverting, so a perfect fit cannot take all weight.
pub const MIN_WEIGHTING_ERROR: f64 = 0.1;

pub type EnsembleWeights = BTreeMap<StrategyId, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub strategy: StrategyId,
    pub weight: f64,
    pub mape: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedBase {
    pub strategy: StrategyId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnsembleReport {
    pub contributions: Vec<Contribution>,
    pub dropped: Vec<DroppedBase>,
}

/// Weight per strategy = `1 / max(error, MIN_WEIGHTING_ERROR)`, normalized to sum to 1.
pub fn compute_weights(errors: &[(StrategyId, f64)]) -> EnsembleWeights {
    let raw: Vec<(StrategyId, f64)> = errors
        .iter()
        .map(|(strategy, error)| (*strategy, 1.0 / error.max(MIN_WEIGHTING_ERROR)))
        .collect();
    let total: f64 = raw.iter().map(|(_, score)| score).sum();
    if total <= 0.0 {
        return EnsembleWeights::new();
    }
    raw.into_iter()
        .map(|(strategy, score)| (strategy, score / total))
        .collect()
}

struct Member {
    handle: ForecasterHandle,
    weight: f64,
}

pub struct EnsembleForecaster {
    factory: Arc<dyn StrategyFactory>,
    workers: usize,
    bases: Vec<StrategyId>,
    members: Vec<Member>,
    metrics: Option<TrainingMetrics>,
    report: Option<EnsembleReport>,
}

impl EnsembleForecaster {
    pub fn new(factory: Arc<dyn StrategyFactory>, workers: usize) -> Self {
        Self::with_bases(factory, workers, StrategyId::ENSEMBLE_BASES.to_vec())
    }

    pub fn with_bases(
        factory: Arc<dyn StrategyFactory>,
        workers: usize,
        bases: Vec<StrategyId>,
    ) -> Self {
        Self {
            factory,
            workers: workers.max(1),
            bases,
            members: Vec::new(),
            metrics: None,
            report: None,
        }
    }

    pub fn weights(&self) -> EnsembleWeights {
        self.members
            .iter()
            .map(|member| (member.handle.strategy(), member.weight))
            .collect()
    }

    fn train_bases(
        &self,
        dataset: &Dataset,
    ) -> Result<Vec<(ForecasterHandle, Result<TrainingMetrics, ForecasterError>)>, ForecasterError>
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|err| {
                ForecasterError::training(
                    StrategyId::Ensemble,
                    format!("failed to create worker pool: {err}"),
                )
            })?;

        let factory = &self.factory;
        let bases = &self.bases;
        Ok(pool.install(|| {
            bases
                .par_iter()
                .map(|strategy| {
                    let mut handle = ForecasterHandle::new(factory.create(*strategy));
                    let outcome = handle.train(dataset);
                    (handle, outcome)
                })
                .collect()
        }))
    }
}

impl Forecaster for EnsembleForecaster {
    fn strategy(&self) -> StrategyId {
        StrategyId::Ensemble
    }

    fn train(&mut self, dataset: &Dataset) -> Result<TrainingMetrics, ForecasterError> {
        self.members.clear();
        self.metrics = None;
        self.report = None;

        let settled = self.train_bases(dataset)?;

        let mut trained = Vec::new();
        let mut dropped = Vec::new();
        for (handle, outcome) in settled {
            match outcome {
                Ok(metrics) => trained.push((handle, metrics)),
                Err(err) => {
                    warn!(
                        component = "ensemble",
                        event = "ensemble.base.failed",
                        strategy = %handle.strategy(),
                        error = %err
                    );
                    dropped.push(DroppedBase {
                        strategy: handle.strategy(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        if trained.is_empty() {
            return Err(ForecasterError::training(
                StrategyId::Ensemble,
                "every base strategy failed to train",
            ));
        }

        let errors: Vec<(StrategyId, f64)> = trained
            .iter()
            .map(|(handle, metrics)| (handle.strategy(), metrics.error_metric()))
            .collect();
        let weights = compute_weights(&errors);

        info!(
            component = "ensemble",
            event = "ensemble.weights",
            weights = ?weights,
            dropped = dropped.len()
        );

        let weighted: Vec<(f64, &TrainingMetrics)> = trained
            .iter()
            .map(|(handle, metrics)| {
                (
                    weights.get(&handle.strategy()).copied().unwrap_or(0.0),
                    metrics,
                )
            })
            .collect();
        let metrics = combine_metrics(&weighted);

        let contributions = trained
            .iter()
            .map(|(handle, m)| Contribution {
                strategy: handle.strategy(),
                weight: weights.get(&handle.strategy()).copied().unwrap_or(0.0),
                mape: m.mape,
            })
            .collect();
        self.members = trained
            .into_iter()
            .map(|(handle, _)| {
                let weight = weights.get(&handle.strategy()).copied().unwrap_or(0.0);
                Member { handle, weight }
            })
            .collect();
        self.report = Some(EnsembleReport {
            contributions,
            dropped,
        });
        self.metrics = Some(metrics.clone());
        Ok(metrics)
    }

    fn predict(
        &self,
        periods: usize,
        confidence_level: f64,
    ) -> Result<ForecastResult, ForecasterError> {
        let metrics = self.metrics.clone().ok_or(ForecasterError::NotTrained {
            strategy: StrategyId::Ensemble,
        })?;

        let mut predictions = vec![0.0; periods];
        let mut lower = vec![0.0; periods];
        let mut upper = vec![0.0; periods];
        let mut timestamps = None;
        let mut floored_count = 0usize;

        for member in &self.members {
            let forecast = member.handle.predict(periods, confidence_level)?;
            if forecast.len() != periods
                || forecast.lower.len() != periods
                || forecast.upper.len() != periods
            {
                return Err(ForecasterError::training(
                    member.handle.strategy(),
                    format!(
                        "returned {} of {periods} forecast points",
                        forecast.len()
                    ),
                ));
            }
            for offset in 0..periods {
                predictions[offset] += member.weight * forecast.predictions[offset];
                lower[offset] += member.weight * forecast.lower[offset];
                upper[offset] += member.weight * forecast.upper[offset];
            }
            floored_count = floored_count.max(forecast.floored_count);
            if timestamps.is_none() {
                timestamps = forecast.timestamps;
            }
        }

        Ok(ForecastResult {
            strategy: StrategyId::Ensemble,
            timestamps,
            predictions,
            lower,
            upper,
            confidence_level,
            metrics,
            floored_count,
        })
    }

    fn ensemble_report(&self) -> Option<&EnsembleReport> {
        self.report.as_ref()
    }
}

/// Weight-sum of base metrics. Fold errors are combined over the shortest
/// fold list so every offset has a contribution from every member.
fn combine_metrics(weighted: &[(f64, &TrainingMetrics)]) -> TrainingMetrics {
    let sum = |f: fn(&TrainingMetrics) -> f64| -> f64 {
        weighted.iter().map(|(w, m)| w * f(m)).sum()
    };
    let folds = weighted
        .iter()
        .map(|(_, m)| m.fold_errors.len())
        .min()
        .unwrap_or(0);
    let fold_errors: Vec<f64> = (0..folds)
        .map(|i| weighted.iter().map(|(w, m)| w * m.fold_errors[i]).sum::<f64>())
        .collect();

    TrainingMetrics {
        mape: sum(|m| m.mape),
        rmse: sum(|m| m.rmse),
        mae: sum(|m| m.mae),
        r2: sum(|m| m.r2).clamp(0.0, 1.0),
        train_samples: weighted.iter().map(|(_, m)| m.train_samples).max().unwrap_or(0),
        holdout_samples: weighted
            .iter()
            .map(|(_, m)| m.holdout_samples)
            .max()
            .unwrap_or(0),
        duration_ms: 0,
        fold_errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{SemanticRoles, Value};

    struct Stub {
        strategy: StrategyId,
        mape: Option<f64>,
        level: f64,
        truncated: bool,
    }

    impl Forecaster for Stub {
        fn strategy(&self) -> StrategyId {
            self.strategy
        }

        fn train(&mut self, _dataset: &Dataset) -> Result<TrainingMetrics, ForecasterError> {
            let Some(mape) = self.mape else {
                return Err(ForecasterError::training(self.strategy, "stub refuses to fit"));
            };
            let mut metrics = TrainingMetrics::from_holdout(&[1.0], &[1.0], 10, vec![mape, mape]);
            metrics.mape = mape;
            Ok(metrics)
        }

        fn predict(
            &self,
            periods: usize,
            confidence_level: f64,
        ) -> Result<ForecastResult, ForecasterError> {
            let points = if self.truncated {
                periods.saturating_sub(1)
            } else {
                periods
            };
            Ok(ForecastResult::from_raw(
                self.strategy,
                None,
                vec![self.level; points],
                &vec![1.0; points],
                confidence_level,
                TrainingMetrics::from_holdout(&[], &[], 0, Vec::new()),
            ))
        }
    }

    struct StubFactory {
        mapes: BTreeMap<StrategyId, Option<f64>>,
        truncated: Option<StrategyId>,
    }

    impl StrategyFactory for StubFactory {
        fn create(&self, strategy: StrategyId) -> Box<dyn Forecaster> {
            let level = match strategy {
                StrategyId::SeasonalDecomposition => 10.0,
                StrategyId::FeatureBoosting => 40.0,
                _ => 100.0,
            };
            Box::new(Stub {
                strategy,
                mape: self.mapes.get(&strategy).copied().flatten(),
                level,
                truncated: self.truncated == Some(strategy),
            })
        }
    }

    fn dataset() -> Dataset {
        Dataset::new(
            vec!["y".to_string()],
            vec![vec![Value::Number(1.0)], vec![Value::Number(2.0)]],
            SemanticRoles::new("y"),
        )
        .unwrap()
    }

    fn ensemble(mapes: &[(StrategyId, Option<f64>)]) -> EnsembleForecaster {
        let factory = StubFactory {
            mapes: mapes.iter().copied().collect(),
            truncated: None,
        };
        EnsembleForecaster::new(Arc::new(factory), 3)
    }

    #[test]
    fn weights_follow_inverse_error() {
        let weights = compute_weights(&[
            (StrategyId::SeasonalDecomposition, 5.0),
            (StrategyId::FeatureBoosting, 10.0),
        ]);
        assert!((weights[&StrategyId::SeasonalDecomposition] - 0.667).abs() < 0.001);
        assert!((weights[&StrategyId::FeatureBoosting] - 0.333).abs() < 0.001);
    }

    #[test]
    fn weights_sum_to_one_and_floor_small_errors() {
        let weights = compute_weights(&[
            (StrategyId::SeasonalDecomposition, 0.0),
            (StrategyId::FeatureBoosting, 0.05),
            (StrategyId::StatisticalAutoregressive, 37.5),
        ]);
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert_eq!(
            weights[&StrategyId::SeasonalDecomposition],
            weights[&StrategyId::FeatureBoosting]
        );
        assert!(compute_weights(&[]).is_empty());
    }

    #[test]
    fn failed_base_is_dropped_and_rest_are_combined() {
        let mut model = ensemble(&[
            (StrategyId::SeasonalDecomposition, Some(5.0)),
            (StrategyId::FeatureBoosting, Some(10.0)),
            (StrategyId::StatisticalAutoregressive, None),
        ]);
        let metrics = model.train(&dataset()).unwrap();

        let report = model.ensemble_report().unwrap();
        assert_eq!(report.contributions.len(), 2);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].strategy, StrategyId::StatisticalAutoregressive);

        let expected_mape = (2.0 / 3.0) * 5.0 + (1.0 / 3.0) * 10.0;
        assert!((metrics.mape - expected_mape).abs() < 1e-9);
        assert_eq!(metrics.fold_errors.len(), 2);

        let forecast = model.predict(3, 0.95).unwrap();
        let expected = (2.0 / 3.0) * 10.0 + (1.0 / 3.0) * 40.0;
        assert!(forecast
            .predictions
            .iter()
            .all(|p| (p - expected).abs() < 1e-9));
        assert_eq!(forecast.strategy, StrategyId::Ensemble);
        let total: f64 = model.weights().values().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn all_bases_failing_is_a_training_error() {
        let mut model = ensemble(&[]);
        let err = model.train(&dataset()).unwrap_err();
        assert!(matches!(
            err,
            ForecasterError::Training {
                strategy: StrategyId::Ensemble,
                ..
            }
        ));
        assert!(model.predict(2, 0.95).is_err());
    }

    #[test]
    fn invalid_base_metric_counts_as_failure() {
        let mut model = ensemble(&[
            (StrategyId::SeasonalDecomposition, Some(f64::NAN)),
            (StrategyId::FeatureBoosting, Some(8.0)),
        ]);
        model.train(&dataset()).unwrap();
        assert_eq!(model.weights().len(), 1);
        assert_eq!(model.weights()[&StrategyId::FeatureBoosting], 1.0);
    }

    #[test]
    fn short_base_forecast_is_rejected() {
        let factory = StubFactory {
            mapes: [
                (StrategyId::SeasonalDecomposition, Some(5.0)),
                (StrategyId::FeatureBoosting, Some(10.0)),
            ]
            .into_iter()
            .collect(),
            truncated: Some(StrategyId::FeatureBoosting),
        };
        let mut model = EnsembleForecaster::new(Arc::new(factory), 2);
        model.train(&dataset()).unwrap();

        let err = model.predict(4, 0.95).unwrap_err();
        assert!(matches!(
            err,
            ForecasterError::Training {
                strategy: StrategyId::FeatureBoosting,
                ..
            }
        ));
    }
}
