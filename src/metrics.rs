//! Standardized accuracy metrics shared by every strategy.

use serde::{Deserialize, Serialize};

use crate::profiler::mean_std;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyTier {
    Excellent,
    VeryGood,
    Good,
    Fair,
    Poor,
}

impl AccuracyTier {
    pub fn from_mape(mape: f64) -> Self {
        if mape < 5.0 {
            AccuracyTier::Excellent
        } else if mape < 10.0 {
            AccuracyTier::VeryGood
        } else if mape < 20.0 {
            AccuracyTier::Good
        } else if mape < 30.0 {
            AccuracyTier::Fair
        } else {
            AccuracyTier::Poor
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccuracyTier::Excellent => "excellent",
            AccuracyTier::VeryGood => "very good",
            AccuracyTier::Good => "good",
            AccuracyTier::Fair => "fair",
            AccuracyTier::Poor => "poor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    /// Mean absolute percentage error, in percent.
    pub mape: f64,
    pub rmse: f64,
    pub mae: f64,
    /// Goodness of fit, clamped into [0, 1].
    pub r2: f64,
    pub train_samples: usize,
    pub holdout_samples: usize,
    pub duration_ms: u64,
    /// Held-out MAPE of each rolling-origin refit.
    pub fold_errors: Vec<f64>,
}

impl TrainingMetrics {
    pub fn from_holdout(
        actual: &[f64],
        predicted: &[f64],
        train_samples: usize,
        fold_errors: Vec<f64>,
    ) -> Self {
        Self {
            mape: percentage_error(actual, predicted),
            rmse: rmse(actual, predicted),
            mae: mae(actual, predicted),
            r2: r_squared(actual, predicted),
            train_samples,
            holdout_samples: actual.len().min(predicted.len()),
            duration_ms: 0,
            fold_errors,
        }
    }

    /// The metric used for ranking, weighting and the trained-state contract.
    pub fn error_metric(&self) -> f64 {
        self.mape
    }

    pub fn has_valid_error_metric(&self) -> bool {
        self.mape.is_finite() && self.mape >= 0.0
    }

    pub fn accuracy_tier(&self) -> AccuracyTier {
        AccuracyTier::from_mape(self.mape)
    }
}

/// MAPE in percent over non-zero actuals; zero actuals are left out of the
/// denominator. Returns 0 when no actual is non-zero.
pub fn percentage_error(actual: &[f64], predicted: &[f64]) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for (a, p) in actual.iter().zip(predicted.iter()) {
        if *a == 0.0 {
            continue;
        }
        total += ((a - p) / a).abs();
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        total / count as f64 * 100.0
    }
}

pub fn rmse(actual: &[f64], predicted: &[f64]) -> f64 {
    let n = actual.len().min(predicted.len());
    if n == 0 {
        return 0.0;
    }
    let sum = actual
        .iter()
        .zip(predicted.iter())
        .map(|(a, p)| (a - p) * (a - p))
        .sum::<f64>();
    (sum / n as f64).sqrt()
}

pub fn mae(actual: &[f64], predicted: &[f64]) -> f64 {
    let n = actual.len().min(predicted.len());
    if n == 0 {
        return 0.0;
    }
    actual
        .iter()
        .zip(predicted.iter())
        .map(|(a, p)| (a - p).abs())
        .sum::<f64>()
        / n as f64
}

pub fn r_squared(actual: &[f64], predicted: &[f64]) -> f64 {
    let n = actual.len().min(predicted.len());
    if n == 0 {
        return 0.0;
    }
    let (mean, _) = mean_std(&actual[..n]);
    let ss_tot = actual[..n].iter().map(|a| (a - mean) * (a - mean)).sum::<f64>();
    let ss_res = actual
        .iter()
        .zip(predicted.iter())
        .map(|(a, p)| (a - p) * (a - p))
        .sum::<f64>();
    if ss_tot <= f64::EPSILON {
        return if ss_res <= f64::EPSILON { 1.0 } else { 0.0 };
    }
    (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
}

/// Standard deviation over mean; `None` for fewer than two values or a zero mean.
pub fn coefficient_of_variation(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let (mean, std) = mean_std(values);
    if mean.abs() <= f64::EPSILON {
        return if std <= f64::EPSILON { Some(0.0) } else { None };
    }
    Some(std / mean.abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_error_skips_zero_actuals() {
        let mape = percentage_error(&[0.0, 100.0, 50.0], &[5.0, 110.0, 45.0]);
        assert!((mape - 10.0).abs() < 1e-12);
        assert_eq!(percentage_error(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn error_metrics_match_hand_computation() {
        let actual = [2.0, 4.0, 6.0];
        let predicted = [3.0, 4.0, 4.0];
        assert!((mae(&actual, &predicted) - 1.0).abs() < 1e-12);
        assert!((rmse(&actual, &predicted) - (5.0_f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!((r_squared(&actual, &predicted) - (1.0 - 5.0 / 8.0)).abs() < 1e-12);
    }

    #[test]
    fn r_squared_is_clamped_into_unit_interval() {
        assert_eq!(r_squared(&[1.0, 2.0, 3.0], &[30.0, -20.0, 10.0]), 0.0);
        assert_eq!(r_squared(&[5.0, 5.0], &[5.0, 5.0]), 1.0);
    }

    #[test]
    fn accuracy_tiers_follow_thresholds() {
        assert_eq!(AccuracyTier::from_mape(4.9), AccuracyTier::Excellent);
        assert_eq!(AccuracyTier::from_mape(5.0), AccuracyTier::VeryGood);
        assert_eq!(AccuracyTier::from_mape(19.99), AccuracyTier::Good);
        assert_eq!(AccuracyTier::from_mape(29.0), AccuracyTier::Fair);
        assert_eq!(AccuracyTier::from_mape(30.0), AccuracyTier::Poor);
        assert_eq!(AccuracyTier::VeryGood.as_str(), "very good");
    }

    #[test]
    fn metrics_validity_rejects_nan() {
        let mut metrics = TrainingMetrics::from_holdout(&[1.0], &[1.0], 4, Vec::new());
        assert!(metrics.has_valid_error_metric());
        metrics.mape = f64::NAN;
        assert!(!metrics.has_valid_error_metric());
    }

    #[test]
    fn coefficient_of_variation_needs_two_values() {
        assert_eq!(coefficient_of_variation(&[3.0]), None);
        let cv = coefficient_of_variation(&[10.0, 10.0, 10.0]).unwrap();
        assert_eq!(cv, 0.0);
        let cv = coefficient_of_variation(&[5.0, 15.0]).unwrap();
        assert!((cv - 0.5).abs() < 1e-12);
    }
}
