//! Dataset characterization used to pick a routing decision.
//!
//! `profile` is a pure function of the snapshot: it never fails, and missing
//! signals fall back to `false` or zero.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;

pub const FEATURE_RICH_MIN_COLUMNS: usize = 3;
pub const SEASONALITY_THRESHOLD: f64 = 0.3;
pub const TREND_THRESHOLD: f64 = 0.7;
pub const USABLE_DATE_PARSE_RATE: f64 = 0.5;

const DAILY_SEASONAL_LAG: usize = 7;
const HOURLY_SEASONAL_LAG: usize = 24 * 7;
const HOUR_SECONDS: i64 = 3_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataProfile {
    pub row_count: usize,
    pub column_count: usize,
    pub numeric_column_count: usize,
    pub feature_column_count: usize,
    pub has_date_column: bool,
    pub date_parse_rate: f64,
    pub has_usable_date: bool,
    pub is_feature_rich: bool,
    pub seasonal_lag: usize,
    pub seasonal_autocorrelation: f64,
    pub has_seasonality: bool,
    pub trend_correlation: f64,
    pub has_trend: bool,
    pub target_valid_count: usize,
    pub target_cv: f64,
    pub has_negative_target: bool,
    pub missing_ratio: f64,
    pub complexity: ComplexityTier,
}

pub fn profile(dataset: &Dataset) -> DataProfile {
    let roles = dataset.roles();
    let row_count = dataset.row_count();
    let numeric_columns = dataset.numeric_columns();
    let feature_column_count = numeric_columns
        .iter()
        .filter(|name| **name != roles.target.as_str() && roles.date.as_deref() != Some(**name))
        .count();

    let has_date_column = roles
        .date
        .as_deref()
        .map(|date| dataset.column_index(date).is_some())
        .unwrap_or(false);
    let date_parse_rate = dataset.date_parse_rate().unwrap_or(0.0);
    let has_usable_date = has_date_column && date_parse_rate >= USABLE_DATE_PARSE_RATE;

    let dates = if has_usable_date {
        roles
            .date
            .as_deref()
            .and_then(|date| dataset.temporal_values(date))
    } else {
        None
    };
    let target = ordered_target(dataset, dates.as_deref());
    let seasonal_lag = dates
        .as_deref()
        .map(infer_seasonal_lag)
        .unwrap_or(DAILY_SEASONAL_LAG);

    let seasonal_autocorrelation = autocorr_at_lag(&target, seasonal_lag);
    let trend_correlation = index_correlation(&target);
    let (mean, std) = mean_std(&target);
    let target_cv = if mean.abs() > f64::EPSILON {
        std / mean.abs()
    } else {
        0.0
    };

    let is_feature_rich = feature_column_count >= FEATURE_RICH_MIN_COLUMNS;
    let has_seasonality = seasonal_autocorrelation.abs() > SEASONALITY_THRESHOLD;
    let has_trend = trend_correlation.abs() > TREND_THRESHOLD;

    DataProfile {
        row_count,
        column_count: dataset.column_count(),
        numeric_column_count: numeric_columns.len(),
        feature_column_count,
        has_date_column,
        date_parse_rate,
        has_usable_date,
        is_feature_rich,
        seasonal_lag,
        seasonal_autocorrelation,
        has_seasonality,
        trend_correlation,
        has_trend,
        target_valid_count: target.len(),
        target_cv,
        has_negative_target: target.iter().any(|v| *v < 0.0),
        missing_ratio: dataset.missing_ratio(),
        complexity: complexity_tier(
            row_count,
            has_usable_date,
            is_feature_rich,
            has_seasonality && has_trend,
        ),
    }
}

fn complexity_tier(
    row_count: usize,
    has_usable_date: bool,
    is_feature_rich: bool,
    seasonal_and_trending: bool,
) -> ComplexityTier {
    if row_count >= 100 && (is_feature_rich || seasonal_and_trending) {
        ComplexityTier::Complex
    } else if row_count >= 30 && (has_usable_date || is_feature_rich) {
        ComplexityTier::Moderate
    } else {
        ComplexityTier::Simple
    }
}

/// Valid target values, in date order when dates are usable.
fn ordered_target(dataset: &Dataset, dates: Option<&[Option<NaiveDateTime>]>) -> Vec<f64> {
    let Some(values) = dataset.numeric_values(&dataset.roles().target) else {
        return Vec::new();
    };

    match dates {
        Some(dates) => {
            let mut pairs: Vec<(NaiveDateTime, f64)> = dates
                .iter()
                .zip(values.iter())
                .filter_map(|(date, value)| Some(((*date)?, (*value)?)))
                .collect();
            pairs.sort_by_key(|(date, _)| *date);
            pairs.into_iter().map(|(_, value)| value).collect()
        }
        None => values.into_iter().flatten().collect(),
    }
}

fn infer_seasonal_lag(dates: &[Option<NaiveDateTime>]) -> usize {
    let mut parsed: Vec<NaiveDateTime> = dates.iter().flatten().copied().collect();
    parsed.sort();
    let mut gaps: Vec<i64> = parsed
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_seconds())
        .filter(|gap| *gap > 0)
        .collect();
    if gaps.is_empty() {
        return DAILY_SEASONAL_LAG;
    }
    gaps.sort_unstable();
    let median = gaps[gaps.len() / 2];
    if median <= HOUR_SECONDS {
        HOURLY_SEASONAL_LAG
    } else {
        DAILY_SEASONAL_LAG
    }
}

pub(crate) fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|v| {
            let d = *v - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean, variance.sqrt())
}

pub(crate) fn autocorr_at_lag(series: &[f64], lag: usize) -> f64 {
    if lag == 0 || series.len() <= lag {
        return 0.0;
    }
    let pairs: Vec<(f64, f64)> = (lag..series.len())
        .map(|t| (series[t], series[t - lag]))
        .collect();
    if pairs.len() < 3 {
        return 0.0;
    }
    pearson(&pairs)
}

fn index_correlation(series: &[f64]) -> f64 {
    if series.len() < 3 {
        return 0.0;
    }
    let pairs: Vec<(f64, f64)> = series
        .iter()
        .enumerate()
        .map(|(idx, value)| (idx as f64, *value))
        .collect();
    pearson(&pairs)
}

fn pearson(pairs: &[(f64, f64)]) -> f64 {
    let m = pairs.len() as f64;
    let mean_a = pairs.iter().map(|(a, _)| *a).sum::<f64>() / m;
    let mean_b = pairs.iter().map(|(_, b)| *b).sum::<f64>() / m;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (a, b) in pairs {
        let da = *a - mean_a;
        let db = *b - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = (var_a * var_b).sqrt();
    if denom <= f64::EPSILON {
        0.0
    } else {
        (cov / denom).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{SemanticRoles, Value};
    use chrono::{Duration, NaiveDate};

    fn daily_dataset(values: &[f64], feature_count: usize) -> Dataset {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let mut columns = vec!["date".to_string(), "target".to_string()];
        let features: Vec<String> = (0..feature_count).map(|i| format!("f{i}")).collect();
        columns.extend(features.iter().cloned());
        let rows = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut row = vec![
                    Value::Temporal(start + Duration::days(i as i64)),
                    Value::Number(*v),
                ];
                for f in 0..feature_count {
                    row.push(Value::Number((i * (f + 1)) as f64));
                }
                row
            })
            .collect();
        Dataset::new(
            columns,
            rows,
            SemanticRoles::new("target")
                .with_date("date")
                .with_features(features),
        )
        .unwrap()
    }

    #[test]
    fn weekly_pattern_sets_seasonality_without_trend() {
        let values: Vec<f64> = (0..70)
            .map(|i| if i % 7 == 0 { 50.0 } else { 10.0 })
            .collect();
        let p = profile(&daily_dataset(&values, 0));

        assert_eq!(p.seasonal_lag, 7);
        assert!(p.has_seasonality);
        assert!(!p.has_trend);
        assert!(p.has_usable_date);
        assert!(!p.is_feature_rich);
        assert_eq!(p.complexity, ComplexityTier::Moderate);
    }

    #[test]
    fn linear_growth_sets_trend() {
        let values: Vec<f64> = (0..40).map(|i| 100.0 + 2.0 * i as f64).collect();
        let p = profile(&daily_dataset(&values, 0));
        assert!(p.has_trend);
        assert!(p.trend_correlation > 0.99);
        assert!(p.target_cv > 0.0);
        assert!(!p.has_negative_target);
    }

    #[test]
    fn feature_richness_counts_numeric_columns_besides_target() {
        let values: Vec<f64> = (0..120).map(|i| 20.0 + (i % 5) as f64).collect();
        let p = profile(&daily_dataset(&values, 3));
        assert_eq!(p.feature_column_count, 3);
        assert_eq!(p.numeric_column_count, 4);
        assert!(p.is_feature_rich);
        assert_eq!(p.complexity, ComplexityTier::Complex);
    }

    #[test]
    fn numeric_date_column_is_not_a_feature() {
        let rows = (0..12)
            .map(|i| {
                vec![
                    Value::Number(20_240_101.0 + i as f64),
                    Value::Number(10.0 + i as f64),
                    Value::Number((i % 3) as f64),
                ]
            })
            .collect();
        let ds = Dataset::new(
            vec!["day".to_string(), "target".to_string(), "promo".to_string()],
            rows,
            SemanticRoles::new("target")
                .with_date("day")
                .with_features(["promo"]),
        )
        .unwrap();
        let p = profile(&ds);

        assert_eq!(p.numeric_column_count, 3);
        assert_eq!(p.feature_column_count, 1);
        assert!(!p.is_feature_rich);
    }

    #[test]
    fn missing_signals_default_to_false() {
        let ds = Dataset::new(
            vec!["target".to_string()],
            vec![vec![Value::Missing], vec![Value::Text("x".to_string())]],
            SemanticRoles::new("target"),
        )
        .unwrap();
        let p = profile(&ds);

        assert_eq!(p.target_valid_count, 0);
        assert!(!p.has_date_column);
        assert!(!p.has_seasonality);
        assert!(!p.has_trend);
        assert_eq!(p.target_cv, 0.0);
        assert_eq!(p.complexity, ComplexityTier::Simple);
    }

    #[test]
    fn negative_targets_are_flagged() {
        let p = profile(&daily_dataset(&[3.0, -1.0, 2.0], 0));
        assert!(p.has_negative_target);
    }

    #[test]
    fn profiling_twice_is_identical() {
        let values: Vec<f64> = (0..50).map(|i| (i as f64 * 0.7).sin() * 10.0 + 30.0).collect();
        let ds = daily_dataset(&values, 2);
        assert_eq!(profile(&ds), profile(&ds));
    }

    #[test]
    fn hourly_data_uses_weekly_hour_lag() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let dates: Vec<Option<NaiveDateTime>> = (0..10)
            .map(|i| Some(start + Duration::hours(i)))
            .collect();
        assert_eq!(infer_seasonal_lag(&dates), 168);
    }
}
