//! Maps a data profile to a primary strategy and an ordered fallback chain.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::forecaster::StrategyId;
use crate::profiler::DataProfile;

pub const SMALL_DATASET_ROWS: usize = 10;
pub const TEMPORAL_MIN_ROWS: usize = 30;
pub const FEATURE_MODEL_MIN_ROWS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub primary: StrategyId,
    /// Candidates tried after the primary; always ends in the guaranteed tail.
    pub fallback_chain: Vec<StrategyId>,
    pub rationale: String,
    pub warnings: Vec<String>,
}

impl RoutingDecision {
    /// Primary followed by the chain, each strategy at most once.
    pub fn attempt_order(&self) -> Vec<StrategyId> {
        let mut order = vec![self.primary];
        for strategy in &self.fallback_chain {
            if !order.contains(strategy) {
                order.push(*strategy);
            }
        }
        order
    }
}

pub fn route(profile: &DataProfile) -> RoutingDecision {
    use StrategyId::*;

    let rows = profile.row_count;
    let mut warnings = Vec::new();

    let (primary, fallback, rationale) = if rows < SMALL_DATASET_ROWS {
        warnings.push(format!(
            "very small dataset ({rows} rows); forecasts come from a simple baseline"
        ));
        (
            MovingAverage,
            vec![LastValue],
            format!("only {rows} rows: too few to fit a structured model"),
        )
    } else if !profile.has_usable_date && rows < TEMPORAL_MIN_ROWS {
        warnings.push("no date column detected; treating rows as an ordered sequence".to_string());
        (
            LastValue,
            vec![MovingAverage],
            format!("{rows} rows without a usable date column"),
        )
    } else if profile.has_usable_date && rows >= TEMPORAL_MIN_ROWS {
        if profile.is_feature_rich && rows >= FEATURE_MODEL_MIN_ROWS {
            (
                Ensemble,
                vec![FeatureBoosting, SeasonalDecomposition, LastValue],
                format!(
                    "{rows} dated rows with {} numeric features: combining several models",
                    profile.feature_column_count
                ),
            )
        } else {
            (
                SeasonalDecomposition,
                vec![FeatureBoosting, LastValue, MovingAverage],
                format!("{rows} dated rows: decomposing trend and seasonality"),
            )
        }
    } else if profile.is_feature_rich && rows >= FEATURE_MODEL_MIN_ROWS {
        (
            FeatureBoosting,
            vec![LastValue, MovingAverage],
            format!(
                "{rows} rows with {} numeric features but no usable dates",
                profile.feature_column_count
            ),
        )
    } else {
        (
            LastValue,
            vec![MovingAverage],
            format!("{rows} rows with no strong structure to exploit"),
        )
    };

    if profile.has_negative_target {
        warnings.push("target contains negative values; forecasts are floored at zero".to_string());
    }
    if profile.has_date_column && !profile.has_usable_date {
        warnings.push(format!(
            "date column parses for only {:.0}% of rows and was ignored",
            profile.date_parse_rate * 100.0
        ));
    }

    let decision = RoutingDecision {
        primary,
        fallback_chain: with_guaranteed_tail(fallback),
        rationale,
        warnings,
    };

    info!(
        component = "router",
        event = "router.decision",
        row_count = rows,
        primary = %decision.primary,
        fallback_chain = ?decision.fallback_chain,
        warning_count = decision.warnings.len(),
        rationale = %decision.rationale
    );

    decision
}

fn with_guaranteed_tail(chain: Vec<StrategyId>) -> Vec<StrategyId> {
    let mut out: Vec<StrategyId> = Vec::with_capacity(chain.len() + 2);
    for strategy in chain {
        if !strategy.is_guaranteed() && !out.contains(&strategy) {
            out.push(strategy);
        }
    }
    out.extend(StrategyId::GUARANTEED_TAIL);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::ComplexityTier;
    use StrategyId::*;

    fn profile(rows: usize, usable_date: bool, feature_rich: bool) -> DataProfile {
        DataProfile {
            row_count: rows,
            column_count: if feature_rich { 6 } else { 2 },
            numeric_column_count: if feature_rich { 4 } else { 1 },
            feature_column_count: if feature_rich { 3 } else { 0 },
            has_date_column: usable_date,
            date_parse_rate: if usable_date { 1.0 } else { 0.0 },
            has_usable_date: usable_date,
            is_feature_rich: feature_rich,
            seasonal_lag: 7,
            seasonal_autocorrelation: 0.0,
            has_seasonality: false,
            trend_correlation: 0.0,
            has_trend: false,
            target_valid_count: rows,
            target_cv: 0.2,
            has_negative_target: false,
            missing_ratio: 0.0,
            complexity: ComplexityTier::Simple,
        }
    }

    #[test]
    fn tiny_datasets_always_route_to_moving_average() {
        for rows in 0..SMALL_DATASET_ROWS {
            for usable_date in [false, true] {
                for feature_rich in [false, true] {
                    let decision = route(&profile(rows, usable_date, feature_rich));
                    assert_eq!(decision.primary, MovingAverage);
                    assert!(decision.warnings[0].contains("very small dataset"));
                }
            }
        }
    }

    #[test]
    fn every_chain_ends_with_guaranteed_tail() {
        for rows in [0, 5, 9, 10, 29, 30, 49, 50, 200] {
            for usable_date in [false, true] {
                for feature_rich in [false, true] {
                    let decision = route(&profile(rows, usable_date, feature_rich));
                    let chain = &decision.fallback_chain;
                    assert!(chain.len() >= 2);
                    assert_eq!(&chain[chain.len() - 2..], &[LastValue, MovingAverage]);
                    let order = decision.attempt_order();
                    assert_eq!(order[0], decision.primary);
                    let mut deduped = order.clone();
                    deduped.dedup();
                    assert_eq!(deduped.len(), order.len());
                }
            }
        }
    }

    #[test]
    fn dated_series_without_features_routes_to_seasonal() {
        let decision = route(&profile(40, true, false));
        assert_eq!(decision.primary, SeasonalDecomposition);
        assert_eq!(
            decision.fallback_chain,
            vec![FeatureBoosting, LastValue, MovingAverage]
        );
        assert!(decision.warnings.is_empty());
    }

    #[test]
    fn dated_feature_rich_series_routes_to_ensemble() {
        let decision = route(&profile(200, true, true));
        assert_eq!(decision.primary, Ensemble);
        assert_eq!(
            decision.fallback_chain,
            vec![FeatureBoosting, SeasonalDecomposition, LastValue, MovingAverage]
        );

        let decision = route(&profile(40, true, true));
        assert_eq!(decision.primary, SeasonalDecomposition);
    }

    #[test]
    fn undated_rules_follow_priority_order() {
        let decision = route(&profile(20, false, true));
        assert_eq!(decision.primary, LastValue);
        assert!(decision.warnings[0].contains("no date column detected"));

        let decision = route(&profile(80, false, true));
        assert_eq!(decision.primary, FeatureBoosting);
        assert_eq!(decision.fallback_chain, vec![LastValue, MovingAverage]);

        let decision = route(&profile(80, false, false));
        assert_eq!(decision.primary, LastValue);
        assert_eq!(decision.attempt_order(), vec![LastValue, MovingAverage]);
    }

    #[test]
    fn negative_targets_add_a_warning() {
        let mut p = profile(40, true, false);
        p.has_negative_target = true;
        let decision = route(&p);
        assert!(decision.warnings.iter().any(|w| w.contains("negative")));
    }
}
