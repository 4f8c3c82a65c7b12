//! Dataset transformations behind the sanitization, preprocessing and feature
//! engineering stages. Each returns a new snapshot plus a small report.

use std::collections::HashSet;

use chrono::Datelike;
use serde::{Deserialize, Serialize};

use crate::dataset::{parse_datetime, parse_numeric_text, Dataset, DatasetError, Value};
use crate::profiler::USABLE_DATE_PARSE_RATE;

pub const CALENDAR_FEATURES: [&str; 3] = ["day_of_week", "month", "day_of_month"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizeReport {
    pub numeric_conversions: usize,
    pub parsed_dates: usize,
    pub empty_rows_dropped: usize,
    pub duplicate_rows_dropped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessReport {
    pub undated_rows_dropped: usize,
    pub sorted_by_date: bool,
    pub target_values_interpolated: usize,
    pub feature_values_filled: usize,
}

/// Date column name when it resolves and enough of it parses to order by.
pub fn usable_date_column(dataset: &Dataset) -> Option<&str> {
    let date = dataset.roles().date.as_deref()?;
    dataset.column_index(date)?;
    let rate = dataset.date_parse_rate()?;
    (rate >= USABLE_DATE_PARSE_RATE).then_some(date)
}

pub fn sanitize(dataset: &Dataset) -> Result<(Dataset, SanitizeReport), DatasetError> {
    let mut report = SanitizeReport::default();
    let date_idx = dataset
        .roles()
        .date
        .as_deref()
        .and_then(|date| dataset.column_index(date));

    let mut seen = HashSet::new();
    let mut rows = Vec::with_capacity(dataset.row_count());
    for values in dataset.rows() {
        let cleaned: Vec<Value> = values
            .iter()
            .enumerate()
            .map(|(idx, value)| clean_cell(value, Some(idx) == date_idx, &mut report))
            .collect();

        if cleaned.iter().all(Value::is_missing) {
            report.empty_rows_dropped += 1;
            continue;
        }
        if !seen.insert(format!("{cleaned:?}")) {
            report.duplicate_rows_dropped += 1;
            continue;
        }
        rows.push(cleaned);
    }

    Ok((dataset.with_rows(rows)?, report))
}

fn clean_cell(value: &Value, is_date: bool, report: &mut SanitizeReport) -> Value {
    let Value::Text(text) = value else {
        return value.clone();
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Missing;
    }
    if is_date {
        if let Some(dt) = parse_datetime(trimmed) {
            report.parsed_dates += 1;
            return Value::Temporal(dt);
        }
    } else if let Some(number) = parse_numeric_text(trimmed) {
        report.numeric_conversions += 1;
        return Value::Number(number);
    }
    Value::Text(trimmed.to_string())
}

pub fn preprocess(dataset: &Dataset) -> Result<(Dataset, PreprocessReport), DatasetError> {
    let mut report = PreprocessReport::default();
    let mut rows: Vec<Vec<Value>> = dataset.rows().to_vec();

    if let Some(date_idx) = usable_date_column(dataset).and_then(|d| dataset.column_index(d)) {
        let before = rows.len();
        rows.retain(|row| row[date_idx].as_datetime().is_some());
        report.undated_rows_dropped = before - rows.len();
        rows.sort_by_key(|row| row[date_idx].as_datetime());
        report.sorted_by_date = true;
    }

    if let Some(target_idx) = dataset.column_index(&dataset.roles().target) {
        report.target_values_interpolated = interpolate_column(&mut rows, target_idx);
    }

    for feature in &dataset.roles().features {
        if !dataset.is_numeric_column(feature) {
            continue;
        }
        if let Some(idx) = dataset.column_index(feature) {
            report.feature_values_filled += fill_column(&mut rows, idx);
        }
    }

    Ok((dataset.with_rows(rows)?, report))
}

/// Linear interpolation between valid neighbours; edge gaps take the nearest
/// valid value. Returns the number of cells filled.
fn interpolate_column(rows: &mut [Vec<Value>], idx: usize) -> usize {
    let values: Vec<Option<f64>> = rows.iter().map(|row| row[idx].as_f64()).collect();
    let valid: Vec<usize> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|_| i))
        .collect();
    if valid.is_empty() {
        return 0;
    }

    let mut filled = 0;
    for (i, value) in values.iter().enumerate() {
        if value.is_some() {
            continue;
        }
        let next_pos = valid.partition_point(|&v| v < i);
        let prev = next_pos.checked_sub(1).map(|p| valid[p]);
        let next = valid.get(next_pos).copied();
        let estimate = match (prev, next) {
            (Some(p), Some(n)) => {
                let (a, b) = (values[p].unwrap_or(0.0), values[n].unwrap_or(0.0));
                a + (b - a) * (i - p) as f64 / (n - p) as f64
            }
            (Some(p), None) => values[p].unwrap_or(0.0),
            (None, Some(n)) => values[n].unwrap_or(0.0),
            (None, None) => continue,
        };
        rows[i][idx] = Value::Number(estimate);
        filled += 1;
    }
    filled
}

/// Forward fill, then back fill the leading gap.
fn fill_column(rows: &mut [Vec<Value>], idx: usize) -> usize {
    let Some(first) = rows.iter().find_map(|row| row[idx].as_f64()) else {
        return 0;
    };
    let mut last = first;
    let mut filled = 0;
    for row in rows.iter_mut() {
        match row[idx].as_f64() {
            Some(v) => {
                last = v;
                row[idx] = Value::Number(v);
            }
            None => {
                row[idx] = Value::Number(last);
                filled += 1;
            }
        }
    }
    filled
}

/// Appends calendar features derived from the date column when it is usable.
pub fn engineer_features(dataset: &Dataset) -> Result<(Dataset, Vec<String>), DatasetError> {
    let Some(date) = usable_date_column(dataset) else {
        return Ok((dataset.clone(), Vec::new()));
    };
    let Some(dates) = dataset.temporal_values(date) else {
        return Ok((dataset.clone(), Vec::new()));
    };

    let calendar = |f: fn(&chrono::NaiveDateTime) -> f64| -> Vec<Value> {
        dates
            .iter()
            .map(|d| d.as_ref().map_or(Value::Missing, |d| Value::Number(f(d))))
            .collect()
    };

    let derived = dataset
        .with_column(
            CALENDAR_FEATURES[0],
            calendar(|d| d.weekday().num_days_from_monday() as f64),
            true,
        )?
        .with_column(CALENDAR_FEATURES[1], calendar(|d| d.month() as f64), true)?
        .with_column(CALENDAR_FEATURES[2], calendar(|d| d.day() as f64), true)?;

    Ok((
        derived,
        CALENDAR_FEATURES.iter().map(|name| name.to_string()).collect(),
    ))
}
