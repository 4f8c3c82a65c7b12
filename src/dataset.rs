//! Immutable tabular snapshots with resolved semantic roles.
//!
//! A `Dataset` is never mutated in place: every transformation hands back a
//! new snapshot, so a stage can keep reading the one it was given while a later
//! stage works on a derived copy.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];
const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Number(f64),
    Text(String),
    Temporal(NaiveDateTime),
    Missing,
}

impl Value {
    pub fn is_missing(&self) -> bool {
        match self {
            Value::Missing => true,
            Value::Text(text) => text.trim().is_empty(),
            Value::Number(v) => v.is_nan(),
            Value::Temporal(_) => false,
        }
    }

    /// Finite numeric reading of the cell. Text must be a plain number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) if v.is_finite() => Some(*v),
            Value::Text(text) => text.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Temporal(dt) => Some(*dt),
            Value::Text(text) => parse_datetime(text),
            _ => None,
        }
    }

    /// Infers the narrowest type for a raw text cell.
    pub fn from_raw(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Value::Missing;
        }
        if let Ok(v) = trimmed.parse::<f64>() {
            return Value::Number(v);
        }
        if let Some(dt) = parse_datetime(trimmed) {
            return Value::Temporal(dt);
        }
        Value::Text(trimmed.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticRoles {
    pub date: Option<String>,
    pub target: String,
    pub features: Vec<String>,
}

impl SemanticRoles {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            date: None,
            target: target.into(),
            features: Vec::new(),
        }
    }

    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset has no columns")]
    NoColumns,
    #[error("duplicate column name: {0}")]
    DuplicateColumn(String),
    #[error("row {row} has {found} values, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("column {name} has {found} values, dataset has {expected} rows")]
    ColumnLength {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    roles: SemanticRoles,
}

impl Dataset {
    pub fn new(
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        roles: SemanticRoles,
    ) -> Result<Self, DatasetError> {
        if columns.is_empty() {
            return Err(DatasetError::NoColumns);
        }
        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(DatasetError::DuplicateColumn(column.clone()));
            }
        }
        for (row, values) in rows.iter().enumerate() {
            if values.len() != columns.len() {
                return Err(DatasetError::RaggedRow {
                    row,
                    expected: columns.len(),
                    found: values.len(),
                });
            }
        }

        Ok(Self {
            columns,
            rows,
            roles,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn roles(&self) -> &SemanticRoles {
        &self.roles
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|values| &values[idx])
    }

    /// Column-name to value view of one record.
    pub fn record(&self, row: usize) -> Option<impl Iterator<Item = (&str, &Value)>> {
        let values = self.rows.get(row)?;
        Some(
            self.columns
                .iter()
                .map(String::as_str)
                .zip(values.iter()),
        )
    }

    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |values| &values[idx]))
    }

    pub fn numeric_values(&self, name: &str) -> Option<Vec<Option<f64>>> {
        Some(self.column(name)?.map(Value::as_f64).collect())
    }

    pub fn temporal_values(&self, name: &str) -> Option<Vec<Option<NaiveDateTime>>> {
        Some(self.column(name)?.map(Value::as_datetime).collect())
    }

    /// A column is numeric when most of its non-missing cells read as numbers.
    pub fn is_numeric_column(&self, name: &str) -> bool {
        let Some(values) = self.column(name) else {
            return false;
        };
        let mut present = 0usize;
        let mut numeric = 0usize;
        for value in values {
            if value.is_missing() {
                continue;
            }
            present += 1;
            if value.as_f64().is_some() {
                numeric += 1;
            }
        }
        present > 0 && numeric * 2 > present
    }

    pub fn numeric_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .map(String::as_str)
            .filter(|name| self.is_numeric_column(name))
            .collect()
    }

    pub fn missing_ratio(&self) -> f64 {
        let total = self.rows.len() * self.columns.len();
        if total == 0 {
            return 0.0;
        }
        let missing = self
            .rows
            .iter()
            .flat_map(|values| values.iter())
            .filter(|value| value.is_missing())
            .count();
        missing as f64 / total as f64
    }

    /// Share of non-missing date cells that parse as timestamps. `None` when no
    /// date role is resolved to an existing column.
    pub fn date_parse_rate(&self) -> Option<f64> {
        let date = self.roles.date.as_deref()?;
        let values = self.column(date)?;
        let mut present = 0usize;
        let mut parsed = 0usize;
        for value in values {
            if value.is_missing() {
                continue;
            }
            present += 1;
            if value.as_datetime().is_some() {
                parsed += 1;
            }
        }
        if present == 0 {
            Some(0.0)
        } else {
            Some(parsed as f64 / present as f64)
        }
    }

    /// Role names that do not resolve to a column.
    pub fn missing_roles(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.column_index(&self.roles.target).is_none() {
            missing.push(self.roles.target.clone());
        }
        if let Some(date) = &self.roles.date {
            if self.column_index(date).is_none() {
                missing.push(date.clone());
            }
        }
        for feature in &self.roles.features {
            if self.column_index(feature).is_none() {
                missing.push(feature.clone());
            }
        }
        missing
    }

    pub fn with_rows(&self, rows: Vec<Vec<Value>>) -> Result<Self, DatasetError> {
        Self::new(self.columns.clone(), rows, self.roles.clone())
    }

    pub fn with_roles(&self, roles: SemanticRoles) -> Self {
        Self {
            columns: self.columns.clone(),
            rows: self.rows.clone(),
            roles,
        }
    }

    /// Appends (or replaces) a column, optionally registering it as a feature.
    pub fn with_column(
        &self,
        name: &str,
        values: Vec<Value>,
        as_feature: bool,
    ) -> Result<Self, DatasetError> {
        if values.len() != self.rows.len() {
            return Err(DatasetError::ColumnLength {
                name: name.to_string(),
                expected: self.rows.len(),
                found: values.len(),
            });
        }

        let mut columns = self.columns.clone();
        let mut rows = self.rows.clone();
        match self.column_index(name) {
            Some(idx) => {
                for (row, value) in rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
            None => {
                columns.push(name.to_string());
                for (row, value) in rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }

        let mut roles = self.roles.clone();
        if as_feature && !roles.features.iter().any(|feature| feature == name) {
            roles.features.push(name.to_string());
        }

        Self::new(columns, rows, roles)
    }

    /// SHA-256 over columns, roles and every cell, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update("columns:");
        for column in &self.columns {
            hasher.update(column.as_bytes());
            hasher.update(",");
        }
        hasher.update(format!(
            ";roles:{}|{}|{};",
            self.roles.target,
            self.roles.date.as_deref().unwrap_or(""),
            self.roles.features.join(",")
        ));
        for values in &self.rows {
            for value in values {
                match value {
                    Value::Number(v) => hasher.update(format!("n{};", v.to_bits())),
                    Value::Text(text) => {
                        hasher.update("t");
                        hasher.update(text.as_bytes());
                        hasher.update(";");
                    }
                    Value::Temporal(dt) => {
                        hasher.update(format!("d{};", dt.and_utc().timestamp_millis()))
                    }
                    Value::Missing => hasher.update("m;"),
                }
            }
            hasher.update("\n");
        }
        hex::encode(hasher.finalize())
    }
}

pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.naive_utc());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Lenient number parsing for user-entered text: thousands separators,
/// currency symbols and a trailing percent sign are accepted.
pub fn parse_numeric_text(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let cleaned: String = trimmed
        .trim_end_matches('%')
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '€' | '£' | ' ' | '_'))
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn load_csv_dataset(path: &Path, roles: SemanticRoles) -> Result<Dataset, DatasetError> {
    let file = std::fs::File::open(path)?;
    dataset_from_csv_reader(file, roles)
}

pub fn dataset_from_csv_reader<R: Read>(
    reader: R,
    roles: SemanticRoles,
) -> Result<Dataset, DatasetError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(reader);

    let columns: Vec<String> = csv_reader
        .headers()?
        .iter()
        .map(|header| header.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        rows.push(record.iter().map(Value::from_raw).collect());
    }

    Dataset::new(columns, rows, roles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dataset {
        Dataset::new(
            vec!["date".to_string(), "sales".to_string(), "note".to_string()],
            vec![
                vec![
                    Value::Text("2024-01-01".to_string()),
                    Value::Number(10.0),
                    Value::Text("a".to_string()),
                ],
                vec![
                    Value::Text("not a date".to_string()),
                    Value::Missing,
                    Value::Text("b".to_string()),
                ],
                vec![
                    Value::Text("2024-01-03".to_string()),
                    Value::Text("12.5".to_string()),
                    Value::Missing,
                ],
            ],
            SemanticRoles::new("sales").with_date("date"),
        )
        .unwrap()
    }

    #[test]
    fn ragged_rows_and_duplicate_columns_are_rejected() {
        let err = Dataset::new(
            vec!["a".to_string(), "b".to_string()],
            vec![vec![Value::Number(1.0)]],
            SemanticRoles::new("a"),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DatasetError::RaggedRow {
                row: 0,
                expected: 2,
                found: 1
            }
        ));

        let err = Dataset::new(
            vec!["a".to_string(), "a".to_string()],
            Vec::new(),
            SemanticRoles::new("a"),
        )
        .unwrap_err();
        assert!(matches!(err, DatasetError::DuplicateColumn(name) if name == "a"));
    }

    #[test]
    fn typed_views_and_ratios() {
        let ds = sample();
        assert_eq!(
            ds.numeric_values("sales").unwrap(),
            vec![Some(10.0), None, Some(12.5)]
        );
        assert!(ds.is_numeric_column("sales"));
        assert!(!ds.is_numeric_column("note"));
        assert_eq!(ds.numeric_columns(), vec!["sales"]);
        assert!((ds.missing_ratio() - 2.0 / 9.0).abs() < 1e-12);
        assert!((ds.date_parse_rate().unwrap() - 2.0 / 3.0).abs() < 1e-12);
        assert!(ds.missing_roles().is_empty());
    }

    #[test]
    fn record_view_maps_column_names() {
        let ds = sample();
        let record: Vec<(&str, &Value)> = ds.record(0).unwrap().collect();
        assert_eq!(record[1], ("sales", &Value::Number(10.0)));
        assert!(ds.record(9).is_none());
    }

    #[test]
    fn with_column_returns_new_snapshot() {
        let ds = sample();
        let before = ds.fingerprint();
        let derived = ds
            .with_column(
                "flag",
                vec![Value::Number(1.0), Value::Number(0.0), Value::Number(1.0)],
                true,
            )
            .unwrap();

        assert_eq!(ds.fingerprint(), before);
        assert_ne!(derived.fingerprint(), before);
        assert_eq!(derived.column_count(), 4);
        assert_eq!(derived.roles().features, vec!["flag".to_string()]);
        assert!(ds.with_column("flag", Vec::new(), false).is_err());
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(sample().fingerprint(), sample().fingerprint());
        assert_eq!(sample().fingerprint().len(), 64);
    }

    #[test]
    fn parses_common_date_and_number_shapes() {
        assert!(parse_datetime("2024-03-01").is_some());
        assert!(parse_datetime("2024-03-01 13:45:00").is_some());
        assert!(parse_datetime("2024-03-01T13:45:00Z").is_some());
        assert!(parse_datetime("03/01/2024").is_some());
        assert!(parse_datetime("yesterday").is_none());

        assert_eq!(parse_numeric_text("$1,234.50"), Some(1234.5));
        assert_eq!(parse_numeric_text("12%"), Some(12.0));
        assert_eq!(parse_numeric_text("n/a"), None);
    }

    #[test]
    fn csv_reader_infers_cell_types() {
        let csv = "date,sales,region\n2024-01-01,10,north\n2024-01-02,,south\n";
        let ds = dataset_from_csv_reader(
            csv.as_bytes(),
            SemanticRoles::new("sales").with_date("date"),
        )
        .unwrap();

        assert_eq!(ds.row_count(), 2);
        assert!(matches!(ds.value(0, "date"), Some(Value::Temporal(_))));
        assert_eq!(ds.value(0, "sales"), Some(&Value::Number(10.0)));
        assert_eq!(ds.value(1, "sales"), Some(&Value::Missing));
        assert_eq!(ds.value(1, "region"), Some(&Value::Text("south".to_string())));
    }
}
