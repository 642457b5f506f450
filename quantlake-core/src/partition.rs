//! Partition key model.
//!
//! Every dataset is addressed by an ordered list of dimension names, e.g.
//! `[ticker, event_type]` for corporate actions or `[year, month, date]` for
//! daily flat files. Keys serialize to Hive-style relative paths:
//!
//! ```text
//! ticker=AAPL/event_type=dividend
//! year=2024/month=03/date=2024-03-01
//! ```
//!
//! Keys are only built through a [`PartitionScheme`], so every key of a dataset
//! carries the same dimension names in the same order, and `parse(to_path(k)) == k`.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Errors from building or parsing partition keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("dataset '{dataset}' expects {expected} dimension values, got {actual}")]
    Arity {
        dataset: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid value for dimension '{dimension}': {value:?}")]
    InvalidValue { dimension: String, value: String },

    #[error("path segment '{segment}' is not of the form name=value")]
    MalformedSegment { segment: String },

    #[error("expected dimension '{expected}' but found '{found}'")]
    DimensionMismatch { expected: String, found: String },
}

/// Check that a dimension value can be embedded in a path segment.
pub fn validate_segment_value(dimension: &str, value: &str) -> Result<(), PartitionError> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '='])
        || value.chars().any(char::is_control);
    if bad {
        return Err(PartitionError::InvalidValue {
            dimension: dimension.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}

/// The ordered dimension names of one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionScheme {
    dataset: String,
    dimensions: Vec<String>,
}

impl PartitionScheme {
    pub fn new<S: AsRef<str>>(dataset: impl Into<String>, dimensions: &[S]) -> Self {
        Self {
            dataset: dataset.into(),
            dimensions: dimensions.iter().map(|d| d.as_ref().to_string()).collect(),
        }
    }

    /// `year / month / date` scheme used by daily flat-file datasets.
    pub fn daily(dataset: impl Into<String>) -> Self {
        Self::new(dataset, &["year", "month", "date"])
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }

    /// Build a key from values given in dimension order.
    pub fn key<S: AsRef<str>>(&self, values: &[S]) -> Result<PartitionKey, PartitionError> {
        if values.len() != self.dimensions.len() {
            return Err(PartitionError::Arity {
                dataset: self.dataset.clone(),
                expected: self.dimensions.len(),
                actual: values.len(),
            });
        }

        let mut dims = Vec::with_capacity(values.len());
        for (name, value) in self.dimensions.iter().zip(values) {
            let value = value.as_ref();
            validate_segment_value(name, value)?;
            dims.push((name.clone(), value.to_string()));
        }

        Ok(PartitionKey {
            dataset: self.dataset.clone(),
            dims,
        })
    }

    /// Key for a daily scheme (`year=YYYY/month=MM/date=YYYY-MM-DD`).
    pub fn date_key(&self, date: NaiveDate) -> Result<PartitionKey, PartitionError> {
        self.key(&[
            format!("{:04}", date.year()),
            format!("{:02}", date.month()),
            date.format("%Y-%m-%d").to_string(),
        ])
    }

    /// Parse a relative path (`a=1/b=2`) back into a key of this scheme.
    ///
    /// A trailing file name such as `data.parquet` is ignored.
    pub fn parse(&self, relative: &Path) -> Result<PartitionKey, PartitionError> {
        let segments: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .filter(|s| s.contains('='))
            .collect();

        if segments.len() != self.dimensions.len() {
            return Err(PartitionError::Arity {
                dataset: self.dataset.clone(),
                expected: self.dimensions.len(),
                actual: segments.len(),
            });
        }

        let mut values = Vec::with_capacity(segments.len());
        for (expected, segment) in self.dimensions.iter().zip(&segments) {
            let (name, value) =
                segment
                    .split_once('=')
                    .ok_or_else(|| PartitionError::MalformedSegment {
                        segment: segment.clone(),
                    })?;
            if name != expected {
                return Err(PartitionError::DimensionMismatch {
                    expected: expected.clone(),
                    found: name.to_string(),
                });
            }
            values.push(value.to_string());
        }

        self.key(&values)
    }
}

/// A concrete partition: dataset plus ordered `(dimension, value)` pairs.
///
/// Ordering is by dataset, then by values in dimension order, so keys whose
/// values are zero-padded numbers or ISO dates sort chronologically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    dataset: String,
    dims: Vec<(String, String)>,
}

impl PartitionKey {
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn dims(&self) -> &[(String, String)] {
        &self.dims
    }

    /// Value of a single dimension.
    pub fn get(&self, dimension: &str) -> Option<&str> {
        self.dims
            .iter()
            .find(|(name, _)| name == dimension)
            .map(|(_, value)| value.as_str())
    }

    /// Relative directory for this partition: `name=value/name=value`.
    pub fn to_path(&self) -> PathBuf {
        self.dims
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self
            .dims
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        write!(f, "{}", joined.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_serializes_to_hive_path() {
        let scheme = PartitionScheme::new("corporate_actions", &["ticker", "event_type"]);
        let key = scheme.key(&["AAPL", "dividend"]).unwrap();

        assert_eq!(key.to_string(), "ticker=AAPL/event_type=dividend");
        assert_eq!(
            key.to_path(),
            PathBuf::from("ticker=AAPL").join("event_type=dividend")
        );
        assert_eq!(key.get("event_type"), Some("dividend"));
        assert_eq!(key.get("missing"), None);
    }

    #[test]
    fn parse_inverts_to_path() {
        let scheme = PartitionScheme::daily("stocks_daily");
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let key = scheme.date_key(date).unwrap();

        assert_eq!(key.to_string(), "year=2024/month=03/date=2024-03-01");
        assert_eq!(scheme.parse(&key.to_path()).unwrap(), key);

        let with_file = key.to_path().join("data.parquet");
        assert_eq!(scheme.parse(&with_file).unwrap(), key);
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let scheme = PartitionScheme::new("ds", &["ticker", "event_type"]);
        let err = scheme.key(&["AAPL"]).unwrap_err();
        assert!(matches!(err, PartitionError::Arity { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn unsafe_values_are_rejected() {
        let scheme = PartitionScheme::new("ds", &["ticker"]);
        for bad in ["", "..", "A/B", "A=B"] {
            assert!(scheme.key(&[bad]).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn parse_rejects_dimension_out_of_order() {
        let scheme = PartitionScheme::new("ds", &["ticker", "event_type"]);
        let err = scheme
            .parse(Path::new("event_type=split/ticker=AAPL"))
            .unwrap_err();
        assert!(matches!(err, PartitionError::DimensionMismatch { .. }));
    }

    #[test]
    fn keys_order_chronologically() {
        let scheme = PartitionScheme::daily("stocks_daily");
        let a = scheme
            .date_key(NaiveDate::from_ymd_opt(2024, 2, 28).unwrap())
            .unwrap();
        let b = scheme
            .date_key(NaiveDate::from_ymd_opt(2024, 10, 1).unwrap())
            .unwrap();
        assert!(a < b);
    }
}
