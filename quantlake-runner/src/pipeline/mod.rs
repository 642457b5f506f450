//! Bronze → silver pipelines.
//!
//! Each pipeline reads every bronze file of its datasets, rebuilds the
//! silver table and records one silver ledger entry per written partition.

pub mod corporate_actions;
pub mod fundamentals;
pub mod schema;

pub use corporate_actions::{CorporateActionsPipeline, CorporateActionsReport};
pub use fundamentals::{FundamentalsPipeline, FundamentalsReport};
pub use schema::{discover_schema, load_statement_records, save_schema};

use chrono::NaiveDate;
use polars::prelude::PolarsError;
use quantlake_core::bronze::{dataframe_to_records, BronzeError};
use quantlake_core::fundamentals::{DeriveError, FlattenError, MergeError};
use quantlake_core::metadata::{
    Layer, LedgerEntry, MetadataError, RunLedger, RunStatus, UnitStatistics,
};
use quantlake_core::storage::{find_parquet_files, read_parquet, StorageError, WrittenPartition};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Bronze(#[from] BronzeError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Flatten(#[from] FlattenError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Derive(#[from] DeriveError),

    #[error("failed to build table: {0}")]
    Polars(#[from] PolarsError),

    #[error("schema file {path}: {source}")]
    SchemaFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no bronze data under {0}")]
    NoInput(PathBuf),
}

/// Upper-cased ticker allow-list. `None` admits every ticker.
pub type TickerFilter = Option<BTreeSet<String>>;

pub fn ticker_filter<S: AsRef<str>>(tickers: &[S]) -> TickerFilter {
    if tickers.is_empty() {
        return None;
    }
    Some(
        tickers
            .iter()
            .map(|t| t.as_ref().trim().to_ascii_uppercase())
            .collect(),
    )
}

pub(crate) fn admits(filter: &TickerFilter, ticker: Option<&str>) -> bool {
    match (filter, ticker) {
        (None, _) => true,
        (Some(set), Some(t)) => set.contains(&t.to_ascii_uppercase()),
        (Some(_), None) => false,
    }
}

/// Rows of one bronze Parquet file.
#[derive(Debug)]
pub struct BronzeFile {
    pub path: PathBuf,
    /// Value of a `ticker=` path segment, if the file sits under one.
    pub ticker: Option<String>,
    pub rows: Vec<Map<String, Value>>,
}

fn ticker_segment(relative: &Path) -> Option<String> {
    relative.components().find_map(|c| match c {
        Component::Normal(s) => s.to_str()?.strip_prefix("ticker=").map(str::to_string),
        _ => None,
    })
}

/// Read every file under `{bronze_root}/{dataset}`. Files in a `ticker=`
/// partition outside the filter are not opened.
pub fn read_bronze(
    bronze_root: &Path,
    dataset: &str,
    tickers: &TickerFilter,
) -> Result<Vec<BronzeFile>, PipelineError> {
    let dir = bronze_root.join(dataset);
    let mut files = Vec::new();
    for path in find_parquet_files(&dir)? {
        let relative = path.strip_prefix(&dir).unwrap_or(&path);
        let ticker = ticker_segment(relative);
        if ticker.is_some() && !admits(tickers, ticker.as_deref()) {
            continue;
        }
        let frame = read_parquet(&path)?;
        let rows = dataframe_to_records(&frame)?;
        tracing::debug!(path = %path.display(), rows = rows.len(), "read bronze file");
        files.push(BronzeFile { path, ticker, rows });
    }
    Ok(files)
}

/// One `success` entry per written silver partition.
pub(crate) fn record_partitions(
    ledger: &dyn RunLedger,
    written: &[WrittenPartition],
    date: NaiveDate,
) -> Result<(), MetadataError> {
    for partition in written {
        let entry = LedgerEntry::new(&partition.key, date, None, Layer::Silver, RunStatus::Success)
            .with_statistics(UnitStatistics {
                records: partition.file.rows as u64,
                bytes: partition.file.bytes,
                content_hash: Some(partition.file.content_hash.clone()),
                ..UnitStatistics::default()
            });
        ledger.record(&entry)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_segment_is_found_anywhere_in_path() {
        assert_eq!(
            ticker_segment(Path::new("ticker=AAPL/year=2024/data.parquet")),
            Some("AAPL".to_string())
        );
        assert_eq!(ticker_segment(Path::new("year=2024/month=01/data.parquet")), None);
    }

    #[test]
    fn filter_is_case_insensitive() {
        let filter = ticker_filter(&["aapl", " msft "]);
        assert!(admits(&filter, Some("AAPL")));
        assert!(admits(&filter, Some("msft")));
        assert!(!admits(&filter, Some("GOOG")));
        assert!(!admits(&filter, None));
        assert!(admits(&ticker_filter::<&str>(&[]), None));
    }

    #[test]
    fn missing_dataset_reads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let files = read_bronze(dir.path(), "nothing", &None).unwrap();
        assert!(files.is_empty());
    }
}
