//! Partitioned table writer.
//!
//! Splits a table by its partition dimension values and publishes one
//! zstd-compressed `data.parquet` per distinct combination:
//!
//! ```text
//! {table_root}/ticker=AAPL/event_type=dividend/data.parquet
//! ```
//!
//! Rows inside a file are sorted by the layout's sort key with a stable sort,
//! and partitions are written in key order, so the same input and the same
//! `processed_at` produce byte-identical files.

use super::parquet::{read_parquet, write_parquet_atomic, ParquetOptions, WrittenFile};
use super::StorageError;
use crate::partition::{PartitionKey, PartitionScheme};
use chrono::NaiveDateTime;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Directory value used for null dimension values.
pub const DEFAULT_PARTITION_VALUE: &str = "__HIVE_DEFAULT_PARTITION__";

/// What happens to an existing partition file on re-run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WritePolicy {
    /// Replace the file with the new partition content.
    #[default]
    Overwrite,
    /// Merge with the existing file, keeping the newest row per key.
    AppendDedupe { keys: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortColumn {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

impl SortColumn {
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            descending: false,
        }
    }

    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            descending: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionLayout {
    pub dimensions: Vec<String>,
    /// Sort key, ties broken by input order.
    pub sort: Vec<SortColumn>,
    /// Date column from which `year`, `quarter` and `month` are derived.
    pub calendar_source: Option<String>,
    pub policy: WritePolicy,
    pub parquet: ParquetOptions,
    pub file_name: String,
}

impl Default for PartitionLayout {
    fn default() -> Self {
        Self {
            dimensions: Vec::new(),
            sort: Vec::new(),
            calendar_source: None,
            policy: WritePolicy::Overwrite,
            parquet: ParquetOptions::default(),
            file_name: "data.parquet".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenPartition {
    pub key: PartitionKey,
    pub file: WrittenFile,
}

/// Combine `part` with the file already at `path` according to `policy`.
pub fn apply_write_policy(
    policy: &WritePolicy,
    part: DataFrame,
    path: &Path,
) -> Result<DataFrame, StorageError> {
    let WritePolicy::AppendDedupe { keys } = policy else {
        return Ok(part);
    };
    for key in keys {
        if part.column(key).is_err() {
            return Err(StorageError::MissingColumn(key.clone()));
        }
    }
    if !path.exists() {
        return Ok(part);
    }

    let existing = read_parquet(path)?;
    let args = UnionArgs {
        to_supertypes: true,
        ..UnionArgs::default()
    };
    concat_lf_diagonal([existing.lazy(), part.lazy()], args)
        .map_err(|e| StorageError::polars("combine with existing partition", e))?
        .unique_stable(
            Some(keys.iter().map(|k| k.as_str().into()).collect()),
            UniqueKeepStrategy::Last,
        )
        .collect()
        .map_err(|e| StorageError::polars(format!("dedupe {}", path.display()), e))
}

pub struct PartitionWriter {
    root: PathBuf,
    scheme: PartitionScheme,
    layout: PartitionLayout,
    processed_at: Option<NaiveDateTime>,
}

impl PartitionWriter {
    /// `root` is the table directory, e.g. `silver/corporate_actions`.
    pub fn new(root: impl Into<PathBuf>, dataset: &str, layout: PartitionLayout) -> Self {
        Self {
            root: root.into(),
            scheme: PartitionScheme::new(dataset, &layout.dimensions),
            layout,
            processed_at: None,
        }
    }

    /// Pin the `processed_at` column instead of using the wall clock.
    pub fn with_processed_at(mut self, at: NaiveDateTime) -> Self {
        self.processed_at = Some(at);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scheme(&self) -> &PartitionScheme {
        &self.scheme
    }

    pub fn partition_path(&self, key: &PartitionKey) -> PathBuf {
        self.root.join(key.to_path()).join(&self.layout.file_name)
    }

    /// Write every partition present in `df`. Partitions not present in
    /// `df` are left untouched.
    pub fn write(&self, df: &DataFrame) -> Result<Vec<WrittenPartition>, StorageError> {
        if df.height() == 0 {
            return Ok(Vec::new());
        }
        let processed_at = self
            .processed_at
            .unwrap_or_else(|| chrono::Local::now().naive_local());

        let mut written = Vec::new();
        for (values, rows) in self.group_rows(df)? {
            let key = self.scheme.key(&values)?;
            let idx = IdxCa::from_vec("idx".into(), rows);
            let part = df
                .take(&idx)
                .map_err(|e| StorageError::polars(format!("select rows of {key}"), e))?;

            let path = self.partition_path(&key);
            let merged = apply_write_policy(&self.layout.policy, part, &path)?;
            let mut out = self.prepare(merged, processed_at)?;
            let file = write_parquet_atomic(&mut out, &path, &self.layout.parquet)?;
            tracing::debug!(partition = %key, rows = file.rows, "wrote partition");
            written.push(WrittenPartition { key, file });
        }

        tracing::info!(
            dataset = self.scheme.dataset(),
            partitions = written.len(),
            rows = df.height(),
            "partitioned write complete"
        );
        Ok(written)
    }

    /// Row indices per distinct dimension-value combination, in key order.
    fn group_rows(&self, df: &DataFrame) -> Result<BTreeMap<Vec<String>, Vec<IdxSize>>, StorageError> {
        let mut dims = Vec::with_capacity(self.layout.dimensions.len());
        for name in &self.layout.dimensions {
            let column = df
                .column(name)
                .map_err(|_| StorageError::MissingColumn(name.clone()))?
                .cast(&DataType::String)
                .map_err(|e| StorageError::polars(format!("cast '{name}' to string"), e))?;
            dims.push(column);
        }
        let dims = dims
            .iter()
            .map(|c| c.str())
            .collect::<PolarsResult<Vec<_>>>()
            .map_err(|e| StorageError::polars("dimension values", e))?;

        let mut groups: BTreeMap<Vec<String>, Vec<IdxSize>> = BTreeMap::new();
        for row in 0..df.height() {
            let values: Vec<String> = dims
                .iter()
                .map(|ca| ca.get(row).unwrap_or(DEFAULT_PARTITION_VALUE).to_string())
                .collect();
            groups.entry(values).or_default().push(row as IdxSize);
        }
        Ok(groups)
    }

    /// Calendar fields, `processed_at` and the sort order.
    fn prepare(&self, part: DataFrame, processed_at: NaiveDateTime) -> Result<DataFrame, StorageError> {
        for sort in &self.layout.sort {
            if part.column(&sort.column).is_err() {
                return Err(StorageError::MissingColumn(sort.column.clone()));
            }
        }

        let mut lf = part.clone().lazy();
        if let Some(source) = &self.layout.calendar_source {
            let dtype = part
                .column(source)
                .map_err(|_| StorageError::MissingColumn(source.clone()))?
                .dtype()
                .clone();
            let date = if dtype == DataType::String {
                col(source.as_str()).str().to_date(StrptimeOptions {
                    format: Some("%Y-%m-%d".into()),
                    strict: false,
                    ..StrptimeOptions::default()
                })
            } else {
                col(source.as_str()).cast(DataType::Date)
            };
            lf = lf.with_columns([
                date.clone().dt().year().cast(DataType::Int32).alias("year"),
                date.clone().dt().quarter().cast(DataType::Int32).alias("quarter"),
                date.dt().month().cast(DataType::Int32).alias("month"),
            ]);
        }
        lf = lf.with_column(lit(processed_at).alias("processed_at"));

        if !self.layout.sort.is_empty() {
            let by: Vec<PlSmallStr> = self
                .layout
                .sort
                .iter()
                .map(|s| s.column.as_str().into())
                .collect();
            let descending: Vec<bool> = self.layout.sort.iter().map(|s| s.descending).collect();
            lf = lf.sort(
                by,
                SortMultipleOptions::default()
                    .with_order_descending_multi(descending)
                    .with_nulls_last(true)
                    .with_maintain_order(true),
            );
        }

        lf.collect()
            .map_err(|e| StorageError::polars(format!("prepare partition of {}", self.scheme.dataset()), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn fixed_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn events() -> DataFrame {
        df!(
            "ticker" => ["AAPL", "MSFT", "AAPL", "AAPL"],
            "event_type" => ["dividend", "dividend", "split", "dividend"],
            "event_date" => ["2024-02-09", "2024-02-14", "2020-08-31", "2024-05-10"],
            "amount" => [Some(0.24), Some(0.75), None, Some(0.25)],
        )
        .unwrap()
    }

    fn layout() -> PartitionLayout {
        PartitionLayout {
            dimensions: vec!["ticker".into(), "event_type".into()],
            sort: vec![SortColumn::desc("event_date")],
            calendar_source: Some("event_date".into()),
            ..PartitionLayout::default()
        }
    }

    #[test]
    fn writes_one_file_per_combination() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(dir.path(), "corporate_actions", layout())
            .with_processed_at(fixed_time());
        let written = writer.write(&events()).unwrap();

        let keys: Vec<String> = written.iter().map(|w| w.key.to_string()).collect();
        assert_eq!(
            keys,
            vec![
                "ticker=AAPL/event_type=dividend",
                "ticker=AAPL/event_type=split",
                "ticker=MSFT/event_type=dividend",
            ]
        );

        let aapl = read_parquet(&dir.path().join("ticker=AAPL/event_type=dividend/data.parquet"))
            .unwrap();
        assert_eq!(aapl.height(), 2);
        let dates = aapl.column("event_date").unwrap().str().unwrap();
        assert_eq!(dates.get(0), Some("2024-05-10"));
        assert_eq!(dates.get(1), Some("2024-02-09"));

        let quarter = aapl.column("quarter").unwrap().i32().unwrap();
        assert_eq!(quarter.get(0), Some(2));
        assert_eq!(quarter.get(1), Some(1));
        assert!(aapl.column("processed_at").is_ok());
    }

    #[test]
    fn rewrite_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(dir.path(), "corporate_actions", layout())
            .with_processed_at(fixed_time());
        let first = writer.write(&events()).unwrap();
        let second = writer.write(&events()).unwrap();

        let hashes = |w: &[WrittenPartition]| -> Vec<String> {
            w.iter().map(|p| p.file.content_hash.clone()).collect()
        };
        assert_eq!(hashes(&first), hashes(&second));
    }

    #[test]
    fn overwrite_replaces_partition_content() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(dir.path(), "corporate_actions", layout())
            .with_processed_at(fixed_time());
        writer.write(&events()).unwrap();

        let update = df!(
            "ticker" => ["AAPL"],
            "event_type" => ["dividend"],
            "event_date" => ["2024-08-12"],
            "amount" => [Some(0.25)],
        )
        .unwrap();
        writer.write(&update).unwrap();

        let aapl = read_parquet(&dir.path().join("ticker=AAPL/event_type=dividend/data.parquet"))
            .unwrap();
        assert_eq!(aapl.height(), 1);
        // Untouched partitions survive.
        assert!(dir.path().join("ticker=MSFT/event_type=dividend/data.parquet").exists());
    }

    #[test]
    fn append_dedupe_keeps_newest_row_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut layout = layout();
        layout.policy = WritePolicy::AppendDedupe {
            keys: vec!["ticker".into(), "event_date".into()],
        };
        let writer = PartitionWriter::new(dir.path(), "corporate_actions", layout)
            .with_processed_at(fixed_time());
        writer.write(&events()).unwrap();

        let update = df!(
            "ticker" => ["AAPL", "AAPL"],
            "event_type" => ["dividend", "dividend"],
            "event_date" => ["2024-05-10", "2024-08-12"],
            "amount" => [Some(0.26), Some(0.25)],
        )
        .unwrap();
        writer.write(&update).unwrap();

        let aapl = read_parquet(&dir.path().join("ticker=AAPL/event_type=dividend/data.parquet"))
            .unwrap();
        assert_eq!(aapl.height(), 3);
        let dates = aapl.column("event_date").unwrap().str().unwrap();
        let amounts = aapl.column("amount").unwrap().f64().unwrap();
        assert_eq!(dates.get(1), Some("2024-05-10"));
        assert_eq!(amounts.get(1), Some(0.26));
    }

    #[test]
    fn null_dimension_goes_to_default_partition() {
        let dir = tempfile::tempdir().unwrap();
        let df = df!(
            "ticker" => [Some("AAPL"), None],
            "v" => [1i64, 2],
        )
        .unwrap();
        let layout = PartitionLayout {
            dimensions: vec!["ticker".into()],
            ..PartitionLayout::default()
        };
        let written = PartitionWriter::new(dir.path(), "ref", layout)
            .write(&df)
            .unwrap();
        assert_eq!(written.len(), 2);
        assert!(dir
            .path()
            .join(format!("ticker={DEFAULT_PARTITION_VALUE}/data.parquet"))
            .exists());
    }

    #[test]
    fn missing_dimension_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PartitionLayout {
            dimensions: vec!["nope".into()],
            ..PartitionLayout::default()
        };
        let err = PartitionWriter::new(dir.path(), "ref", layout)
            .write(&events())
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingColumn(c) if c == "nope"));
    }

    #[test]
    fn empty_frame_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let empty = events().head(Some(0));
        let written = PartitionWriter::new(dir.path(), "corporate_actions", layout())
            .write(&empty)
            .unwrap();
        assert!(written.is_empty());
    }
}
