//! Ingestion run ledger: JSONL append-only record of every attempt.
//!
//! Entries are never rewritten. Retries append a new entry for the same
//! partition key, and readers resolve the current state of a key by taking
//! its latest entry. Malformed lines (e.g. a torn final write after a crash)
//! are skipped with a warning.

use super::{validate_scope, Layer, MetadataError};
use crate::partition::PartitionKey;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Outcome of one ingestion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    /// Success and skipped both mean the unit needs no further work.
    pub fn is_complete(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Skipped)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Per-unit statistics attached to a ledger entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatistics {
    pub records: u64,
    pub bytes: u64,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One immutable ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub dataset: String,
    pub partition_key: String,
    pub date: NaiveDate,
    pub scope: Option<String>,
    pub layer: Layer,
    pub status: RunStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub statistics: UnitStatistics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LedgerEntry {
    pub fn new(
        key: &PartitionKey,
        date: NaiveDate,
        scope: Option<&str>,
        layer: Layer,
        status: RunStatus,
    ) -> Self {
        Self {
            dataset: key.dataset().to_string(),
            partition_key: key.to_string(),
            date,
            scope: scope.map(str::to_string),
            layer,
            status,
            timestamp: Utc::now(),
            statistics: UnitStatistics::default(),
            error: None,
        }
    }

    pub fn with_statistics(mut self, statistics: UnitStatistics) -> Self {
        self.statistics = statistics;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Selection for [`RunLedger::list`]. All bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub status: Option<RunStatus>,
    /// `None` searches every layer.
    pub layer: Option<Layer>,
    pub scope: Option<String>,
}

impl LedgerFilter {
    pub fn layer(layer: Layer) -> Self {
        Self {
            layer: Some(layer),
            ..Self::default()
        }
    }

    pub fn between(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn contains_date(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }

    fn matches(&self, entry: &LedgerEntry) -> bool {
        self.contains_date(entry.date)
            && self.status.map_or(true, |s| entry.status == s)
            && self.layer.map_or(true, |l| entry.layer == l)
            && self
                .scope
                .as_deref()
                .map_or(true, |s| entry.scope.as_deref() == Some(s))
    }
}

/// Aggregate view over the latest entry of every partition key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub dataset: String,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub total_jobs: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    /// `(success + skipped) / total_jobs`, 0 when there are no jobs.
    pub success_rate: f64,
    pub total_records: u64,
    pub total_bytes: u64,
}

impl LedgerSummary {
    fn from_latest(dataset: &str, entries: &[LedgerEntry]) -> Self {
        let count = |status| entries.iter().filter(|e| e.status == status).count();
        let success = count(RunStatus::Success);
        let failed = count(RunStatus::Failed);
        let skipped = count(RunStatus::Skipped);
        let total_jobs = entries.len();

        let date_range = entries
            .iter()
            .map(|e| e.date)
            .min()
            .zip(entries.iter().map(|e| e.date).max());

        let success_rate = if total_jobs == 0 {
            0.0
        } else {
            (success + skipped) as f64 / total_jobs as f64
        };

        Self {
            dataset: dataset.to_string(),
            date_range,
            total_jobs,
            success,
            failed,
            skipped,
            success_rate,
            total_records: entries.iter().map(|e| e.statistics.records).sum(),
            total_bytes: entries.iter().map(|e| e.statistics.bytes).sum(),
        }
    }
}

/// Append-only ingestion audit log.
pub trait RunLedger: Send + Sync {
    /// Append one entry. An error means the attempt is unconfirmed.
    fn record(&self, entry: &LedgerEntry) -> Result<(), MetadataError>;

    /// Entries sorted by (date, partition key, timestamp) ascending.
    fn list(&self, dataset: &str, filter: &LedgerFilter)
        -> Result<Vec<LedgerEntry>, MetadataError>;

    /// Latest entry per (layer, partition key). The status filter applies
    /// to the latest entry, not to the history.
    fn latest(
        &self,
        dataset: &str,
        filter: &LedgerFilter,
    ) -> Result<Vec<LedgerEntry>, MetadataError> {
        let history_filter = LedgerFilter {
            status: None,
            ..filter.clone()
        };
        let mut latest: BTreeMap<(Layer, String), LedgerEntry> = BTreeMap::new();
        for entry in self.list(dataset, &history_filter)? {
            let slot = (entry.layer, entry.partition_key.clone());
            match latest.get(&slot) {
                Some(prev) if prev.timestamp > entry.timestamp => {}
                _ => {
                    latest.insert(slot, entry);
                }
            }
        }

        let mut entries: Vec<LedgerEntry> = latest
            .into_values()
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .collect();
        entries.sort_by(|a, b| {
            (a.date, &a.partition_key, a.timestamp).cmp(&(b.date, &b.partition_key, b.timestamp))
        });
        Ok(entries)
    }

    fn summary(
        &self,
        dataset: &str,
        filter: &LedgerFilter,
    ) -> Result<LedgerSummary, MetadataError> {
        let latest = self.latest(dataset, filter)?;
        Ok(LedgerSummary::from_latest(dataset, &latest))
    }

    /// Expected keys whose latest entry is absent or not complete.
    fn missing(
        &self,
        dataset: &str,
        layer: Layer,
        expected: &[PartitionKey],
    ) -> Result<Vec<PartitionKey>, MetadataError> {
        let complete: std::collections::HashSet<String> = self
            .latest(dataset, &LedgerFilter::layer(layer))?
            .into_iter()
            .filter(|e| e.status.is_complete())
            .map(|e| e.partition_key)
            .collect();

        Ok(expected
            .iter()
            .filter(|k| !complete.contains(&k.to_string()))
            .cloned()
            .collect())
    }
}

/// JSONL ledger under the metadata root.
pub struct FileLedger {
    root: PathBuf,
    append_lock: Mutex<()>,
}

impl FileLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, entry: &LedgerEntry) -> PathBuf {
        let name = match &entry.scope {
            Some(scope) => format!("{}_{scope}.jsonl", entry.date.format("%Y-%m-%d")),
            None => format!("{}.jsonl", entry.date.format("%Y-%m-%d")),
        };
        self.root
            .join(entry.layer.as_str())
            .join(&entry.dataset)
            .join(format!("{:04}", entry.date.year()))
            .join(format!("{:02}", entry.date.month()))
            .join(name)
    }

    /// Datasets that have any metadata in a layer.
    pub fn datasets(&self, layer: Layer) -> Result<Vec<String>, MetadataError> {
        let dir = self.root.join(layer.as_str());
        let mut names: Vec<String> = sorted_children(&dir)?
            .into_iter()
            .filter(|p| p.is_dir())
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    fn read_file(&self, path: &Path, out: &mut Vec<LedgerEntry>) -> Result<(), MetadataError> {
        let file = fs::File::open(path).map_err(|e| MetadataError::io(path, e))?;
        for (line_no, line) in io::BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| MetadataError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(&line) {
                Ok(entry) => out.push(entry),
                Err(e) => {
                    tracing::warn!(file = %path.display(), line = line_no + 1, error = %e,
                        "skipping malformed ledger line");
                }
            }
        }
        Ok(())
    }

    fn scan_layer(
        &self,
        dataset: &str,
        layer: Layer,
        filter: &LedgerFilter,
        out: &mut Vec<LedgerEntry>,
    ) -> Result<(), MetadataError> {
        let dataset_dir = self.root.join(layer.as_str()).join(dataset);
        let year_bounds = (
            filter.start.map(|d| d.year()),
            filter.end.map(|d| d.year()),
        );

        for year_dir in sorted_children(&dataset_dir)? {
            let Some(year) = dir_number(&year_dir) else { continue };
            if year_bounds.0.is_some_and(|s| year < s as u32)
                || year_bounds.1.is_some_and(|e| year > e as u32)
            {
                continue;
            }
            for month_dir in sorted_children(&year_dir)? {
                if dir_number(&month_dir).is_none() {
                    continue;
                }
                for file in sorted_children(&month_dir)? {
                    let Some(date) = file_date(&file) else { continue };
                    if filter.contains_date(date) {
                        self.read_file(&file, out)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl RunLedger for FileLedger {
    fn record(&self, entry: &LedgerEntry) -> Result<(), MetadataError> {
        if entry.dataset.is_empty() {
            return Err(MetadataError::InvalidKey("empty dataset name".into()));
        }
        validate_scope(entry.scope.as_deref())?;

        let path = self.entry_path(entry);
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.append_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| MetadataError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| MetadataError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| MetadataError::io(&path, e))
    }

    fn list(
        &self,
        dataset: &str,
        filter: &LedgerFilter,
    ) -> Result<Vec<LedgerEntry>, MetadataError> {
        let layers: Vec<Layer> = match filter.layer {
            Some(layer) => vec![layer],
            None => Layer::ALL.to_vec(),
        };

        let mut entries = Vec::new();
        for layer in layers {
            self.scan_layer(dataset, layer, filter, &mut entries)?;
        }
        entries.retain(|e| filter.matches(e));
        // Stable: equal timestamps keep append order.
        entries.sort_by(|a, b| {
            (a.date, &a.partition_key, a.timestamp).cmp(&(b.date, &b.partition_key, b.timestamp))
        });
        Ok(entries)
    }
}

fn sorted_children(dir: &Path) -> Result<Vec<PathBuf>, MetadataError> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(MetadataError::io(dir, e)),
    };
    let mut paths = Vec::new();
    for entry in read {
        paths.push(entry.map_err(|e| MetadataError::io(dir, e))?.path());
    }
    paths.sort();
    Ok(paths)
}

fn dir_number(path: &Path) -> Option<u32> {
    if !path.is_dir() {
        return None;
    }
    path.file_name()?.to_str()?.parse().ok()
}

/// `2024-03-01.jsonl` or `2024-03-01_AAPL.jsonl` → 2024-03-01.
fn file_date(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(stem.get(..10)?, "%Y-%m-%d").ok()
}
