//! Landing-zone day files.
//!
//! Flat files downloaded from object storage are kept verbatim under
//! `{landing_root}/{source}/{dataset}/{YYYY}/{MM}/{YYYY-MM-DD}.csv.gz`.
//! A missing day (holiday, not yet published) is `NotFound`.

use super::{FetchError, SourceFetcher, SourcePayload, SourceUnit};
use chrono::{Datelike, NaiveDate};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const EXTENSIONS: [&str; 2] = ["csv.gz", "csv"];

pub struct LandingFileFetcher {
    root: PathBuf,
    source: String,
}

impl LandingFileFetcher {
    pub fn new(landing_root: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        Self {
            root: landing_root.into(),
            source: source.into(),
        }
    }

    /// Directory holding the day files of one month.
    fn month_dir(&self, dataset: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(&self.source)
            .join(dataset)
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
    }

    /// Canonical path of a day file (gzipped variant).
    pub fn day_path(&self, dataset: &str, date: NaiveDate) -> PathBuf {
        self.month_dir(dataset, date)
            .join(format!("{}.{}", date.format("%Y-%m-%d"), EXTENSIONS[0]))
    }

    fn read(path: &Path) -> Result<Option<Vec<u8>>, FetchError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(FetchError::Fatal(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
            Err(e) => Err(FetchError::Transient(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }
}

impl SourceFetcher for LandingFileFetcher {
    fn name(&self) -> &str {
        "landing"
    }

    fn fetch(&self, unit: &SourceUnit) -> Result<SourcePayload, FetchError> {
        let dir = self.month_dir(unit.dataset(), unit.date);
        let day = unit.date.format("%Y-%m-%d");
        for ext in EXTENSIONS {
            let path = dir.join(format!("{day}.{ext}"));
            if let Some(bytes) = Self::read(&path)? {
                tracing::debug!(file = %path.display(), bytes = bytes.len(), "read landing file");
                return Ok(SourcePayload::Bytes(bytes));
            }
        }
        Err(FetchError::NotFound(format!(
            "no landing file for {} on {day}",
            unit.dataset()
        )))
    }
}
