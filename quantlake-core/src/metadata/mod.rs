//! Ingestion metadata: watermarks and the run ledger.
//!
//! Layout under the metadata root:
//!
//! ```text
//! {layer}/{dataset}/watermark.json
//! {layer}/{dataset}/watermark_{scope}.json
//! {layer}/{dataset}/{YYYY}/{MM}/{date}[_{scope}].jsonl
//! ```
//!
//! Both stores are the only shared mutable state of a pipeline run. Their
//! failures are reported as [`MetadataError`] and are fatal to the run.

pub mod ledger;
pub mod lock;
pub mod watermark;

pub use ledger::{
    FileLedger, LedgerEntry, LedgerFilter, LedgerSummary, RunLedger, RunStatus, UnitStatistics,
};
pub use lock::FileLock;
pub use watermark::{FileWatermarkStore, Watermark, WatermarkKey, WatermarkStore};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Medallion layer a metadata record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Landing,
    Bronze,
    Silver,
    Gold,
}

impl Layer {
    pub const ALL: [Layer; 4] = [Layer::Landing, Layer::Bronze, Layer::Silver, Layer::Gold];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Landing => "landing",
            Layer::Bronze => "bronze",
            Layer::Silver => "silver",
            Layer::Gold => "gold",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "landing" => Ok(Layer::Landing),
            "bronze" => Ok(Layer::Bronze),
            "silver" => Ok(Layer::Silver),
            "gold" => Ok(Layer::Gold),
            other => Err(format!("unknown layer '{other}'")),
        }
    }
}

/// Errors from the watermark store and the run ledger.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt metadata document {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("metadata serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("timed out waiting for lock {path}")]
    LockTimeout { path: PathBuf },

    #[error("invalid metadata key: {0}")]
    InvalidKey(String),
}

impl MetadataError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        MetadataError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write a JSON document atomically: write `{path}.tmp`, then rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), MetadataError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| MetadataError::io(parent, e))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| MetadataError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        MetadataError::io(path, e)
    })
}

/// Scopes become part of file names, so they follow partition value rules.
pub(crate) fn validate_scope(scope: Option<&str>) -> Result<(), MetadataError> {
    if let Some(scope) = scope {
        crate::partition::validate_segment_value("scope", scope)
            .map_err(|e| MetadataError::InvalidKey(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_parses_case_insensitively() {
        assert_eq!("Bronze".parse::<Layer>().unwrap(), Layer::Bronze);
        assert_eq!("silver".parse::<Layer>().unwrap(), Layer::Silver);
        assert!("platinum".parse::<Layer>().is_err());
    }

    #[test]
    fn layer_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Layer::Gold).unwrap(), "\"gold\"");
    }

    #[test]
    fn scope_with_separator_is_rejected() {
        assert!(validate_scope(Some("BRK/B")).is_err());
        assert!(validate_scope(Some("BRK.B")).is_ok());
        assert!(validate_scope(None).is_ok());
    }
}
