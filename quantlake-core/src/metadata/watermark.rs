//! Watermark store: the latest fully ingested date per (dataset, scope, layer).
//!
//! `set` overwrites unconditionally. `advance` is the compare-and-set used by
//! concurrent ingestion workers: it only moves the stored date forward, and it
//! is serialized per key by an in-process mutex plus an on-disk lock file, so
//! concurrent callers always end with the maximum date.

use super::{validate_scope, write_json_atomic, FileLock, Layer, MetadataError};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Identity of one watermark record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatermarkKey {
    pub dataset: String,
    pub scope: Option<String>,
    pub layer: Layer,
}

impl WatermarkKey {
    pub fn new(dataset: &str, scope: Option<&str>, layer: Layer) -> Self {
        Self {
            dataset: dataset.to_string(),
            scope: scope.map(str::to_string),
            layer,
        }
    }
}

/// Persisted watermark document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub dataset: String,
    pub scope: Option<String>,
    pub layer: Layer,
    pub date: NaiveDate,
    pub updated_at: NaiveDateTime,
}

/// Keyed storage for watermarks.
pub trait WatermarkStore: Send + Sync {
    /// Stored date, or `None` when nothing was ever recorded (full backfill).
    fn get(
        &self,
        dataset: &str,
        scope: Option<&str>,
        layer: Layer,
    ) -> Result<Option<NaiveDate>, MetadataError>;

    /// Overwrite the watermark unconditionally.
    fn set(
        &self,
        dataset: &str,
        date: NaiveDate,
        scope: Option<&str>,
        layer: Layer,
    ) -> Result<(), MetadataError>;

    /// Move the watermark to `date` only if it is later than the stored one.
    ///
    /// Returns `true` if the stored value changed.
    fn advance(
        &self,
        dataset: &str,
        date: NaiveDate,
        scope: Option<&str>,
        layer: Layer,
    ) -> Result<bool, MetadataError>;

    /// Delete the watermark. Returns `true` if one existed.
    fn reset(&self, dataset: &str, scope: Option<&str>, layer: Layer)
        -> Result<bool, MetadataError>;
}

/// JSON-file watermark store rooted at the metadata directory.
pub struct FileWatermarkStore {
    root: PathBuf,
    key_locks: Mutex<HashMap<WatermarkKey, Arc<Mutex<()>>>>,
    lock_timeout: Duration,
    stale_lock_after: Duration,
}

impl FileWatermarkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            key_locks: Mutex::new(HashMap::new()),
            lock_timeout: Duration::from_secs(30),
            stale_lock_after: Duration::from_secs(300),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dataset_dir(&self, dataset: &str, layer: Layer) -> PathBuf {
        self.root.join(layer.as_str()).join(dataset)
    }

    fn file_path(&self, dataset: &str, scope: Option<&str>, layer: Layer) -> PathBuf {
        let name = match scope {
            Some(scope) => format!("watermark_{scope}.json"),
            None => "watermark.json".to_string(),
        };
        self.dataset_dir(dataset, layer).join(name)
    }

    fn read(&self, path: &Path) -> Result<Option<Watermark>, MetadataError> {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|source| MetadataError::Corrupt {
                    path: path.to_path_buf(),
                    source,
                }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MetadataError::io(path, e)),
        }
    }

    fn write(
        &self,
        dataset: &str,
        date: NaiveDate,
        scope: Option<&str>,
        layer: Layer,
    ) -> Result<(), MetadataError> {
        let watermark = Watermark {
            dataset: dataset.to_string(),
            scope: scope.map(str::to_string),
            layer,
            date,
            updated_at: chrono::Local::now().naive_local(),
        };
        write_json_atomic(&self.file_path(dataset, scope, layer), &watermark)?;
        tracing::debug!(%dataset, ?scope, %layer, %date, "watermark written");
        Ok(())
    }

    /// Run `f` holding both the in-process and the on-disk lock for a key.
    fn with_key_lock<T>(
        &self,
        dataset: &str,
        scope: Option<&str>,
        layer: Layer,
        f: impl FnOnce() -> Result<T, MetadataError>,
    ) -> Result<T, MetadataError> {
        let key = WatermarkKey::new(dataset, scope, layer);
        let key_lock = {
            let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key).or_default().clone()
        };
        let _local = key_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let lock_path = self.file_path(dataset, scope, layer).with_extension("lock");
        let _disk = FileLock::acquire(&lock_path, self.lock_timeout, self.stale_lock_after)?;
        f()
    }

    /// Watermark document for a key, including its update time.
    pub fn load(
        &self,
        dataset: &str,
        scope: Option<&str>,
        layer: Layer,
    ) -> Result<Option<Watermark>, MetadataError> {
        validate_scope(scope)?;
        self.read(&self.file_path(dataset, scope, layer))
    }

    /// Every watermark recorded for a dataset (global and per-scope).
    pub fn list(&self, dataset: &str, layer: Layer) -> Result<Vec<Watermark>, MetadataError> {
        let dir = self.dataset_dir(dataset, layer);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MetadataError::io(&dir, e)),
        };

        let mut watermarks = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| MetadataError::io(&dir, e))?.path();
            let is_watermark = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("watermark") && n.ends_with(".json"));
            if is_watermark {
                if let Some(wm) = self.read(&path)? {
                    watermarks.push(wm);
                }
            }
        }
        watermarks.sort_by(|a, b| a.scope.cmp(&b.scope));
        Ok(watermarks)
    }
}

impl WatermarkStore for FileWatermarkStore {
    fn get(
        &self,
        dataset: &str,
        scope: Option<&str>,
        layer: Layer,
    ) -> Result<Option<NaiveDate>, MetadataError> {
        Ok(self.load(dataset, scope, layer)?.map(|wm| wm.date))
    }

    fn set(
        &self,
        dataset: &str,
        date: NaiveDate,
        scope: Option<&str>,
        layer: Layer,
    ) -> Result<(), MetadataError> {
        validate_scope(scope)?;
        self.with_key_lock(dataset, scope, layer, || {
            self.write(dataset, date, scope, layer)
        })
    }

    fn advance(
        &self,
        dataset: &str,
        date: NaiveDate,
        scope: Option<&str>,
        layer: Layer,
    ) -> Result<bool, MetadataError> {
        validate_scope(scope)?;
        self.with_key_lock(dataset, scope, layer, || {
            let current = self.read(&self.file_path(dataset, scope, layer))?;
            if current.is_some_and(|wm| wm.date >= date) {
                return Ok(false);
            }
            self.write(dataset, date, scope, layer)?;
            Ok(true)
        })
    }

    fn reset(
        &self,
        dataset: &str,
        scope: Option<&str>,
        layer: Layer,
    ) -> Result<bool, MetadataError> {
        validate_scope(scope)?;
        self.with_key_lock(dataset, scope, layer, || {
            let path = self.file_path(dataset, scope, layer);
            match fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(MetadataError::io(&path, e)),
            }
        })
    }
}
