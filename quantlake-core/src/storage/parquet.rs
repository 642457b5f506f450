//! Parquet I/O with atomic publish.
//!
//! Files are written to `{name}.tmp` next to the target and renamed into
//! place, so readers never observe a partial file under the final name.

use super::StorageError;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Compression and layout knobs for written files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParquetOptions {
    pub zstd_level: i32,
    pub row_group_size: usize,
}

impl Default for ParquetOptions {
    fn default() -> Self {
        Self {
            zstd_level: 3,
            row_group_size: 50_000,
        }
    }
}

/// A file published by [`write_parquet_atomic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub rows: usize,
    pub bytes: u64,
    /// blake3 hex digest of the file content.
    pub content_hash: String,
}

pub fn read_parquet(path: &Path) -> Result<DataFrame, StorageError> {
    let file = fs::File::open(path).map_err(|e| StorageError::io(path, e))?;
    ParquetReader::new(file)
        .finish()
        .map_err(|e| StorageError::polars(format!("read {}", path.display()), e))
}

pub fn write_parquet_atomic(
    df: &mut DataFrame,
    path: &Path,
    options: &ParquetOptions,
) -> Result<WrittenFile, StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }

    let level = ZstdLevel::try_new(options.zstd_level)
        .map_err(|e| StorageError::polars("zstd level", e))?;
    let tmp = path.with_extension("parquet.tmp");
    let file = fs::File::create(&tmp).map_err(|e| StorageError::io(&tmp, e))?;

    let written = ParquetWriter::new(file)
        .with_compression(ParquetCompression::Zstd(Some(level)))
        .with_row_group_size(Some(options.row_group_size))
        .finish(df);
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(StorageError::polars(format!("write {}", path.display()), e));
    }

    let content = fs::read(&tmp).map_err(|e| StorageError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StorageError::io(path, e)
    })?;

    Ok(WrittenFile {
        path: path.to_path_buf(),
        rows: df.height(),
        bytes: content.len() as u64,
        content_hash: blake3::hash(&content).to_hex().to_string(),
    })
}

/// Every `*.parquet` file below `dir`, sorted by path. Missing dir → empty.
pub fn find_parquet_files(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut out = Vec::new();
    collect_parquet(dir, &mut out)?;
    out.sort();
    Ok(out)
}

fn collect_parquet(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), StorageError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StorageError::io(dir, e)),
    };
    for entry in entries {
        let path = entry.map_err(|e| StorageError::io(dir, e))?.path();
        if path.is_dir() {
            collect_parquet(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataFrame {
        df!(
            "ticker" => ["AAPL", "MSFT"],
            "close" => [189.5, 402.1],
        )
        .unwrap()
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/data.parquet");
        let written = write_parquet_atomic(&mut sample(), &path, &ParquetOptions::default()).unwrap();

        assert_eq!(written.rows, 2);
        assert!(written.bytes > 0);
        assert_eq!(written.content_hash.len(), 64);
        assert!(!path.with_extension("parquet.tmp").exists());

        let back = read_parquet(&path).unwrap();
        assert!(back.equals(&sample()));
    }

    #[test]
    fn same_frame_same_hash() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_parquet_atomic(
            &mut sample(),
            &dir.path().join("a.parquet"),
            &ParquetOptions::default(),
        )
        .unwrap();
        let b = write_parquet_atomic(
            &mut sample(),
            &dir.path().join("b.parquet"),
            &ParquetOptions::default(),
        )
        .unwrap();
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn finds_nested_parquet_files() {
        let dir = tempfile::tempdir().unwrap();
        let opts = ParquetOptions::default();
        write_parquet_atomic(&mut sample(), &dir.path().join("x=1/data.parquet"), &opts).unwrap();
        write_parquet_atomic(&mut sample(), &dir.path().join("x=2/data.parquet"), &opts).unwrap();
        fs::write(dir.path().join("x=1/notes.txt"), "skip").unwrap();

        let files = find_parquet_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0] < files[1]);
        assert!(find_parquet_files(&dir.path().join("missing")).unwrap().is_empty());
    }
}
