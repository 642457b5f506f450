//! Columnar storage: Parquet I/O and the partitioned table writer.

pub mod parquet;
pub mod partition_writer;

pub use parquet::{find_parquet_files, read_parquet, write_parquet_atomic, ParquetOptions, WrittenFile};
pub use partition_writer::{
    apply_write_policy, PartitionLayout, PartitionWriter, SortColumn, WritePolicy, WrittenPartition,
    DEFAULT_PARTITION_VALUE,
};

use crate::partition::PartitionError;
use polars::prelude::PolarsError;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failures while reading or publishing partition files.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Polars {
        context: String,
        #[source]
        source: PolarsError,
    },

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("column '{0}' not found")]
    MissingColumn(String),
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn polars(context: impl Into<String>, source: PolarsError) -> Self {
        StorageError::Polars {
            context: context.into(),
            source,
        }
    }
}
