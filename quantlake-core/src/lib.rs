//! quantlake core: the building blocks of the medallion data lake.
//!
//! - Hive-style partition model shared by every layer
//! - Per-dataset watermarks and the append-only ingestion run ledger
//! - Source contracts: fetchers, retry policy, circuit breaker, calendars
//! - Bronze payload decoding
//! - Fundamentals schema discovery, flattening, merging and derived metrics
//! - Corporate actions normalization
//! - Parquet I/O and the partitioned table writer
//! - TOML lake configuration

pub mod bronze;
pub mod config;
pub mod corporate_actions;
pub mod fundamentals;
pub mod metadata;
pub mod partition;
pub mod source;
pub mod storage;

pub use config::{ConfigError, LakeConfig};
pub use metadata::{Layer, MetadataError};
pub use partition::{PartitionError, PartitionKey, PartitionScheme};
