//! Source contracts: units of work, fetchers and their errors.
//!
//! A [`SourceFetcher`] turns one [`SourceUnit`] (a partition of a dataset,
//! e.g. one trading day or one ticker-year) into a raw payload. The ingestor
//! never depends on a concrete source; landing files and the HTTP API are
//! two implementations of the same trait.

pub mod calendar;
pub mod circuit_breaker;
pub mod http;
pub mod landing;
pub mod retry;

pub use calendar::{Calendar, TickerCatalog, TradingDayCalendar};
pub use circuit_breaker::CircuitBreaker;
pub use http::{HttpFetcher, HttpSourceConfig};
pub use landing::LandingFileFetcher;
pub use retry::RetryPolicy;

use crate::partition::PartitionKey;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// One unit of ingestion work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    pub key: PartitionKey,
    /// Date compared against the watermark.
    pub date: NaiveDate,
    /// Watermark scope, e.g. the ticker for per-ticker datasets.
    pub scope: Option<String>,
    /// Fetcher-specific parameters (ticker, start, end, ...).
    pub params: BTreeMap<String, String>,
}

impl SourceUnit {
    pub fn new(key: PartitionKey, date: NaiveDate) -> Self {
        Self {
            key,
            date,
            scope: None,
            params: BTreeMap::new(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn dataset(&self) -> &str {
        self.key.dataset()
    }
}

/// Raw data returned by a fetcher.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePayload {
    /// File content, e.g. a gzipped CSV day file.
    Bytes(Vec<u8>),
    /// Decoded JSON records from an API.
    Records(Vec<serde_json::Value>),
}

impl SourcePayload {
    pub fn len_bytes(&self) -> usize {
        match self {
            SourcePayload::Bytes(b) => b.len(),
            SourcePayload::Records(r) => r.iter().map(|v| v.to_string().len()).sum(),
        }
    }
}

/// Fetch failures. `NotFound` is an expected condition, not a failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient source error: {0}")]
    Transient(String),

    #[error("fatal source error: {0}")]
    Fatal(String),

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::NotFound(_) => FetchErrorKind::NotFound,
            FetchError::Transient(_) => FetchErrorKind::Transient,
            FetchError::Fatal(_) => FetchErrorKind::Fatal,
            FetchError::Timeout(_) => FetchErrorKind::Timeout,
        }
    }
}

/// Discriminant of [`FetchError`], used to configure retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    NotFound,
    Transient,
    Fatal,
    Timeout,
}

/// A source of raw partition payloads.
pub trait SourceFetcher: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    fn fetch(&self, unit: &SourceUnit) -> Result<SourcePayload, FetchError>;

    /// Whether the source currently accepts requests.
    fn is_available(&self) -> bool {
        true
    }
}
