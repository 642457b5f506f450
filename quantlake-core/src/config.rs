//! Lake configuration loaded from TOML.
//!
//! ```toml
//! root = "/data/quantlake"
//!
//! [ingest]
//! workers = 8
//! timeout_secs = 300
//!
//! [datasets.stocks_daily]
//! source = { kind = "landing", name = "polygon" }
//! calendar = { kind = "trading_days", holidays = ["2024-01-01"] }
//!
//! [datasets.fundamentals]
//! source = { kind = "http" }
//! calendar = { kind = "ticker_catalog", tickers = ["AAPL", "MSFT"] }
//! policy = { mode = "append_dedupe", keys = ["ticker", "filing_date", "fiscal_period"] }
//! ```
//!
//! `QUANTLAKE_ROOT` in the environment overrides `root`.

use crate::fundamentals::DEFAULT_COMMON_THRESHOLD;
use crate::source::{
    Calendar, HttpSourceConfig, RetryPolicy, TickerCatalog, TradingDayCalendar,
};
use crate::storage::WritePolicy;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ROOT_ENV: &str = "QUANTLAKE_ROOT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("dataset '{0}' is not configured")]
    UnknownDataset(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    /// Flat files under `landing/{name}/{dataset}/`.
    Landing { name: String },
    /// Paginated JSON API configured under `[http]`.
    Http,
}

impl Default for SourceKind {
    fn default() -> Self {
        SourceKind::Landing {
            name: "polygon".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalendarKind {
    TradingDays {
        #[serde(default)]
        holidays: Vec<NaiveDate>,
    },
    TickerCatalog {
        #[serde(default)]
        tickers: Vec<String>,
    },
}

impl Default for CalendarKind {
    fn default() -> Self {
        CalendarKind::TradingDays {
            holidays: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub source: SourceKind,
    pub calendar: CalendarKind,
    /// Bronze write policy for this dataset.
    pub policy: WritePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestDefaults {
    pub workers: usize,
    pub timeout_secs: u64,
}

impl Default for IngestDefaults {
    fn default() -> Self {
        Self {
            workers: 4,
            timeout_secs: 300,
        }
    }
}

impl IngestDefaults {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaSettings {
    pub common_threshold: f64,
}

impl Default for SchemaSettings {
    fn default() -> Self {
        Self {
            common_threshold: DEFAULT_COMMON_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LakeConfig {
    pub root: PathBuf,
    pub ingest: IngestDefaults,
    pub retry: RetryPolicy,
    pub http: HttpSourceConfig,
    pub schema: SchemaSettings,
    pub datasets: BTreeMap<String, DatasetConfig>,
}

impl Default for LakeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            ingest: IngestDefaults::default(),
            retry: RetryPolicy::default(),
            http: HttpSourceConfig::default(),
            schema: SchemaSettings::default(),
            datasets: BTreeMap::new(),
        }
    }
}

impl LakeConfig {
    /// Read a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Parse and validate without touching the environment.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(root) = std::env::var(ROOT_ENV) {
            if !root.trim().is_empty() {
                self.root = PathBuf::from(root);
            }
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.workers == 0 {
            return Err(ConfigError::Invalid("ingest.workers must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.schema.common_threshold) {
            return Err(ConfigError::Invalid(format!(
                "schema.common_threshold {} is outside [0, 1]",
                self.schema.common_threshold
            )));
        }
        for (name, dataset) in &self.datasets {
            if let WritePolicy::AppendDedupe { keys } = &dataset.policy {
                if keys.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "dataset '{name}': append_dedupe needs at least one key"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn landing_dir(&self) -> PathBuf {
        self.root.join("landing")
    }

    pub fn bronze_dir(&self) -> PathBuf {
        self.root.join("bronze")
    }

    pub fn silver_dir(&self) -> PathBuf {
        self.root.join("silver")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    pub fn dataset(&self, name: &str) -> Result<&DatasetConfig, ConfigError> {
        self.datasets
            .get(name)
            .ok_or_else(|| ConfigError::UnknownDataset(name.to_string()))
    }

    /// Expected-unit calendar for a configured dataset.
    pub fn calendar(&self, name: &str) -> Result<Box<dyn Calendar>, ConfigError> {
        let dataset = self.dataset(name)?;
        Ok(match &dataset.calendar {
            CalendarKind::TradingDays { holidays } => {
                Box::new(TradingDayCalendar::new(name, holidays.iter().copied()))
            }
            CalendarKind::TickerCatalog { tickers } => {
                Box::new(TickerCatalog::new(name, tickers.iter().cloned()))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
root = "/lake"

[ingest]
workers = 8

[schema]
common_threshold = 0.3

[http.endpoints]
fundamentals = "/vX/reference/financials?ticker={ticker}&filing_date.gte={start}&filing_date.lte={end}"

[datasets.stocks_daily]
source = { kind = "landing", name = "polygon" }
calendar = { kind = "trading_days", holidays = ["2024-07-04"] }

[datasets.fundamentals]
source = { kind = "http" }
calendar = { kind = "ticker_catalog", tickers = ["msft", "AAPL"] }
policy = { mode = "append_dedupe", keys = ["ticker", "filing_date", "fiscal_year", "fiscal_period"] }
"#;

    #[test]
    fn parses_sample_config() {
        let config = LakeConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.root, PathBuf::from("/lake"));
        assert_eq!(config.ingest.workers, 8);
        assert_eq!(config.ingest.timeout_secs, 300);
        assert_eq!(config.schema.common_threshold, 0.3);
        assert_eq!(config.bronze_dir(), PathBuf::from("/lake/bronze"));
        assert_eq!(config.retry, RetryPolicy::default());

        let fundamentals = config.dataset("fundamentals").unwrap();
        assert_eq!(fundamentals.source, SourceKind::Http);
        assert!(matches!(fundamentals.policy, WritePolicy::AppendDedupe { ref keys } if keys.len() == 4));
        assert_eq!(config.dataset("stocks_daily").unwrap().policy, WritePolicy::Overwrite);
    }

    #[test]
    fn builds_calendars_from_config() {
        let config = LakeConfig::from_toml(SAMPLE).unwrap();
        let d = |day| NaiveDate::from_ymd_opt(2024, 7, day).unwrap();

        let daily = config.calendar("stocks_daily").unwrap();
        let units = daily.expected_units(d(1), d(5)).unwrap();
        assert_eq!(units.len(), 3);

        let catalog = config.calendar("fundamentals").unwrap();
        let units = catalog.expected_units(d(1), d(5)).unwrap();
        let scopes: Vec<_> = units.iter().filter_map(|u| u.scope.clone()).collect();
        assert_eq!(scopes, vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = LakeConfig::from_toml("").unwrap();
        assert_eq!(config, LakeConfig::default());
        assert!(matches!(
            config.dataset("nope"),
            Err(ConfigError::UnknownDataset(_))
        ));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            LakeConfig::from_toml("[ingest]\nworkers = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            LakeConfig::from_toml("[schema]\ncommon_threshold = 1.5"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            LakeConfig::from_toml("[datasets.x]\npolicy = { mode = \"append_dedupe\", keys = [] }"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(LakeConfig::from_toml("root = ["), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lake.toml");
        std::fs::write(&path, "[ingest]\nworkers = 2\n").unwrap();
        let config = LakeConfig::load(&path).unwrap();
        assert_eq!(config.ingest.workers, 2);

        let err = LakeConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
