//! Expected-unit calendars.
//!
//! A calendar enumerates the units a dataset should contain for a date
//! range. The ingestor processes them; the status tooling diffs them against
//! the ledger to find gaps.

use super::SourceUnit;
use crate::partition::{validate_segment_value, PartitionError, PartitionScheme};
use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::BTreeSet;

pub trait Calendar: Send + Sync {
    fn dataset(&self) -> &str;

    /// Units in `[start, end]`, sorted by (scope, date).
    fn expected_units(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SourceUnit>, PartitionError>;
}

/// Weekdays minus configured exchange holidays, one unit per day.
#[derive(Debug, Clone)]
pub struct TradingDayCalendar {
    scheme: PartitionScheme,
    holidays: BTreeSet<NaiveDate>,
}

impl TradingDayCalendar {
    pub fn new(dataset: &str, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            scheme: PartitionScheme::daily(dataset),
            holidays: holidays.into_iter().collect(),
        }
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    pub fn scheme(&self) -> &PartitionScheme {
        &self.scheme
    }
}

impl Calendar for TradingDayCalendar {
    fn dataset(&self) -> &str {
        self.scheme.dataset()
    }

    fn expected_units(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SourceUnit>, PartitionError> {
        start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter(|d| self.is_trading_day(*d))
            .map(|date| Ok(SourceUnit::new(self.scheme.date_key(date)?, date)))
            .collect()
    }
}

/// Ticker list crossed with calendar-year chunks.
///
/// Each unit covers one ticker over one year clipped to the requested
/// range; its watermark date is the last day of the chunk and its scope is
/// the ticker.
///
/// Tickers that cannot be a partition segment (such as `BRK/B`) are dropped
/// with a warning when the catalog is built, so one bad entry never blocks
/// planning for the rest.
#[derive(Debug, Clone)]
pub struct TickerCatalog {
    scheme: PartitionScheme,
    tickers: Vec<String>,
    rejected: Vec<String>,
}

impl TickerCatalog {
    pub fn new(dataset: &str, tickers: impl IntoIterator<Item = String>) -> Self {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for ticker in tickers {
            let ticker = ticker.trim().to_uppercase();
            match validate_segment_value("ticker", &ticker) {
                Ok(()) => accepted.push(ticker),
                Err(e) => {
                    tracing::warn!(dataset, ticker = %ticker, error = %e, "ticker skipped");
                    rejected.push(ticker);
                }
            }
        }
        accepted.sort();
        accepted.dedup();
        Self {
            scheme: PartitionScheme::new(dataset, &["ticker", "year"]),
            tickers: accepted,
            rejected,
        }
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    /// Tickers dropped because they are not valid partition values.
    pub fn rejected(&self) -> &[String] {
        &self.rejected
    }
}

impl Calendar for TickerCatalog {
    fn dataset(&self) -> &str {
        self.scheme.dataset()
    }

    fn expected_units(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SourceUnit>, PartitionError> {
        let mut units = Vec::new();
        if start > end {
            return Ok(units);
        }
        for ticker in &self.tickers {
            for year in start.year()..=end.year() {
                let (Some(jan1), Some(dec31)) = (
                    NaiveDate::from_ymd_opt(year, 1, 1),
                    NaiveDate::from_ymd_opt(year, 12, 31),
                ) else {
                    continue;
                };
                let chunk_start = start.max(jan1);
                let chunk_end = end.min(dec31);
                let key = self.scheme.key(&[ticker.clone(), year.to_string()])?;
                units.push(
                    SourceUnit::new(key, chunk_end)
                        .with_scope(ticker.clone())
                        .with_param("ticker", ticker.clone())
                        .with_param("start", chunk_start.format("%Y-%m-%d").to_string())
                        .with_param("end", chunk_end.format("%Y-%m-%d").to_string()),
                );
            }
        }
        Ok(units)
    }
}
