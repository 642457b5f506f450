//! Bronze dividends / splits / IPOs / ticker events → unified silver table.

use super::{admits, read_bronze, record_partitions, PipelineError, TickerFilter};
use chrono::NaiveDateTime;
use quantlake_core::corporate_actions::{default_layout, normalize_records, to_dataframe, EventType};
use quantlake_core::metadata::RunLedger;
use quantlake_core::storage::{PartitionLayout, PartitionWriter};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

pub const SILVER_DATASET: &str = "corporate_actions";

#[derive(Debug, Clone, Default, Serialize)]
pub struct CorporateActionsReport {
    pub events: BTreeMap<EventType, usize>,
    pub rejected: usize,
    pub tickers: usize,
    pub partitions: usize,
}

impl CorporateActionsReport {
    pub fn total_events(&self) -> usize {
        self.events.values().sum()
    }
}

pub struct CorporateActionsPipeline {
    bronze_root: PathBuf,
    silver_root: PathBuf,
    ledger: Arc<dyn RunLedger>,
    tickers: TickerFilter,
    layout: PartitionLayout,
    processed_at: Option<NaiveDateTime>,
}

impl CorporateActionsPipeline {
    pub fn new(
        bronze_root: impl Into<PathBuf>,
        silver_root: impl Into<PathBuf>,
        ledger: Arc<dyn RunLedger>,
    ) -> Self {
        Self {
            bronze_root: bronze_root.into(),
            silver_root: silver_root.into(),
            ledger,
            tickers: None,
            layout: default_layout(),
            processed_at: None,
        }
    }

    pub fn with_tickers(mut self, tickers: TickerFilter) -> Self {
        self.tickers = tickers;
        self
    }

    pub fn with_processed_at(mut self, at: NaiveDateTime) -> Self {
        self.processed_at = Some(at);
        self
    }

    pub fn table_root(&self) -> PathBuf {
        self.silver_root.join(SILVER_DATASET)
    }

    pub fn run(&self) -> Result<CorporateActionsReport, PipelineError> {
        let mut report = CorporateActionsReport::default();
        let mut actions = Vec::new();

        for event_type in EventType::ALL {
            let mut rows = Vec::new();
            for file in read_bronze(&self.bronze_root, event_type.bronze_dataset(), &self.tickers)? {
                for mut row in file.rows {
                    if let Some(ticker) = &file.ticker {
                        if row.get("ticker").map_or(true, Value::is_null) {
                            row.insert("ticker".to_string(), Value::String(ticker.clone()));
                        }
                    }
                    rows.push(row);
                }
            }

            let (parsed, rejected) = normalize_records(event_type, &rows);
            report.rejected += rejected.len();
            let before = actions.len();
            actions.extend(
                parsed
                    .into_iter()
                    .filter(|a| admits(&self.tickers, Some(&a.ticker))),
            );
            let count = actions.len() - before;
            tracing::info!(event_type = %event_type, events = count, rejected = rejected.len(), "normalized");
            report.events.insert(event_type, count);
        }

        if actions.is_empty() {
            return Err(PipelineError::NoInput(self.bronze_root.clone()));
        }
        report.tickers = actions
            .iter()
            .map(|a| a.ticker.as_str())
            .collect::<BTreeSet<_>>()
            .len();

        let frame = to_dataframe(&actions)?;
        let processed_at = self
            .processed_at
            .unwrap_or_else(|| chrono::Local::now().naive_local());
        let writer = PartitionWriter::new(self.table_root(), SILVER_DATASET, self.layout.clone())
            .with_processed_at(processed_at);
        let written = writer.write(&frame)?;
        record_partitions(self.ledger.as_ref(), &written, processed_at.date())?;
        report.partitions = written.len();

        tracing::info!(
            events = report.total_events(),
            tickers = report.tickers,
            partitions = report.partitions,
            "corporate actions silver complete"
        );
        Ok(report)
    }
}
