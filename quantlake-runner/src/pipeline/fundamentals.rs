//! Bronze fundamentals → wide silver table.
//!
//! Every statement kind is flattened on its own, the tables are outer-joined
//! on the natural key, derived metrics are added and the result is written
//! partitioned by `fiscal_year` and `fiscal_period`.

use super::schema::load_statement_records;
use super::{record_partitions, PipelineError, TickerFilter};
use chrono::NaiveDateTime;
use quantlake_core::fundamentals::{
    derive_metrics, merge_statements, FlattenStats, Flattener, StatementKind, UnifiedSchema,
};
use quantlake_core::metadata::RunLedger;
use quantlake_core::storage::{PartitionLayout, PartitionWriter, SortColumn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

pub const BRONZE_DATASET: &str = "fundamentals";
pub const SILVER_DATASET: &str = "fundamentals_wide";

pub fn default_layout() -> PartitionLayout {
    PartitionLayout {
        dimensions: vec!["fiscal_year".into(), "fiscal_period".into()],
        sort: vec![SortColumn::asc("ticker"), SortColumn::desc("filing_date")],
        ..PartitionLayout::default()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FundamentalsReport {
    pub records: usize,
    pub rows: usize,
    pub columns: usize,
    pub partitions: usize,
    pub flatten: FlattenStats,
}

pub struct FundamentalsPipeline {
    bronze_root: PathBuf,
    silver_root: PathBuf,
    ledger: Arc<dyn RunLedger>,
    schema: Option<UnifiedSchema>,
    tickers: TickerFilter,
    layout: PartitionLayout,
    processed_at: Option<NaiveDateTime>,
}

impl FundamentalsPipeline {
    pub fn new(
        bronze_root: impl Into<PathBuf>,
        silver_root: impl Into<PathBuf>,
        ledger: Arc<dyn RunLedger>,
    ) -> Self {
        Self {
            bronze_root: bronze_root.into(),
            silver_root: silver_root.into(),
            ledger,
            schema: None,
            tickers: None,
            layout: default_layout(),
            processed_at: None,
        }
    }

    /// Emit every discovered column, including ones absent from this batch.
    pub fn with_schema(mut self, schema: UnifiedSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_tickers(mut self, tickers: TickerFilter) -> Self {
        self.tickers = tickers;
        self
    }

    pub fn with_layout(mut self, layout: PartitionLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_processed_at(mut self, at: NaiveDateTime) -> Self {
        self.processed_at = Some(at);
        self
    }

    pub fn table_root(&self) -> PathBuf {
        self.silver_root.join(SILVER_DATASET)
    }

    pub fn run(&self) -> Result<FundamentalsReport, PipelineError> {
        let records = load_statement_records(&self.bronze_root, BRONZE_DATASET, &self.tickers)?;
        if records.is_empty() {
            return Err(PipelineError::NoInput(self.bronze_root.join(BRONZE_DATASET)));
        }

        let mut stats = FlattenStats::default();
        let mut tables = Vec::with_capacity(StatementKind::ALL.len());
        for kind in StatementKind::ALL {
            let mut flattener = Flattener::new(kind);
            if let Some(statement) = self.schema.as_ref().and_then(|s| s.statement(kind)) {
                flattener = flattener.with_schema(statement);
            }
            let table = flattener.flatten(&records)?;
            stats.absorb(&table.stats);
            tables.push(table.frame);
        }

        let merged = merge_statements(tables)?;
        let wide = derive_metrics(merged)?;

        let processed_at = self
            .processed_at
            .unwrap_or_else(|| chrono::Local::now().naive_local());
        let writer = PartitionWriter::new(self.table_root(), SILVER_DATASET, self.layout.clone())
            .with_processed_at(processed_at);
        let written = writer.write(&wide)?;
        record_partitions(self.ledger.as_ref(), &written, processed_at.date())?;

        let report = FundamentalsReport {
            records: records.len(),
            rows: wide.height(),
            columns: wide.width(),
            partitions: written.len(),
            flatten: stats,
        };
        tracing::info!(
            records = report.records,
            rows = report.rows,
            columns = report.columns,
            partitions = report.partitions,
            "fundamentals silver complete"
        );
        Ok(report)
    }
}
