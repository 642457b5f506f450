//! Schema discovery over bronze fundamentals.

use super::{admits, read_bronze, PipelineError, TickerFilter};
use quantlake_core::fundamentals::{RawStatementRecord, SchemaDiscoverer, UnifiedSchema};
use std::path::Path;

/// Statement records of a bronze dataset. Records without a ticker field
/// take the ticker of their partition.
pub fn load_statement_records(
    bronze_root: &Path,
    dataset: &str,
    tickers: &TickerFilter,
) -> Result<Vec<RawStatementRecord>, PipelineError> {
    let mut records = Vec::new();
    for file in read_bronze(bronze_root, dataset, tickers)? {
        for row in &file.rows {
            let mut record = RawStatementRecord::from_map(row);
            if let Some(ticker) = &file.ticker {
                record = record.with_default_ticker(ticker);
            }
            if admits(tickers, record.ticker.as_deref()) {
                records.push(record);
            }
        }
    }
    Ok(records)
}

pub fn discover_schema(
    bronze_root: &Path,
    dataset: &str,
    tickers: &TickerFilter,
    common_threshold: f64,
) -> Result<UnifiedSchema, PipelineError> {
    let records = load_statement_records(bronze_root, dataset, tickers)?;
    if records.is_empty() {
        return Err(PipelineError::NoInput(bronze_root.join(dataset)));
    }
    let mut schema = SchemaDiscoverer::new(common_threshold).discover(&records);
    schema.generated_at = Some(chrono::Local::now().naive_local());
    Ok(schema)
}

pub fn save_schema(schema: &UnifiedSchema, path: &Path) -> Result<(), PipelineError> {
    schema.save(path).map_err(|source| PipelineError::SchemaFile {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(path = %path.display(), columns = schema.total_columns(), "schema saved");
    Ok(())
}
