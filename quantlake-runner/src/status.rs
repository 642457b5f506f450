//! Metadata status tooling: per-dataset summaries, gap reports and ledger
//! export.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use quantlake_core::metadata::{
    FileLedger, FileWatermarkStore, Layer, LedgerFilter, LedgerSummary, RunLedger, Watermark,
};
use quantlake_core::source::{Calendar, SourceUnit};
use serde::Serialize;
use std::collections::HashSet;
use std::io::Write;

#[derive(Debug, Clone, Serialize)]
pub struct DatasetStatus {
    pub layer: Layer,
    pub summary: LedgerSummary,
    pub watermarks: Vec<Watermark>,
}

/// Status of every dataset with ledger entries in `layers`, or only of
/// `dataset` when given.
pub fn collect_status(
    ledger: &FileLedger,
    watermarks: &FileWatermarkStore,
    layers: &[Layer],
    dataset: Option<&str>,
    range: Option<(NaiveDate, NaiveDate)>,
) -> Result<Vec<DatasetStatus>> {
    let mut out = Vec::new();
    for &layer in layers {
        let names = match dataset {
            Some(name) => vec![name.to_string()],
            None => ledger
                .datasets(layer)
                .with_context(|| format!("listing {layer} datasets"))?,
        };
        for name in names {
            let mut filter = LedgerFilter::layer(layer);
            if let Some((start, end)) = range {
                filter = filter.between(start, end);
            }
            let summary = ledger
                .summary(&name, &filter)
                .with_context(|| format!("summarizing {layer}/{name}"))?;
            if summary.total_jobs == 0 && dataset.is_none() {
                continue;
            }
            let marks = watermarks
                .list(&name, layer)
                .with_context(|| format!("reading {layer}/{name} watermarks"))?;
            out.push(DatasetStatus {
                layer,
                summary,
                watermarks: marks,
            });
        }
    }
    Ok(out)
}

/// Expected units in the range whose latest ledger entry is absent or failed.
pub fn find_gaps(
    calendar: &dyn Calendar,
    ledger: &dyn RunLedger,
    layer: Layer,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<SourceUnit>> {
    let units = calendar
        .expected_units(start, end)
        .context("enumerating expected units")?;
    let keys: Vec<_> = units.iter().map(|u| u.key.clone()).collect();
    let missing: HashSet<_> = ledger
        .missing(calendar.dataset(), layer, &keys)
        .context("reading ledger")?
        .into_iter()
        .collect();
    Ok(units.into_iter().filter(|u| missing.contains(&u.key)).collect())
}

/// Write matching ledger entries as CSV. Returns the number of rows.
pub fn export_ledger_csv<W: Write>(
    ledger: &dyn RunLedger,
    dataset: &str,
    filter: &LedgerFilter,
    out: W,
) -> Result<usize> {
    let entries = ledger
        .list(dataset, filter)
        .with_context(|| format!("reading ledger for {dataset}"))?;

    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record([
        "dataset",
        "layer",
        "partition_key",
        "date",
        "scope",
        "status",
        "timestamp",
        "records",
        "bytes",
        "elapsed_ms",
        "content_hash",
        "error",
    ])?;
    for e in &entries {
        wtr.write_record([
            e.dataset.clone(),
            e.layer.to_string(),
            e.partition_key.clone(),
            e.date.to_string(),
            e.scope.clone().unwrap_or_default(),
            e.status.to_string(),
            e.timestamp.to_rfc3339(),
            e.statistics.records.to_string(),
            e.statistics.bytes.to_string(),
            e.statistics.elapsed_ms.to_string(),
            e.statistics.content_hash.clone().unwrap_or_default(),
            e.error.clone().unwrap_or_default(),
        ])?;
    }
    wtr.flush().context("flushing ledger export")?;
    Ok(entries.len())
}
