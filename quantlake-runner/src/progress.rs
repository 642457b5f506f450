//! Progress callbacks for ingestion runs.

use crate::summary::{RunSummary, UnitOutcome, UnitReport};

/// Called from worker threads; implementations must be thread-safe.
pub trait IngestProgress: Send + Sync {
    /// Called once before the first unit, after skips are planned.
    fn on_plan(&self, dataset: &str, total: usize);

    /// Called when a unit reaches a terminal state. `done` counts units
    /// finished so far across all workers.
    fn on_complete(&self, report: &UnitReport, done: usize, total: usize);

    fn on_batch_complete(&self, summary: &RunSummary);
}

/// Prints one line per unit.
pub struct StdoutProgress;

impl IngestProgress for StdoutProgress {
    fn on_plan(&self, dataset: &str, total: usize) {
        println!("Ingesting {dataset}: {total} units");
    }

    fn on_complete(&self, report: &UnitReport, done: usize, total: usize) {
        match &report.outcome {
            UnitOutcome::Success { rows, .. } => {
                println!("[{done}/{total}] OK: {} ({rows} rows)", report.key)
            }
            UnitOutcome::Skipped => println!("[{done}/{total}] SKIP: {}", report.key),
            UnitOutcome::Failed { error } => {
                println!("[{done}/{total}] FAIL: {}: {error}", report.key)
            }
        }
    }

    fn on_batch_complete(&self, summary: &RunSummary) {
        println!(
            "\nIngest complete: {} processed, {} skipped, {} failed, {} rows",
            summary.processed, summary.skipped, summary.failed, summary.rows_ingested
        );
    }
}

/// Discards every callback.
pub struct NoProgress;

impl IngestProgress for NoProgress {
    fn on_plan(&self, _dataset: &str, _total: usize) {}
    fn on_complete(&self, _report: &UnitReport, _done: usize, _total: usize) {}
    fn on_batch_complete(&self, _summary: &RunSummary) {}
}
