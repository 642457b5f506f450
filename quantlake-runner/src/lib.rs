//! quantlake runner: orchestration on top of `quantlake-core`.
//!
//! - Incremental ingestion of calendar units into bronze on a worker pool
//! - Bronze → silver pipelines for fundamentals and corporate actions
//! - Schema discovery over bronze fundamentals
//! - Run summaries, progress callbacks and metadata status tooling

pub mod ingest;
pub mod pipeline;
pub mod progress;
pub mod status;
pub mod summary;

pub use ingest::{IncrementalIngestor, IngestError, RunOptions, UnitError};
pub use pipeline::{
    CorporateActionsPipeline, CorporateActionsReport, FundamentalsPipeline, FundamentalsReport,
    PipelineError,
};
pub use progress::{IngestProgress, NoProgress, StdoutProgress};
pub use status::{collect_status, export_ledger_csv, find_gaps, DatasetStatus};
pub use summary::{RunSummary, UnitOutcome, UnitReport};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn ingestor_is_send_sync() {
        assert_send::<IncrementalIngestor>();
        assert_sync::<IncrementalIngestor>();
    }

    #[test]
    fn run_summary_is_send_sync() {
        assert_send::<RunSummary>();
        assert_sync::<RunSummary>();
    }

    #[test]
    fn pipelines_are_send_sync() {
        assert_send::<FundamentalsPipeline>();
        assert_sync::<FundamentalsPipeline>();
        assert_send::<CorporateActionsPipeline>();
        assert_sync::<CorporateActionsPipeline>();
    }
}
