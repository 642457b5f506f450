//! Per-unit outcomes and the aggregate run summary.

use chrono::NaiveDate;
use quantlake_core::metadata::RunStatus;
use serde::Serialize;

/// Per-unit error messages kept in the summary are cut to this many chars.
pub const MAX_ERROR_LEN: usize = 256;

pub fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut out: String = message.chars().take(MAX_ERROR_LEN - 3).collect();
    out.push_str("...");
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Success { rows: u64, bytes: u64 },
    Skipped,
    Failed { error: String },
}

impl UnitOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            UnitOutcome::Success { .. } => RunStatus::Success,
            UnitOutcome::Skipped => RunStatus::Skipped,
            UnitOutcome::Failed { .. } => RunStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub key: String,
    pub date: NaiveDate,
    pub scope: Option<String>,
    pub outcome: UnitOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub dataset: String,
    pub total_units: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rows_ingested: u64,
    pub bytes_written: u64,
    /// Fetch calls issued, including not-found responses.
    pub fetches: usize,
    /// Set when the run stopped early on the cancellation flag.
    pub cancelled: bool,
    pub elapsed_ms: u64,
    /// `(partition key, truncated error)` for each failed unit.
    pub errors: Vec<(String, String)>,
}

impl RunSummary {
    pub fn new(dataset: &str, total_units: usize) -> Self {
        Self {
            dataset: dataset.to_string(),
            total_units,
            ..Self::default()
        }
    }

    pub fn absorb(&mut self, report: &UnitReport) {
        match &report.outcome {
            UnitOutcome::Success { rows, bytes } => {
                self.processed += 1;
                self.rows_ingested += rows;
                self.bytes_written += bytes;
            }
            UnitOutcome::Skipped => self.skipped += 1,
            UnitOutcome::Failed { error } => {
                self.failed += 1;
                self.errors
                    .push((report.key.clone(), truncate_error(error)));
            }
        }
    }

    /// Units that reached a terminal state in this run.
    pub fn completed(&self) -> usize {
        self.processed + self.skipped + self.failed
    }

    /// No failures and nothing left unprocessed.
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn report(key: &str, outcome: UnitOutcome) -> UnitReport {
        UnitReport {
            key: key.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            scope: None,
            outcome,
        }
    }

    #[test]
    fn absorb_counts_each_outcome() {
        let mut summary = RunSummary::new("stocks_daily", 3);
        summary.absorb(&report("a", UnitOutcome::Success { rows: 10, bytes: 100 }));
        summary.absorb(&report("b", UnitOutcome::Skipped));
        summary.absorb(&report(
            "c",
            UnitOutcome::Failed {
                error: "boom".into(),
            },
        ));

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.rows_ingested, 10);
        assert_eq!(summary.completed(), 3);
        assert_eq!(summary.errors, vec![("c".to_string(), "boom".to_string())]);
        assert!(!summary.all_succeeded());
    }

    #[test]
    fn long_errors_are_truncated() {
        let long = "x".repeat(1000);
        let cut = truncate_error(&long);
        assert_eq!(cut.chars().count(), MAX_ERROR_LEN);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(300);
        let cut = truncate_error(&long);
        assert_eq!(cut.chars().count(), MAX_ERROR_LEN);
    }

    #[test]
    fn cancelled_run_is_not_successful() {
        let summary = RunSummary {
            cancelled: true,
            ..RunSummary::new("x", 1)
        };
        assert!(!summary.all_succeeded());
    }

    proptest! {
        #[test]
        fn truncation_is_bounded_and_char_safe(message in "\\PC{0,600}") {
            let cut = truncate_error(&message);
            prop_assert!(cut.chars().count() <= MAX_ERROR_LEN);
            if message.chars().count() <= MAX_ERROR_LEN {
                prop_assert_eq!(cut, message);
            }
        }
    }
}
