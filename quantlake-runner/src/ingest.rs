//! Incremental ingestion: calendar units → fetch → bronze partition.
//!
//! Each unit moves through
//!
//! ```text
//! pending ─▶ (date ≤ watermark) ─▶ skipped
//!         └▶ fetch ─▶ transform ─▶ write ─▶ success ─▶ advance watermark
//!                                         └▶ failed
//! ```
//!
//! Units are grouped into lanes by watermark scope. A lane runs on one
//! worker in ascending date order; long lanes are split into contiguous
//! chunks so every worker gets a share. Lanes never share a partition key.
//!
//! Chunks of one scope finish out of order, so the watermark follows the
//! scope's completion frontier: it only moves to a date once every unit of
//! the scope at or before that date has a ledger entry from this run. A
//! cancel or abort therefore never leaves it ahead of a unit that did not run.
//!
//! A unit counts as done only once its artifact, ledger entry and watermark
//! update are all persisted. A ledger or watermark failure aborts the run:
//! in-flight units finish, no new unit starts, and the error is returned.

use crate::progress::IngestProgress;
use crate::summary::{truncate_error, RunSummary, UnitOutcome, UnitReport};
use chrono::NaiveDate;
use quantlake_core::bronze::{BronzeError, PayloadDecoder, UnitTransform};
use quantlake_core::metadata::{
    Layer, LedgerEntry, MetadataError, RunLedger, RunStatus, UnitStatistics, WatermarkStore,
};
use quantlake_core::partition::{PartitionError, PartitionKey};
use quantlake_core::source::{Calendar, FetchError, SourceFetcher, SourcePayload, SourceUnit};
use quantlake_core::storage::{
    apply_write_policy, write_parquet_atomic, ParquetOptions, StorageError, WritePolicy,
};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("start date {start} is after end date {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("failed to enumerate units: {0}")]
    Calendar(#[from] PartitionError),

    #[error("metadata failure, run aborted: {0}")]
    Metadata(#[from] MetadataError),

    #[error("failed to start worker pool: {0}")]
    Pool(String),
}

/// Unit-local failure. Recorded as a `failed` ledger entry; the run goes on.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("transform failed: {0}")]
    Transform(#[from] BronzeError),

    #[error("partition write failed: {0}")]
    Write(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Skip units at or before the stored watermark.
    pub incremental: bool,
    /// Ignore the watermark even when incremental.
    pub force: bool,
    /// Only units whose latest ledger entry is missing or failed.
    pub fill_gaps: bool,
    pub workers: usize,
    /// Upper bound on a single fetch.
    pub timeout: Duration,
}

impl RunOptions {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start,
            end,
            incremental: true,
            force: false,
            fill_gaps: false,
            workers: 4,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn full(mut self) -> Self {
        self.incremental = false;
        self
    }

    pub fn gaps_only(mut self) -> Self {
        self.fill_gaps = true;
        self
    }

    fn uses_watermark(&self) -> bool {
        self.incremental && !self.force && !self.fill_gaps
    }
}

/// Result of the fetch → transform → write half of a unit.
struct Ingested {
    rows: u64,
    bytes: u64,
    content_hash: Option<String>,
    reason: Option<String>,
}

/// Shared state of one run, borrowed by every worker.
struct RunState<'a> {
    dataset: &'a str,
    options: &'a RunOptions,
    progress: &'a dyn IngestProgress,
    cancel: Option<&'a AtomicBool>,
    /// Watermark per scope read once at plan time.
    watermarks: HashMap<Option<String>, Option<NaiveDate>>,
    frontiers: Mutex<HashMap<Option<String>, ScopeFrontier>>,
    abort: AtomicBool,
    fatal: Mutex<Option<MetadataError>>,
    fetches: AtomicUsize,
    done: AtomicUsize,
    total: usize,
}

impl RunState<'_> {
    fn should_stop(&self) -> bool {
        self.abort.load(Ordering::SeqCst) || self.cancel.is_some_and(|c| c.load(Ordering::Relaxed))
    }

    fn fail_run(&self, error: MetadataError) {
        self.abort.store(true, Ordering::SeqCst);
        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if fatal.is_none() {
            *fatal = Some(error);
        }
    }
}

pub struct IncrementalIngestor {
    fetcher: Arc<dyn SourceFetcher>,
    transform: Arc<dyn UnitTransform>,
    watermarks: Arc<dyn WatermarkStore>,
    ledger: Arc<dyn RunLedger>,
    bronze_root: PathBuf,
    policy: WritePolicy,
    parquet: ParquetOptions,
}

impl IncrementalIngestor {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        watermarks: Arc<dyn WatermarkStore>,
        ledger: Arc<dyn RunLedger>,
        bronze_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fetcher,
            transform: Arc::new(PayloadDecoder),
            watermarks,
            ledger,
            bronze_root: bronze_root.into(),
            policy: WritePolicy::Overwrite,
            parquet: ParquetOptions::default(),
        }
    }

    pub fn with_transform(mut self, transform: Arc<dyn UnitTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_policy(mut self, policy: WritePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_parquet(mut self, parquet: ParquetOptions) -> Self {
        self.parquet = parquet;
        self
    }

    pub fn bronze_root(&self) -> &Path {
        &self.bronze_root
    }

    /// Bronze artifact of a unit: `{bronze}/{dataset}/{key path}/data.parquet`.
    pub fn partition_path(&self, key: &PartitionKey) -> PathBuf {
        self.bronze_root
            .join(key.dataset())
            .join(key.to_path())
            .join("data.parquet")
    }

    /// Run every expected unit of `calendar` in the option's date range.
    pub fn run(
        &self,
        calendar: &dyn Calendar,
        options: &RunOptions,
        progress: &dyn IngestProgress,
        cancel: Option<&AtomicBool>,
    ) -> Result<RunSummary, IngestError> {
        if options.start > options.end {
            return Err(IngestError::InvalidRange {
                start: options.start,
                end: options.end,
            });
        }
        let started = Instant::now();
        let dataset = calendar.dataset().to_string();

        let mut units = calendar.expected_units(options.start, options.end)?;
        if options.fill_gaps {
            let keys: Vec<PartitionKey> = units.iter().map(|u| u.key.clone()).collect();
            let missing: HashSet<PartitionKey> = self
                .ledger
                .missing(&dataset, Layer::Bronze, &keys)?
                .into_iter()
                .collect();
            units.retain(|u| missing.contains(&u.key));
            tracing::info!(dataset = %dataset, gaps = units.len(), expected = keys.len(), "filling gaps");
        }

        let mut watermarks = HashMap::new();
        if options.uses_watermark() {
            let scopes: BTreeSet<Option<String>> = units.iter().map(|u| u.scope.clone()).collect();
            for scope in scopes {
                let mark = self.watermarks.get(&dataset, scope.as_deref(), Layer::Bronze)?;
                watermarks.insert(scope, mark);
            }
        }

        let total = units.len();
        progress.on_plan(&dataset, total);
        tracing::info!(
            dataset = %dataset,
            source = self.fetcher.name(),
            units = total,
            start = %options.start,
            end = %options.end,
            workers = options.workers,
            "starting ingest"
        );

        let frontiers = plan_frontiers(&units);
        let lanes = plan_lanes(units, options.workers);
        let state = RunState {
            dataset: &dataset,
            options,
            progress,
            cancel,
            watermarks,
            frontiers: Mutex::new(frontiers),
            abort: AtomicBool::new(false),
            fatal: Mutex::new(None),
            fetches: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            total,
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers.max(1))
            .build()
            .map_err(|e| IngestError::Pool(e.to_string()))?;
        let lane_reports: Vec<Vec<UnitReport>> = pool.install(|| {
            lanes
                .par_iter()
                .map(|lane| self.run_lane(lane, &state))
                .collect()
        });

        if let Some(error) = state
            .fatal
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            tracing::error!(dataset = %dataset, error = %error, "ingest aborted");
            return Err(IngestError::Metadata(error));
        }

        let mut reports: Vec<UnitReport> = lane_reports.into_iter().flatten().collect();
        reports.sort_by(|a, b| (a.date, &a.key).cmp(&(b.date, &b.key)));

        let mut summary = RunSummary::new(&dataset, total);
        for report in &reports {
            summary.absorb(report);
        }
        summary.fetches = state.fetches.load(Ordering::SeqCst);
        summary.cancelled = summary.completed() < total;
        summary.elapsed_ms = started.elapsed().as_millis() as u64;

        progress.on_batch_complete(&summary);
        tracing::info!(
            dataset = %dataset,
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            rows = summary.rows_ingested,
            fetches = summary.fetches,
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed_ms,
            "ingest complete"
        );
        Ok(summary)
    }

    fn run_lane(&self, lane: &[SourceUnit], state: &RunState<'_>) -> Vec<UnitReport> {
        let mut reports = Vec::with_capacity(lane.len());
        for unit in lane {
            if state.should_stop() {
                break;
            }
            match self.run_unit(unit, state) {
                Ok(outcome) => {
                    let report = UnitReport {
                        key: unit.key.to_string(),
                        date: unit.date,
                        scope: unit.scope.clone(),
                        outcome,
                    };
                    let done = state.done.fetch_add(1, Ordering::SeqCst) + 1;
                    state.progress.on_complete(&report, done, state.total);
                    reports.push(report);
                }
                Err(e) => {
                    tracing::error!(partition = %unit.key, error = %e, "metadata write failed");
                    state.fail_run(e);
                    break;
                }
            }
        }
        reports
    }

    /// Process one unit. `Err` only for metadata failures.
    fn run_unit(&self, unit: &SourceUnit, state: &RunState<'_>) -> Result<UnitOutcome, MetadataError> {
        let scope = unit.scope.as_deref();

        if let Some(Some(mark)) = state.watermarks.get(&unit.scope) {
            if unit.date <= *mark {
                let entry = LedgerEntry::new(&unit.key, unit.date, scope, Layer::Bronze, RunStatus::Skipped)
                    .with_statistics(UnitStatistics {
                        reason: Some(format!("at or before watermark {mark}")),
                        ..UnitStatistics::default()
                    });
                self.ledger.record(&entry)?;
                self.finish_unit(unit, false, state)?;
                tracing::debug!(partition = %unit.key, watermark = %mark, "skipped by watermark");
                return Ok(UnitOutcome::Skipped);
            }
        }

        let started = Instant::now();
        let result = self.ingest_unit(unit, state);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(ingested) => {
                let statistics = UnitStatistics {
                    records: ingested.rows,
                    bytes: ingested.bytes,
                    elapsed_ms,
                    content_hash: ingested.content_hash,
                    reason: ingested.reason,
                };
                let entry = LedgerEntry::new(&unit.key, unit.date, scope, Layer::Bronze, RunStatus::Success)
                    .with_statistics(statistics);
                self.ledger.record(&entry)?;
                self.finish_unit(unit, true, state)?;
                tracing::debug!(partition = %unit.key, rows = ingested.rows, elapsed_ms, "unit ingested");
                Ok(UnitOutcome::Success {
                    rows: ingested.rows,
                    bytes: ingested.bytes,
                })
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(partition = %unit.key, error = %message, "unit failed");
                let entry = LedgerEntry::new(&unit.key, unit.date, scope, Layer::Bronze, RunStatus::Failed)
                    .with_statistics(UnitStatistics {
                        elapsed_ms,
                        ..UnitStatistics::default()
                    })
                    .with_error(truncate_error(&message));
                self.ledger.record(&entry)?;
                self.finish_unit(unit, false, state)?;
                Ok(UnitOutcome::Failed { error: message })
            }
        }
    }

    fn ingest_unit(&self, unit: &SourceUnit, state: &RunState<'_>) -> Result<Ingested, UnitError> {
        state.fetches.fetch_add(1, Ordering::SeqCst);
        let payload = match self.fetch_with_timeout(unit, state.options.timeout) {
            Ok(payload) => payload,
            Err(FetchError::NotFound(what)) => {
                tracing::debug!(partition = %unit.key, what = %what, "source has no data");
                return Ok(Ingested {
                    rows: 0,
                    bytes: 0,
                    content_hash: None,
                    reason: Some(format!("not found: {what}")),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let frame = self.transform.transform(unit, payload)?;
        let path = self.partition_path(&unit.key);
        let mut frame = apply_write_policy(&self.policy, frame, &path)?;
        let file = write_parquet_atomic(&mut frame, &path, &self.parquet)?;
        Ok(Ingested {
            rows: file.rows as u64,
            bytes: file.bytes,
            content_hash: Some(file.content_hash),
            reason: None,
        })
    }

    /// Fetch on a helper thread so a hung source cannot stall the worker.
    /// A timed-out fetch thread is left to finish on its own.
    fn fetch_with_timeout(
        &self,
        unit: &SourceUnit,
        timeout: Duration,
    ) -> Result<SourcePayload, FetchError> {
        let (tx, rx) = mpsc::channel();
        let fetcher = Arc::clone(&self.fetcher);
        let job = unit.clone();
        thread::Builder::new()
            .name(format!("fetch-{}", unit.dataset()))
            .spawn(move || {
                let _ = tx.send(fetcher.fetch(&job));
            })
            .map_err(|e| FetchError::Fatal(format!("failed to spawn fetch thread: {e}")))?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(FetchError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(FetchError::Fatal(
                "fetch thread exited without a result".to_string(),
            )),
        }
    }

    /// Mark `unit` finished on its scope's frontier and compare-and-set the
    /// watermark when the frontier passes a new successful date.
    fn finish_unit(
        &self,
        unit: &SourceUnit,
        succeeded: bool,
        state: &RunState<'_>,
    ) -> Result<(), MetadataError> {
        let target = {
            let mut frontiers = state.frontiers.lock().unwrap_or_else(PoisonError::into_inner);
            frontiers
                .get_mut(&unit.scope)
                .and_then(|frontier| frontier.finish(&unit.key, succeeded))
        };
        if let Some(date) = target {
            let moved = self.watermarks.advance(
                state.dataset,
                date,
                unit.scope.as_deref(),
                Layer::Bronze,
            )?;
            if moved {
                tracing::debug!(dataset = state.dataset, scope = ?unit.scope, date = %date, "watermark advanced");
            }
        }
        Ok(())
    }
}

/// Units of one scope in date order and how far this run has finished them.
#[derive(Debug, Default)]
struct ScopeFrontier {
    dates: Vec<NaiveDate>,
    /// `None` until the unit finishes, then whether it succeeded.
    finished: Vec<Option<bool>>,
    index: HashMap<PartitionKey, usize>,
    /// Units before this position are all finished.
    next: usize,
    mark: Option<NaiveDate>,
}

impl ScopeFrontier {
    fn new(mut units: Vec<(NaiveDate, PartitionKey)>) -> Self {
        units.sort();
        let index = units
            .iter()
            .enumerate()
            .map(|(i, (_, key))| (key.clone(), i))
            .collect();
        Self {
            finished: vec![None; units.len()],
            dates: units.into_iter().map(|(date, _)| date).collect(),
            index,
            next: 0,
            mark: None,
        }
    }

    /// Record a finished unit. Returns the new watermark target when the
    /// contiguous finished prefix now ends past the last target handed out.
    /// Failed and skipped units extend the prefix but never become the target.
    fn finish(&mut self, key: &PartitionKey, succeeded: bool) -> Option<NaiveDate> {
        let i = *self.index.get(key)?;
        self.finished[i] = Some(succeeded);

        let mut target = None;
        while let Some(Some(ok)) = self.finished.get(self.next) {
            if *ok {
                target = Some(self.dates[self.next]);
            }
            self.next += 1;
        }
        match target {
            Some(date) if self.mark.map_or(true, |mark| date > mark) => {
                self.mark = Some(date);
                Some(date)
            }
            _ => None,
        }
    }
}

fn plan_frontiers(units: &[SourceUnit]) -> HashMap<Option<String>, ScopeFrontier> {
    let mut by_scope: HashMap<Option<String>, Vec<(NaiveDate, PartitionKey)>> = HashMap::new();
    for unit in units {
        by_scope
            .entry(unit.scope.clone())
            .or_default()
            .push((unit.date, unit.key.clone()));
    }
    by_scope
        .into_iter()
        .map(|(scope, units)| (scope, ScopeFrontier::new(units)))
        .collect()
}

/// Group units by scope in ascending order, splitting lanes longer than an
/// even share of the work into contiguous chunks.
fn plan_lanes(units: Vec<SourceUnit>, workers: usize) -> Vec<Vec<SourceUnit>> {
    let chunk = units.len().div_ceil(workers.max(1)).max(1);
    let mut by_scope: BTreeMap<Option<String>, Vec<SourceUnit>> = BTreeMap::new();
    for unit in units {
        by_scope.entry(unit.scope.clone()).or_default().push(unit);
    }

    let mut lanes = Vec::new();
    for (_, mut lane) in by_scope {
        lane.sort_by(|a, b| (a.date, &a.key).cmp(&(b.date, &b.key)));
        if lane.len() <= chunk {
            lanes.push(lane);
        } else {
            lanes.extend(lane.chunks(chunk).map(<[SourceUnit]>::to_vec));
        }
    }
    lanes
}
