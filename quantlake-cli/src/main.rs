//! quantlake CLI: ingestion, silver transforms and metadata commands.
//!
//! Commands:
//! - `ingest`: incremental landing/API → bronze ingestion for one dataset
//! - `discover-schema`: scan bronze fundamentals and write the schema JSON
//! - `schema-columns`: list the wide silver table's columns from a schema file
//! - `fundamentals`: build the wide fundamentals silver table
//! - `corporate-actions`: build the unified corporate actions silver table
//! - `metadata status | missing | export-csv | reset-watermark`

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use quantlake_core::config::SourceKind;
use quantlake_core::fundamentals::UnifiedSchema;
use quantlake_core::metadata::{
    FileLedger, FileWatermarkStore, Layer, LedgerFilter, RunStatus, WatermarkStore,
};
use quantlake_core::source::{
    CircuitBreaker, HttpFetcher, LandingFileFetcher, SourceFetcher,
};
use quantlake_core::LakeConfig;
use quantlake_runner::pipeline::{self, ticker_filter};
use quantlake_runner::{
    collect_status, export_ledger_csv, find_gaps, CorporateActionsPipeline, FundamentalsPipeline,
    IncrementalIngestor, RunOptions, StdoutProgress,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "quantlake", about = "quantlake: medallion data lake pipeline")]
struct Cli {
    /// Lake config TOML.
    #[arg(long, global = true, env = "QUANTLAKE_CONFIG")]
    config: Option<PathBuf>,

    /// Lake root; overrides the config file.
    #[arg(long, global = true, env = "QUANTLAKE_ROOT")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a dataset into bronze.
    Ingest {
        /// Dataset name from the config.
        dataset: String,

        /// Start date (YYYY-MM-DD).
        #[arg(long)]
        start: String,

        /// End date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        end: Option<String>,

        /// Process every unit regardless of the watermark.
        #[arg(long, default_value_t = false)]
        full: bool,

        /// Re-process units at or before the watermark.
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Only process units missing from the ledger or failed.
        #[arg(long, default_value_t = false)]
        fill_gaps: bool,

        /// Worker threads. Defaults to the config value.
        #[arg(long)]
        workers: Option<usize>,

        /// Per-fetch timeout in seconds. Defaults to the config value.
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// API key for HTTP datasets.
        #[arg(long, env = "POLYGON_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },
    /// Discover the fundamentals schema from bronze and save it as JSON.
    DiscoverSchema {
        /// Bronze dataset to scan.
        #[arg(long, default_value = "fundamentals")]
        dataset: String,

        /// Restrict to these tickers.
        #[arg(long, num_args = 1..)]
        tickers: Vec<String>,

        /// Common-column threshold. Defaults to the config value.
        #[arg(long)]
        threshold: Option<f64>,

        /// Output file. Defaults to {root}/metadata/schema/fundamentals_schema.json.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List the wide silver table's columns from a saved schema.
    SchemaColumns {
        /// Schema JSON. Defaults to {root}/metadata/schema/fundamentals_schema.json.
        #[arg(long)]
        schema: Option<PathBuf>,
    },
    /// Build the wide fundamentals silver table.
    Fundamentals {
        #[arg(long, num_args = 1..)]
        tickers: Vec<String>,

        /// Schema JSON whose columns are always emitted.
        #[arg(long)]
        schema: Option<PathBuf>,
    },
    /// Build the unified corporate actions silver table.
    CorporateActions {
        #[arg(long, num_args = 1..)]
        tickers: Vec<String>,
    },
    /// Watermark and ledger commands.
    Metadata {
        #[command(subcommand)]
        action: MetadataAction,
    },
}

#[derive(Subcommand)]
enum MetadataAction {
    /// Per-dataset ledger summary and watermarks.
    Status {
        /// Layer to report. Defaults to bronze and silver.
        #[arg(long)]
        layer: Option<Layer>,

        #[arg(long)]
        dataset: Option<String>,

        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,

        /// Print JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Expected units with no successful ledger entry.
    Missing {
        dataset: String,

        #[arg(long)]
        start: String,

        #[arg(long)]
        end: Option<String>,

        #[arg(long, default_value = "bronze")]
        layer: Layer,
    },
    /// Export ledger entries as CSV.
    ExportCsv {
        dataset: String,

        #[arg(long)]
        layer: Option<Layer>,

        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,

        /// success, failed or skipped.
        #[arg(long)]
        status: Option<String>,

        /// Output file. Defaults to stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Delete a watermark so the next incremental run starts from scratch.
    ResetWatermark {
        dataset: String,

        #[arg(long)]
        scope: Option<String>,

        #[arg(long, default_value = "bronze")]
        layer: Layer,

        /// Actually delete (without this flag, only shows the current value).
        #[arg(long, default_value_t = false)]
        confirm: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("quantlake=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.root)?;

    match cli.command {
        Commands::Ingest {
            dataset,
            start,
            end,
            full,
            force,
            fill_gaps,
            workers,
            timeout_secs,
            api_key,
        } => {
            let mut options = RunOptions::new(parse_date(&start)?, parse_end(end.as_deref())?)
                .with_workers(workers.unwrap_or(config.ingest.workers))
                .with_timeout(
                    timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| config.ingest.timeout()),
                );
            options.incremental = !full;
            options.force = force;
            options.fill_gaps = fill_gaps;
            run_ingest(&config, &dataset, &options, api_key)
        }
        Commands::DiscoverSchema {
            dataset,
            tickers,
            threshold,
            output,
        } => {
            let threshold = threshold.unwrap_or(config.schema.common_threshold);
            let schema = pipeline::discover_schema(
                &config.bronze_dir(),
                &dataset,
                &ticker_filter(&tickers),
                threshold,
            )?;
            let path = output.unwrap_or_else(|| default_schema_path(&config));
            pipeline::save_schema(&schema, &path)?;
            for (kind, statement) in &schema.statements {
                println!(
                    "{kind:<28} {:>5} columns ({} common, {} rare)",
                    statement.total_columns, statement.common_columns, statement.rare_columns
                );
            }
            println!("Schema written to {}", path.display());
            Ok(())
        }
        Commands::SchemaColumns { schema } => {
            let path = schema.unwrap_or_else(|| default_schema_path(&config));
            let schema = load_schema(&path)?;
            for (name, sql_type) in schema.silver_columns() {
                println!("{name}\t{sql_type}");
            }
            Ok(())
        }
        Commands::Fundamentals { tickers, schema } => {
            let ledger = Arc::new(FileLedger::new(config.metadata_dir()));
            let mut pipeline =
                FundamentalsPipeline::new(config.bronze_dir(), config.silver_dir(), ledger)
                    .with_tickers(ticker_filter(&tickers));
            if let Some(path) = schema {
                pipeline = pipeline.with_schema(load_schema(&path)?);
            }
            let report = pipeline.run()?;
            println!(
                "fundamentals_wide: {} records → {} rows × {} columns in {} partitions",
                report.records, report.rows, report.columns, report.partitions
            );
            Ok(())
        }
        Commands::CorporateActions { tickers } => {
            let ledger = Arc::new(FileLedger::new(config.metadata_dir()));
            let report =
                CorporateActionsPipeline::new(config.bronze_dir(), config.silver_dir(), ledger)
                    .with_tickers(ticker_filter(&tickers))
                    .run()?;
            for (event_type, count) in &report.events {
                println!("{event_type:<14} {count:>8}");
            }
            println!(
                "corporate_actions: {} events, {} tickers, {} partitions ({} rejected)",
                report.total_events(),
                report.tickers,
                report.partitions,
                report.rejected
            );
            Ok(())
        }
        Commands::Metadata { action } => run_metadata(&config, action),
    }
}

fn load_config(path: Option<&Path>, root: Option<PathBuf>) -> Result<LakeConfig> {
    let mut config = match path {
        Some(path) => LakeConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => {
            let mut config = LakeConfig::default();
            config.apply_env();
            config
        }
    };
    if let Some(root) = root {
        config = config.with_root(root);
    }
    Ok(config)
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
}

fn parse_end(s: Option<&str>) -> Result<NaiveDate> {
    s.map(parse_date)
        .transpose()
        .map(|d| d.unwrap_or_else(|| chrono::Local::now().date_naive()))
}

fn parse_range(start: Option<&str>, end: Option<&str>) -> Result<Option<(NaiveDate, NaiveDate)>> {
    match (start, end) {
        (None, None) => Ok(None),
        (Some(s), e) => Ok(Some((parse_date(s)?, parse_end(e)?))),
        (None, Some(e)) => Ok(Some((NaiveDate::MIN, parse_date(e)?))),
    }
}

fn default_schema_path(config: &LakeConfig) -> PathBuf {
    config
        .metadata_dir()
        .join("schema")
        .join("fundamentals_schema.json")
}

fn load_schema(path: &Path) -> Result<UnifiedSchema> {
    UnifiedSchema::load(path).with_context(|| format!("loading schema {}", path.display()))
}

fn run_ingest(
    config: &LakeConfig,
    dataset: &str,
    options: &RunOptions,
    api_key: Option<String>,
) -> Result<()> {
    let dataset_config = config.dataset(dataset)?;
    let calendar = config.calendar(dataset)?;

    let fetcher: Arc<dyn SourceFetcher> = match &dataset_config.source {
        SourceKind::Landing { name } => {
            Arc::new(LandingFileFetcher::new(config.landing_dir(), name.clone()))
        }
        SourceKind::Http => {
            let api_key = api_key.or_else(|| std::env::var(&config.http.api_key_env).ok());
            if api_key.is_none() {
                tracing::warn!(env = %config.http.api_key_env, "no API key configured");
            }
            Arc::new(HttpFetcher::new(
                config.http.clone(),
                api_key,
                config.retry.clone(),
                Arc::new(CircuitBreaker::default_api()),
            )?)
        }
    };

    let ingestor = IncrementalIngestor::new(
        fetcher,
        Arc::new(FileWatermarkStore::new(config.metadata_dir())),
        Arc::new(FileLedger::new(config.metadata_dir())),
        config.bronze_dir(),
    )
    .with_policy(dataset_config.policy.clone());

    let summary = ingestor.run(calendar.as_ref(), options, &StdoutProgress, None)?;

    if !summary.all_succeeded() {
        for (key, err) in &summary.errors {
            eprintln!("Error for {key}: {err}");
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run_metadata(config: &LakeConfig, action: MetadataAction) -> Result<()> {
    let ledger = FileLedger::new(config.metadata_dir());
    let watermarks = FileWatermarkStore::new(config.metadata_dir());

    match action {
        MetadataAction::Status {
            layer,
            dataset,
            start,
            end,
            json,
        } => {
            let layers = match layer {
                Some(layer) => vec![layer],
                None => vec![Layer::Bronze, Layer::Silver],
            };
            let range = parse_range(start.as_deref(), end.as_deref())?;
            let status = collect_status(&ledger, &watermarks, &layers, dataset.as_deref(), range)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            if status.is_empty() {
                println!("No ledger entries under {}", config.metadata_dir().display());
                return Ok(());
            }
            println!(
                "{:<8} {:<24} {:>7} {:>7} {:>7} {:>7} {:>8} {:>12}  {}",
                "LAYER", "DATASET", "JOBS", "OK", "FAILED", "SKIPPED", "RATE", "RECORDS", "WATERMARK"
            );
            for s in &status {
                let mark = match s.watermarks.iter().map(|w| w.date).max() {
                    Some(date) if s.watermarks.len() > 1 => {
                        format!("{date} (max of {})", s.watermarks.len())
                    }
                    Some(date) => date.to_string(),
                    None => "-".to_string(),
                };
                println!(
                    "{:<8} {:<24} {:>7} {:>7} {:>7} {:>7} {:>7.1}% {:>12}  {}",
                    s.layer,
                    s.summary.dataset,
                    s.summary.total_jobs,
                    s.summary.success,
                    s.summary.failed,
                    s.summary.skipped,
                    s.summary.success_rate * 100.0,
                    s.summary.total_records,
                    mark
                );
            }
            Ok(())
        }
        MetadataAction::Missing {
            dataset,
            start,
            end,
            layer,
        } => {
            let calendar = config.calendar(&dataset)?;
            let gaps = find_gaps(
                calendar.as_ref(),
                &ledger,
                layer,
                parse_date(&start)?,
                parse_end(end.as_deref())?,
            )?;
            for unit in &gaps {
                println!("{}\t{}", unit.date, unit.key);
            }
            println!("{} missing units", gaps.len());
            Ok(())
        }
        MetadataAction::ExportCsv {
            dataset,
            layer,
            start,
            end,
            status,
            output,
        } => {
            let mut filter = LedgerFilter {
                layer,
                ..LedgerFilter::default()
            };
            if let Some((s, e)) = parse_range(start.as_deref(), end.as_deref())? {
                filter = filter.between(s, e);
            }
            if let Some(status) = status {
                filter = filter.with_status(parse_status(&status)?);
            }
            let rows = match output {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    let rows = export_ledger_csv(&ledger, &dataset, &filter, file)?;
                    eprintln!("Wrote {rows} entries to {}", path.display());
                    rows
                }
                None => export_ledger_csv(&ledger, &dataset, &filter, std::io::stdout().lock())?,
            };
            tracing::debug!(rows, "ledger export complete");
            Ok(())
        }
        MetadataAction::ResetWatermark {
            dataset,
            scope,
            layer,
            confirm,
        } => {
            let current = watermarks.get(&dataset, scope.as_deref(), layer)?;
            let Some(date) = current else {
                println!("No watermark for {layer}/{dataset}");
                return Ok(());
            };
            if !confirm {
                println!("{layer}/{dataset} watermark is {date}; pass --confirm to delete it");
                return Ok(());
            }
            watermarks.reset(&dataset, scope.as_deref(), layer)?;
            println!("Deleted {layer}/{dataset} watermark ({date})");
            Ok(())
        }
    }
}

fn parse_status(s: &str) -> Result<RunStatus> {
    match s.to_ascii_lowercase().as_str() {
        "success" => Ok(RunStatus::Success),
        "failed" => Ok(RunStatus::Failed),
        "skipped" => Ok(RunStatus::Skipped),
        other => bail!("unknown status '{other}' (expected success, failed or skipped)"),
    }
}
