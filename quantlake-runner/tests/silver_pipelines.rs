use chrono::{NaiveDate, NaiveDateTime};
use quantlake_core::bronze::records_to_dataframe;
use quantlake_core::corporate_actions::EventType;
use quantlake_core::metadata::{FileLedger, Layer, LedgerFilter, RunLedger, RunStatus};
use quantlake_core::storage::{find_parquet_files, read_parquet, write_parquet_atomic, ParquetOptions};
use quantlake_runner::pipeline::{discover_schema, save_schema, ticker_filter};
use quantlake_runner::{CorporateActionsPipeline, FundamentalsPipeline, PipelineError};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

fn processed_at() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 1)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
}

fn write_bronze(root: &Path, relative: &str, records: &[Value]) {
    let mut df = records_to_dataframe(records).unwrap();
    let path = root.join(relative).join("data.parquet");
    write_parquet_atomic(&mut df, &path, &ParquetOptions::default()).unwrap();
}

fn seed_fundamentals(bronze: &Path) {
    // The AAPL partition omits the ticker field; it comes from the path.
    write_bronze(
        bronze,
        "fundamentals/ticker=AAPL/year=2024",
        &[json!({
            "filing_date": "2024-05-03",
            "fiscal_year": 2024,
            "fiscal_period": "Q1",
            "financials": {
                "balance_sheet": {"assets": {"value": 352_583.0}, "equity": {"value": 62_146.0}},
                "income_statement": {"revenues": {"value": 119_575.0}, "net_income_loss": {"value": 33_916.0}},
                "cash_flow_statement": {"net_cash_flow": {"value": -1_200.0}}
            }
        })],
    );
    write_bronze(
        bronze,
        "fundamentals/ticker=MSFT/year=2024",
        &[json!({
            "ticker": "MSFT",
            "filing_date": "2024-04-25",
            "fiscal_year": 2024,
            "fiscal_period": "Q3",
            "financials": {"income_statement": {"revenues": {"value": 61_858.0}}}
        })],
    );
}

#[test]
fn fundamentals_pipeline_builds_partitioned_wide_table() {
    let dir = tempfile::tempdir().unwrap();
    let bronze = dir.path().join("bronze");
    let silver = dir.path().join("silver");
    let ledger = Arc::new(FileLedger::new(dir.path().join("metadata")));
    seed_fundamentals(&bronze);

    let pipeline = FundamentalsPipeline::new(&bronze, &silver, ledger.clone())
        .with_processed_at(processed_at());
    let report = pipeline.run().unwrap();

    assert_eq!(report.records, 2);
    assert_eq!(report.rows, 2);
    assert_eq!(report.partitions, 2);

    let files = find_parquet_files(&pipeline.table_root()).unwrap();
    assert_eq!(files.len(), 2);
    let q1 = files
        .iter()
        .find(|p| p.to_string_lossy().contains("fiscal_period=Q1"))
        .unwrap();
    let df = read_parquet(q1).unwrap();
    assert_eq!(df.height(), 1);
    let ticker = df.column("ticker").unwrap().str().unwrap().get(0);
    assert_eq!(ticker, Some("AAPL"));
    let assets = df.column("bs_assets").unwrap().f64().unwrap().get(0);
    assert_eq!(assets, Some(352_583.0));
    let roe = df.column("ratio_roe").unwrap().f64().unwrap().get(0).unwrap();
    assert!((roe - 33_916.0 / 62_146.0).abs() < 1e-9);

    let entries = ledger
        .list("fundamentals_wide", &LedgerFilter::layer(Layer::Silver))
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.status == RunStatus::Success));
    assert!(entries.iter().all(|e| e.date == processed_at().date()));
}

#[test]
fn ticker_filter_limits_fundamentals_input() {
    let dir = tempfile::tempdir().unwrap();
    let bronze = dir.path().join("bronze");
    seed_fundamentals(&bronze);
    let ledger = Arc::new(FileLedger::new(dir.path().join("metadata")));

    let report = FundamentalsPipeline::new(&bronze, dir.path().join("silver"), ledger)
        .with_tickers(ticker_filter(&["msft"]))
        .with_processed_at(processed_at())
        .run()
        .unwrap();
    assert_eq!(report.records, 1);
    assert_eq!(report.rows, 1);
}

#[test]
fn saved_schema_adds_columns_missing_from_batch() {
    let dir = tempfile::tempdir().unwrap();
    let bronze = dir.path().join("bronze");
    seed_fundamentals(&bronze);

    let schema = discover_schema(&bronze, "fundamentals", &None, 0.5).unwrap();
    assert!(schema.generated_at.is_some());
    let schema_path = dir.path().join("metadata/schema/fundamentals_schema.json");
    save_schema(&schema, &schema_path).unwrap();
    assert!(schema_path.exists());

    let ledger = Arc::new(FileLedger::new(dir.path().join("metadata")));
    let pipeline = FundamentalsPipeline::new(&bronze, dir.path().join("silver"), ledger)
        .with_schema(schema)
        .with_tickers(ticker_filter(&["MSFT"]))
        .with_processed_at(processed_at());
    pipeline.run().unwrap();

    let files = find_parquet_files(&pipeline.table_root()).unwrap();
    let df = read_parquet(&files[0]).unwrap();
    // Only AAPL reported a balance sheet, but the schema keeps the column.
    assert!(df.column("bs_assets").unwrap().f64().unwrap().get(0).is_none());
}

#[test]
fn empty_bronze_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(FileLedger::new(dir.path().join("metadata")));
    let result = FundamentalsPipeline::new(dir.path().join("bronze"), dir.path().join("silver"), ledger)
        .run();
    assert!(matches!(result, Err(PipelineError::NoInput(_))));
}

#[test]
fn corporate_actions_are_unified_per_ticker_and_type() {
    let dir = tempfile::tempdir().unwrap();
    let bronze = dir.path().join("bronze");
    write_bronze(
        &bronze,
        "dividends/ticker=AAPL",
        &[
            json!({"ticker": "AAPL", "ex_dividend_date": "2024-02-09", "cash_amount": 0.24, "frequency": 4, "pay_date": "2024-02-15"}),
            json!({"ticker": "AAPL", "ex_dividend_date": "2023-11-10", "cash_amount": 0.24, "frequency": 4, "pay_date": "2023-11-16"}),
            json!({"ticker": "AAPL", "cash_amount": 0.23, "frequency": 4}),
        ],
    );
    write_bronze(
        &bronze,
        "splits",
        &[json!({"ticker": "aapl", "execution_date": "2020-08-31", "split_from": 1.0, "split_to": 4.0})],
    );
    write_bronze(
        &bronze,
        "ticker_events/ticker=META",
        &[json!({"date": "2022-06-09", "new_ticker": "META", "ticker": null})],
    );

    let ledger = Arc::new(FileLedger::new(dir.path().join("metadata")));
    let pipeline = CorporateActionsPipeline::new(&bronze, dir.path().join("silver"), ledger.clone())
        .with_processed_at(processed_at());
    let report = pipeline.run().unwrap();

    assert_eq!(report.events[&EventType::Dividend], 2);
    assert_eq!(report.events[&EventType::Split], 1);
    assert_eq!(report.events[&EventType::Ipo], 0);
    assert_eq!(report.events[&EventType::TickerChange], 1);
    assert_eq!(report.total_events(), 4);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.tickers, 2);
    // AAPL dividend, AAPL split, META ticker change
    assert_eq!(report.partitions, 3);

    let files = find_parquet_files(&pipeline.table_root()).unwrap();
    assert_eq!(files.len(), 3);
    let split_file = files
        .iter()
        .find(|p| p.to_string_lossy().contains("event_type=split"))
        .unwrap();
    let splits = read_parquet(split_file).unwrap();
    assert_eq!(splits.column("ticker").unwrap().str().unwrap().get(0), Some("AAPL"));
    assert_eq!(splits.column("split_ratio").unwrap().f64().unwrap().get(0), Some(4.0));

    let silver = ledger
        .list("corporate_actions", &LedgerFilter::layer(Layer::Silver))
        .unwrap();
    assert_eq!(silver.len(), 3);
}

#[test]
fn corporate_actions_respect_ticker_filter() {
    let dir = tempfile::tempdir().unwrap();
    let bronze = dir.path().join("bronze");
    write_bronze(
        &bronze,
        "splits",
        &[
            json!({"ticker": "AAPL", "execution_date": "2020-08-31", "split_from": 1, "split_to": 4}),
            json!({"ticker": "NVDA", "execution_date": "2024-06-10", "split_from": 1, "split_to": 10}),
        ],
    );
    let ledger = Arc::new(FileLedger::new(dir.path().join("metadata")));
    let report = CorporateActionsPipeline::new(&bronze, dir.path().join("silver"), ledger)
        .with_tickers(ticker_filter(&["nvda"]))
        .with_processed_at(processed_at())
        .run()
        .unwrap();
    assert_eq!(report.total_events(), 1);
    assert_eq!(report.tickers, 1);
}
