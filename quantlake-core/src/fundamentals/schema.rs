//! Schema discovery over a corpus of statement records.
//!
//! Produces the superset of metric columns per statement type with
//! occurrence counts and observed value types. The scan is a pure fold:
//! [`SchemaAccumulator::merge`] is commutative and associative, so shards
//! can be scanned in parallel and combined in any order with the same result.

use super::record::{RawStatementRecord, StatementKind, NATURAL_KEY_COLUMNS};
use chrono::NaiveDateTime;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::Path;

pub const DEFAULT_COMMON_THRESHOLD: f64 = 0.5;

/// Column statistics within one statement type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub occurrence_count: usize,
    pub occurrence_pct: f64,
    pub dtypes: BTreeSet<String>,
    pub primary_dtype: String,
    pub is_common: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementSchema {
    pub total_columns: usize,
    pub common_columns: usize,
    pub rare_columns: usize,
    pub records_scanned: usize,
    pub records_with_statement: usize,
    pub tickers_scanned: usize,
    /// Sorted by occurrence count descending, then name.
    pub columns: Vec<ColumnSchema>,
}

impl StatementSchema {
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn common_column_names(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.is_common)
            .map(|c| c.name.as_str())
    }
}

/// Discovered schema for every statement type seen in the corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedSchema {
    pub generated_at: Option<NaiveDateTime>,
    pub common_threshold: f64,
    pub records_scanned: usize,
    pub tickers_scanned: usize,
    pub statements: BTreeMap<StatementKind, StatementSchema>,
}

impl UnifiedSchema {
    pub fn statement(&self, kind: StatementKind) -> Option<&StatementSchema> {
        self.statements.get(&kind)
    }

    pub fn total_columns(&self) -> usize {
        self.statements.values().map(|s| s.total_columns).sum()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// `(column, sql type)` for the wide silver table: identity columns,
    /// then prefixed metric columns per statement, then derived columns.
    pub fn silver_columns(&self) -> Vec<(String, &'static str)> {
        let mut out: Vec<(String, &'static str)> = vec![
            (NATURAL_KEY_COLUMNS[0].to_string(), "VARCHAR"),
            (NATURAL_KEY_COLUMNS[1].to_string(), "DATE"),
            (NATURAL_KEY_COLUMNS[2].to_string(), "INTEGER"),
            (NATURAL_KEY_COLUMNS[3].to_string(), "VARCHAR"),
        ];
        for (kind, stmt) in &self.statements {
            for column in &stmt.columns {
                if NATURAL_KEY_COLUMNS.contains(&column.name.as_str()) {
                    continue;
                }
                out.push((format!("{}_{}", kind.prefix(), column.name), "DOUBLE"));
            }
        }
        out.extend(
            super::derive::DERIVED_COLUMNS
                .iter()
                .map(|(name, ty)| (name.to_string(), *ty)),
        );
        out.push(("processed_at".to_string(), "TIMESTAMP"));
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct MetricStats {
    count: usize,
    dtypes: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct StatementStats {
    records_with_statement: usize,
    tickers: BTreeSet<String>,
    metrics: BTreeMap<String, MetricStats>,
}

/// Mergeable occurrence counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaAccumulator {
    records_scanned: usize,
    tickers: BTreeSet<String>,
    statements: BTreeMap<StatementKind, StatementStats>,
}

fn dtype_of(v: &Value) -> Option<&'static str> {
    match v {
        Value::Null => None,
        Value::Bool(_) => Some("Boolean"),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some("Int64"),
        Value::Number(_) => Some("Float64"),
        Value::String(_) => Some("String"),
        Value::Array(_) => Some("List"),
        Value::Object(_) => Some("Struct"),
    }
}

impl SchemaAccumulator {
    pub fn observe(&mut self, record: &RawStatementRecord) {
        self.records_scanned += 1;
        if let Some(t) = &record.ticker {
            self.tickers.insert(t.clone());
        }

        for kind in StatementKind::ALL {
            let Some(statement) = record.statement(kind) else {
                continue;
            };
            let stats = self.statements.entry(kind).or_default();
            stats.records_with_statement += 1;
            if let Some(t) = &record.ticker {
                stats.tickers.insert(t.clone());
            }
            for (name, metric) in statement {
                let entry = stats.metrics.entry(name.clone()).or_default();
                entry.count += 1;
                let leaf = match metric {
                    Value::Object(m) => m.get("value").unwrap_or(&Value::Null),
                    scalar => scalar,
                };
                if let Some(dtype) = dtype_of(leaf) {
                    entry.dtypes.insert(dtype.to_string());
                }
            }
        }
    }

    pub fn merge(mut self, other: Self) -> Self {
        self.records_scanned += other.records_scanned;
        self.tickers.extend(other.tickers);
        for (kind, theirs) in other.statements {
            let ours = self.statements.entry(kind).or_default();
            ours.records_with_statement += theirs.records_with_statement;
            ours.tickers.extend(theirs.tickers);
            for (name, m) in theirs.metrics {
                let entry = ours.metrics.entry(name).or_default();
                entry.count += m.count;
                entry.dtypes.extend(m.dtypes);
            }
        }
        self
    }

    pub fn records_scanned(&self) -> usize {
        self.records_scanned
    }

    pub fn finish(&self, threshold: f64) -> UnifiedSchema {
        let scanned = self.records_scanned;
        let statements = self
            .statements
            .iter()
            .map(|(kind, stats)| {
                // Occurrence is relative to the records that carry this statement.
                let carrying = stats.records_with_statement;
                let mut columns: Vec<ColumnSchema> = stats
                    .metrics
                    .iter()
                    .map(|(name, m)| {
                        let pct = if carrying == 0 {
                            0.0
                        } else {
                            (m.count as f64 / carrying as f64 * 1000.0).round() / 10.0
                        };
                        let primary_dtype = match m.dtypes.len() {
                            0 => "Null".to_string(),
                            1 => m.dtypes.iter().next().cloned().unwrap_or_default(),
                            _ => "Mixed".to_string(),
                        };
                        ColumnSchema {
                            name: name.clone(),
                            occurrence_count: m.count,
                            occurrence_pct: pct,
                            dtypes: m.dtypes.clone(),
                            primary_dtype,
                            is_common: m.count as f64 > threshold * carrying as f64,
                        }
                    })
                    .collect();
                columns.sort_by(|a, b| {
                    b.occurrence_count
                        .cmp(&a.occurrence_count)
                        .then_with(|| a.name.cmp(&b.name))
                });
                let common = columns.iter().filter(|c| c.is_common).count();
                (
                    *kind,
                    StatementSchema {
                        total_columns: columns.len(),
                        common_columns: common,
                        rare_columns: columns.len() - common,
                        records_scanned: scanned,
                        records_with_statement: stats.records_with_statement,
                        tickers_scanned: stats.tickers.len(),
                        columns,
                    },
                )
            })
            .collect();

        UnifiedSchema {
            generated_at: None,
            common_threshold: threshold,
            records_scanned: scanned,
            tickers_scanned: self.tickers.len(),
            statements,
        }
    }
}

/// Parallel schema scan with a configurable common-column threshold.
#[derive(Debug, Clone, Copy)]
pub struct SchemaDiscoverer {
    threshold: f64,
}

impl Default for SchemaDiscoverer {
    fn default() -> Self {
        Self::new(DEFAULT_COMMON_THRESHOLD)
    }
}

impl SchemaDiscoverer {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn scan(&self, records: &[RawStatementRecord]) -> SchemaAccumulator {
        records
            .par_iter()
            .fold(SchemaAccumulator::default, |mut acc, r| {
                acc.observe(r);
                acc
            })
            .reduce(SchemaAccumulator::default, SchemaAccumulator::merge)
    }

    pub fn discover(&self, records: &[RawStatementRecord]) -> UnifiedSchema {
        let schema = self.scan(records).finish(self.threshold);
        tracing::info!(
            records = schema.records_scanned,
            statements = schema.statements.len(),
            columns = schema.total_columns(),
            "schema discovery complete"
        );
        schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(ticker: &str, bs: Value, is: Option<Value>) -> RawStatementRecord {
        let mut financials = json!({ "balance_sheet": bs });
        if let Some(is) = is {
            financials["income_statement"] = is;
        }
        RawStatementRecord::from_value(&json!({
            "ticker": ticker,
            "filing_date": "2024-05-03",
            "fiscal_year": 2024,
            "fiscal_period": "Q1",
            "financials": financials,
        }))
    }

    fn corpus() -> Vec<RawStatementRecord> {
        vec![
            record("AAPL", json!({"assets": {"value": 1.5}, "equity": {"value": 2}}),
                Some(json!({"revenues": {"value": 9.0}}))),
            record("MSFT", json!({"assets": {"value": 3.5}}), None),
            record("NVDA", json!({"assets": {"value": 4.0}, "inventory": {"value": null}}), None),
            record("AMZN", json!({"assets": {"value": 2.0}, "equity": {"value": 1.25}}), None),
        ]
    }

    #[test]
    fn counts_columns_and_types() {
        let schema = SchemaDiscoverer::default().discover(&corpus());
        let bs = schema.statement(StatementKind::BalanceSheet).unwrap();

        assert_eq!(bs.records_scanned, 4);
        let names: Vec<_> = bs.column_names().collect();
        assert_eq!(names, vec!["assets", "equity", "inventory"]);

        let assets = &bs.columns[0];
        assert_eq!(assets.occurrence_count, 4);
        assert_eq!(assets.occurrence_pct, 100.0);
        assert_eq!(assets.primary_dtype, "Float64");
        assert!(assets.is_common);

        let equity = &bs.columns[1];
        assert_eq!(equity.primary_dtype, "Mixed");
        assert_eq!(equity.dtypes.len(), 2);
        // 2 of 4 is not strictly more than half.
        assert!(!equity.is_common);

        let inventory = &bs.columns[2];
        assert_eq!(inventory.primary_dtype, "Null");
        assert_eq!(inventory.occurrence_pct, 25.0);

        let is = schema.statement(StatementKind::IncomeStatement).unwrap();
        assert_eq!(is.records_with_statement, 1);
        assert_eq!(schema.tickers_scanned, 4);
    }

    #[test]
    fn threshold_is_configurable() {
        let schema = SchemaDiscoverer::new(0.25).discover(&corpus());
        let bs = schema.statement(StatementKind::BalanceSheet).unwrap();
        assert_eq!(bs.common_column_names().collect::<Vec<_>>(), vec!["assets", "equity"]);
    }

    #[test]
    fn occurrence_is_relative_to_records_with_the_statement() {
        let bs_only = |t: &str| {
            RawStatementRecord::from_value(&json!({
                "ticker": t,
                "filing_date": "2024-05-03",
                "fiscal_year": 2024,
                "fiscal_period": "Q1",
                "financials": {"balance_sheet": {"assets": {"value": 1.0}}},
            }))
        };
        let is_only = RawStatementRecord::from_value(&json!({
            "ticker": "NVDA",
            "filing_date": "2024-05-03",
            "fiscal_year": 2024,
            "fiscal_period": "Q1",
            "financials": {"income_statement": {"revenues": {"value": 9.0}}},
        }));
        let records = vec![bs_only("AAPL"), bs_only("MSFT"), bs_only("AMZN"), is_only];
        let schema = SchemaDiscoverer::default().discover(&records);

        let is = schema.statement(StatementKind::IncomeStatement).unwrap();
        assert_eq!(is.records_scanned, 4);
        assert_eq!(is.records_with_statement, 1);
        let revenues = &is.columns[0];
        assert_eq!(revenues.occurrence_count, 1);
        assert_eq!(revenues.occurrence_pct, 100.0);
        assert!(revenues.is_common);
        assert_eq!(is.common_columns, 1);
    }

    #[test]
    fn empty_corpus_yields_empty_schema() {
        let schema = SchemaDiscoverer::default().discover(&[]);
        assert_eq!(schema.records_scanned, 0);
        assert!(schema.statements.is_empty());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema/fundamentals_schema.json");
        let schema = SchemaDiscoverer::default().discover(&corpus());
        schema.save(&path).unwrap();
        assert_eq!(UnifiedSchema::load(&path).unwrap(), schema);
    }

    #[test]
    fn silver_columns_prefix_metrics() {
        let schema = SchemaDiscoverer::default().discover(&corpus());
        let cols = schema.silver_columns();
        assert_eq!(cols[0], ("ticker".to_string(), "VARCHAR"));
        assert!(cols.contains(&("bs_assets".to_string(), "DOUBLE")));
        assert!(cols.contains(&("is_revenues".to_string(), "DOUBLE")));
        assert!(cols.iter().any(|(c, _)| c == "ratio_roe"));
    }
}
