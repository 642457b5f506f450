//! Nested statement records → one dense row per natural key.
//!
//! Output columns are the unprefixed natural key followed by
//! `{prefix}_{metric}` Float64 columns taken from each metric's `value`.
//! A record whose statement container is missing still yields a key-only
//! row; a record without a complete natural key is skipped. Both are counted
//! in [`FlattenStats`], neither fails the batch.
//!
//! When several records share a natural key, the last record carrying the
//! statement wins. Records without it never blank out a row another record
//! already populated, so statements delivered as separate records (one per
//! statement type) still meet in a single row.

use super::record::{NaturalKey, RawStatementRecord, StatementKind};
use super::schema::StatementSchema;
use polars::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

/// Record-level shape problems. Logged and counted, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("record has no financials object")]
    MissingFinancials,

    #[error("financials has no '{0}' object")]
    MissingStatement(StatementKind),
}

#[derive(Debug, Error)]
#[error("flatten {kind}: {source}")]
pub struct FlattenError {
    kind: StatementKind,
    #[source]
    source: PolarsError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlattenStats {
    pub records_in: usize,
    pub rows_out: usize,
    pub skipped_incomplete_key: usize,
    pub schema_errors: usize,
    pub duplicates_replaced: usize,
    pub non_numeric_values: usize,
}

impl FlattenStats {
    pub fn absorb(&mut self, other: &FlattenStats) {
        self.records_in += other.records_in;
        self.rows_out += other.rows_out;
        self.skipped_incomplete_key += other.skipped_incomplete_key;
        self.schema_errors += other.schema_errors;
        self.duplicates_replaced += other.duplicates_replaced;
        self.non_numeric_values += other.non_numeric_values;
    }
}

#[derive(Debug)]
pub struct FlatTable {
    pub frame: DataFrame,
    pub stats: FlattenStats,
}

pub struct Flattener<'a> {
    kind: StatementKind,
    schema: Option<&'a StatementSchema>,
}

impl<'a> Flattener<'a> {
    pub fn new(kind: StatementKind) -> Self {
        Self { kind, schema: None }
    }

    /// Always emit the schema's columns, even when no record carries them.
    pub fn with_schema(mut self, schema: &'a StatementSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    fn column_name(&self, metric: &str) -> String {
        format!("{}_{metric}", self.kind.prefix())
    }

    fn statement<'r>(
        &self,
        record: &'r RawStatementRecord,
    ) -> Result<&'r Map<String, Value>, SchemaError> {
        if !record.financials.as_ref().is_some_and(Value::is_object) {
            return Err(SchemaError::MissingFinancials);
        }
        record
            .statement(self.kind)
            .ok_or(SchemaError::MissingStatement(self.kind))
    }

    pub fn flatten(&self, records: &[RawStatementRecord]) -> Result<FlatTable, FlattenError> {
        let mut stats = FlattenStats {
            records_in: records.len(),
            ..FlattenStats::default()
        };

        let mut rows: Vec<(NaturalKey, BTreeMap<String, Option<f64>>)> = Vec::new();
        // Row position and whether a record with the statement filled it.
        let mut index: HashMap<NaturalKey, (usize, bool)> = HashMap::new();
        let mut seen_metrics: BTreeSet<String> = BTreeSet::new();

        for record in records {
            let Some(key) = record.natural_key() else {
                stats.skipped_incomplete_key += 1;
                continue;
            };

            let mut values = BTreeMap::new();
            let carried = match self.statement(record) {
                Ok(statement) => {
                    for (metric, node) in statement {
                        let leaf = match node {
                            Value::Object(m) => m.get("value").unwrap_or(&Value::Null),
                            scalar => scalar,
                        };
                        let value = match leaf {
                            Value::Null => None,
                            Value::Number(n) => n.as_f64(),
                            Value::String(s) => {
                                let parsed = s.trim().parse::<f64>().ok();
                                if parsed.is_none() {
                                    stats.non_numeric_values += 1;
                                }
                                parsed
                            }
                            _ => {
                                stats.non_numeric_values += 1;
                                None
                            }
                        };
                        seen_metrics.insert(metric.clone());
                        values.insert(metric.clone(), value.filter(|v| v.is_finite()));
                    }
                    true
                }
                Err(e) => {
                    stats.schema_errors += 1;
                    tracing::debug!(key = %key, error = %e, "statement missing");
                    false
                }
            };

            match index.get_mut(&key) {
                Some((i, populated)) => {
                    if !carried {
                        continue;
                    }
                    if *populated {
                        stats.duplicates_replaced += 1;
                    }
                    *populated = true;
                    rows[*i] = (key, values);
                }
                None => {
                    index.insert(key.clone(), (rows.len(), carried));
                    rows.push((key, values));
                }
            }
        }

        rows.sort_by(|a, b| a.0.cmp(&b.0));

        let mut metrics: Vec<String> = Vec::new();
        if let Some(schema) = self.schema {
            metrics.extend(schema.column_names().map(str::to_string));
        }
        let known: BTreeSet<String> = metrics.iter().cloned().collect();
        metrics.extend(seen_metrics.into_iter().filter(|m| !known.contains(m)));

        let frame = self
            .build_frame(&rows, &metrics)
            .map_err(|source| FlattenError {
                kind: self.kind,
                source,
            })?;
        stats.rows_out = frame.height();

        tracing::info!(
            statement = %self.kind,
            rows = stats.rows_out,
            columns = metrics.len(),
            skipped = stats.skipped_incomplete_key,
            schema_errors = stats.schema_errors,
            "flattened statements"
        );
        Ok(FlatTable { frame, stats })
    }

    fn build_frame(
        &self,
        rows: &[(NaturalKey, BTreeMap<String, Option<f64>>)],
        metrics: &[String],
    ) -> PolarsResult<DataFrame> {
        let mut columns = Vec::with_capacity(4 + metrics.len());
        columns.push(Column::new(
            "ticker".into(),
            rows.iter().map(|(k, _)| k.ticker.as_str()).collect::<Vec<_>>(),
        ));
        columns.push(Column::new(
            "filing_date".into(),
            rows.iter().map(|(k, _)| k.filing_date.as_str()).collect::<Vec<_>>(),
        ));
        columns.push(Column::new(
            "fiscal_year".into(),
            rows.iter().map(|(k, _)| k.fiscal_year).collect::<Vec<i32>>(),
        ));
        columns.push(Column::new(
            "fiscal_period".into(),
            rows.iter().map(|(k, _)| k.fiscal_period.as_str()).collect::<Vec<_>>(),
        ));

        for metric in metrics {
            let values: Vec<Option<f64>> = rows
                .iter()
                .map(|(_, v)| v.get(metric).copied().flatten())
                .collect();
            columns.push(Column::new(self.column_name(metric).into(), values));
        }
        DataFrame::new(columns)
    }
}
