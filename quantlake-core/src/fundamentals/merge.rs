//! Full outer join of flattened statement tables on the natural key.

use super::record::NATURAL_KEY_COLUMNS;
use polars::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("no non-empty statement table to merge")]
    NoData,

    #[error("input table {index} lacks key column '{column}'")]
    MissingKey { index: usize, column: String },

    #[error("merge failed: {0}")]
    Polars(#[from] PolarsError),
}

/// Join every non-empty table on the natural key. A key present in any input
/// produces exactly one output row; columns of inputs lacking it are null.
pub fn merge_statements(tables: Vec<DataFrame>) -> Result<DataFrame, MergeError> {
    let mut inputs = Vec::with_capacity(tables.len());
    for (index, df) in tables.into_iter().enumerate() {
        if df.height() == 0 {
            continue;
        }
        for key in NATURAL_KEY_COLUMNS {
            if df.column(key).is_err() {
                return Err(MergeError::MissingKey {
                    index,
                    column: key.to_string(),
                });
            }
        }
        inputs.push(df);
    }

    let mut inputs = inputs.into_iter();
    let first = inputs.next().ok_or(MergeError::NoData)?;
    let keys: Vec<Expr> = NATURAL_KEY_COLUMNS.iter().map(|k| col(*k)).collect();

    let merged = inputs.fold(first.lazy(), |acc, df| {
        acc.join(
            df.lazy(),
            keys.clone(),
            keys.clone(),
            JoinArgs::new(JoinType::Full).with_coalesce(JoinCoalesce::CoalesceColumns),
        )
    });

    merged
        .sort(
            NATURAL_KEY_COLUMNS,
            SortMultipleOptions::default().with_maintain_order(true),
        )
        .collect()
        .map_err(MergeError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(prefix: &str, periods: &[&str]) -> DataFrame {
        let n = periods.len();
        df!(
            "ticker" => vec!["AAPL"; n],
            "filing_date" => periods.iter().map(|p| format!("2024-0{p}-01")).collect::<Vec<_>>(),
            "fiscal_year" => vec![2024i32; n],
            "fiscal_period" => periods.iter().map(|p| format!("Q{p}")).collect::<Vec<_>>(),
            format!("{prefix}_x").as_str() => vec![1.0f64; n],
        )
        .unwrap()
    }

    #[test]
    fn outer_join_keeps_every_key_once() {
        let merged = merge_statements(vec![
            table("bs", &["1", "2"]),
            table("is", &["2", "3"]),
            table("cf", &["1", "3"]),
        ])
        .unwrap();

        assert_eq!(merged.height(), 3);
        let periods: Vec<_> = merged
            .column("fiscal_period")
            .unwrap()
            .str()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(periods, vec!["Q1", "Q2", "Q3"]);

        let bs = merged.column("bs_x").unwrap();
        let is = merged.column("is_x").unwrap();
        let cf = merged.column("cf_x").unwrap();
        assert_eq!(bs.null_count(), 1);
        assert_eq!(is.null_count(), 1);
        assert_eq!(cf.null_count(), 1);
        assert!(merged.column("ticker").unwrap().null_count() == 0);
    }

    #[test]
    fn empty_inputs_are_ignored() {
        let merged = merge_statements(vec![
            table("bs", &[]),
            table("is", &["1"]),
        ])
        .unwrap();
        assert_eq!(merged.height(), 1);
        assert!(merged.column("bs_x").is_err());
    }

    #[test]
    fn no_data_is_an_error() {
        assert!(matches!(merge_statements(vec![]), Err(MergeError::NoData)));
        assert!(matches!(
            merge_statements(vec![table("bs", &[])]),
            Err(MergeError::NoData)
        ));
    }
}
