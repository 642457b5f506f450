//! Derived metrics on the wide fundamentals table.
//!
//! Ratio and growth columns are always emitted. A ratio is null when an
//! operand column is absent, an operand is null, or the denominator is
//! exactly zero, so no NaN or infinity reaches the table.

use polars::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("derived metrics: {0}")]
pub struct DeriveError(#[from] PolarsError);

/// Derived columns and their SQL types, in output order.
pub const DERIVED_COLUMNS: &[(&str, &str)] = &[
    ("ratio_roe", "DOUBLE"),
    ("ratio_roa", "DOUBLE"),
    ("ratio_profit_margin", "DOUBLE"),
    ("ratio_operating_margin", "DOUBLE"),
    ("ratio_current", "DOUBLE"),
    ("ratio_quick", "DOUBLE"),
    ("ratio_debt_to_equity", "DOUBLE"),
    ("ratio_debt_to_assets", "DOUBLE"),
    ("growth_revenue_yoy", "DOUBLE"),
    ("growth_revenue_qoq", "DOUBLE"),
    ("growth_net_income_yoy", "DOUBLE"),
    ("growth_assets_yoy", "DOUBLE"),
    ("quality_piotroski_f_score", "INTEGER"),
    ("quality_f_score_max", "INTEGER"),
    ("has_complete_data", "BOOLEAN"),
];

const NET_INCOME: &str = "is_net_income_loss";
const OPERATING_INCOME: &str = "is_operating_income_loss";
const REVENUES: &str = "is_revenues";
const ASSETS: &str = "bs_assets";
const LIABILITIES: &str = "bs_liabilities";
const EQUITY: &str = "bs_equity";
const CURRENT_ASSETS: &str = "bs_current_assets";
const CURRENT_LIABILITIES: &str = "bs_current_liabilities";
const INVENTORY: &str = "bs_inventory";
const OPERATING_CASH_FLOW: &str = "cf_net_cash_flow_from_operating_activities";

const COMPLETENESS_FIELDS: [&str; 5] = [REVENUES, NET_INCOME, ASSETS, LIABILITIES, EQUITY];

/// Columns a calculation can read from.
struct Inputs {
    present: Vec<String>,
    populated: Vec<String>,
}

impl Inputs {
    fn of(df: &DataFrame) -> Self {
        let mut present = Vec::new();
        let mut populated = Vec::new();
        for c in df.get_columns() {
            let name = c.name().to_string();
            if c.null_count() < c.len() {
                populated.push(name.clone());
            }
            present.push(name);
        }
        Self { present, populated }
    }

    fn has(&self, name: &str) -> bool {
        self.present.iter().any(|c| c == name)
    }

    /// Column exists and carries at least one value.
    fn observed(&self, names: &[&str]) -> bool {
        names.iter().all(|n| self.populated.iter().any(|c| c == n))
    }

    /// `col(name)` as Float64, or a typed null when the column is absent.
    fn operand(&self, name: &str) -> Expr {
        if self.has(name) {
            col(name).cast(DataType::Float64)
        } else {
            null_f64()
        }
    }
}

fn null_f64() -> Expr {
    lit(NULL).cast(DataType::Float64)
}

/// `num / den`, null when `den` is zero (nulls propagate).
fn safe_div(num: Expr, den: Expr) -> Expr {
    when(den.clone().eq(lit(0.0)))
        .then(null_f64())
        .otherwise(num / den)
}

fn lag(name: &str, periods: i64) -> Expr {
    col(name).shift(lit(periods)).over([col("ticker")])
}

/// `(x - x[-n]) / x[-n]` within each ticker; `abs_base` uses `|x[-n]|`.
fn growth(inputs: &Inputs, name: &str, periods: i64, abs_base: bool) -> Expr {
    if !inputs.has(name) {
        return null_f64();
    }
    let current = col(name).cast(DataType::Float64);
    let prior = lag(name, periods).cast(DataType::Float64);
    let base = if abs_base { prior.clone().abs() } else { prior.clone() };
    safe_div(current - prior, base)
}

fn ratio_exprs(inputs: &Inputs) -> Vec<Expr> {
    let op = |n: &str| inputs.operand(n);
    vec![
        safe_div(op(NET_INCOME), op(EQUITY)).alias("ratio_roe"),
        safe_div(op(NET_INCOME), op(ASSETS)).alias("ratio_roa"),
        safe_div(op(NET_INCOME), op(REVENUES)).alias("ratio_profit_margin"),
        safe_div(op(OPERATING_INCOME), op(REVENUES)).alias("ratio_operating_margin"),
        safe_div(op(CURRENT_ASSETS), op(CURRENT_LIABILITIES)).alias("ratio_current"),
        safe_div(op(CURRENT_ASSETS) - op(INVENTORY), op(CURRENT_LIABILITIES)).alias("ratio_quick"),
        safe_div(op(LIABILITIES), op(EQUITY)).alias("ratio_debt_to_equity"),
        safe_div(op(LIABILITIES), op(ASSETS)).alias("ratio_debt_to_assets"),
    ]
}

fn growth_exprs(inputs: &Inputs) -> Vec<Expr> {
    vec![
        growth(inputs, REVENUES, 4, false).alias("growth_revenue_yoy"),
        growth(inputs, REVENUES, 1, false).alias("growth_revenue_qoq"),
        growth(inputs, NET_INCOME, 4, true).alias("growth_net_income_yoy"),
        growth(inputs, ASSETS, 4, false).alias("growth_assets_yoy"),
    ]
}

/// Piotroski-style components available for this corpus, as 0/1 Int32.
fn quality_components(inputs: &Inputs) -> Vec<Expr> {
    let flag = |cond: Expr| cond.fill_null(lit(false)).cast(DataType::Int32);
    let improved = |ratio: &str, higher_is_better: bool| {
        let prior = lag(ratio, 1);
        if higher_is_better {
            col(ratio).gt(prior)
        } else {
            col(ratio).lt(prior)
        }
    };

    let mut components = Vec::new();
    if inputs.observed(&[NET_INCOME]) {
        components.push(flag(col(NET_INCOME).gt(lit(0.0))));
    }
    if inputs.observed(&[OPERATING_CASH_FLOW]) {
        components.push(flag(col(OPERATING_CASH_FLOW).gt(lit(0.0))));
    }
    if inputs.observed(&[NET_INCOME, ASSETS]) {
        components.push(flag(improved("ratio_roa", true)));
    }
    if inputs.observed(&[LIABILITIES, ASSETS]) {
        components.push(flag(improved("ratio_debt_to_assets", false)));
    }
    if inputs.observed(&[CURRENT_ASSETS, CURRENT_LIABILITIES]) {
        components.push(flag(improved("ratio_current", true)));
    }
    components
}

fn completeness_expr(inputs: &Inputs) -> Expr {
    COMPLETENESS_FIELDS
        .iter()
        .filter(|f| inputs.has(f))
        .map(|f| col(*f).is_not_null())
        .reduce(|a, b| a.and(b))
        .unwrap_or_else(|| lit(false))
}

/// Add ratio, growth and quality columns. Rows come back sorted by
/// (ticker, filing_date, fiscal_year, fiscal_period).
pub fn derive_metrics(df: DataFrame) -> Result<DataFrame, DeriveError> {
    let inputs = Inputs::of(&df);
    let components = quality_components(&inputs);
    let max_score = components.len() as i32;
    let score = components
        .into_iter()
        .reduce(|a, b| a + b)
        .unwrap_or_else(|| lit(NULL).cast(DataType::Int32));

    let out = df
        .lazy()
        .sort(
            ["ticker", "filing_date", "fiscal_year", "fiscal_period"],
            SortMultipleOptions::default().with_maintain_order(true),
        )
        .with_columns(ratio_exprs(&inputs))
        .with_columns(growth_exprs(&inputs))
        .with_columns([
            score.cast(DataType::Int32).alias("quality_piotroski_f_score"),
            lit(max_score).alias("quality_f_score_max"),
            completeness_expr(&inputs).alias("has_complete_data"),
        ])
        .collect()?;

    tracing::debug!(rows = out.height(), quality_components = max_score, "derived metrics");
    Ok(out)
}
