//! Raw financial statement records as delivered by the API.
//!
//! ```json
//! {"tickers": ["AAPL"], "filing_date": "2024-05-03", "fiscal_year": "2024",
//!  "fiscal_period": "Q1",
//!  "financials": {"balance_sheet": {"assets": {"value": 3.3e11, "unit": "USD"}}}}
//! ```
//!
//! Field shapes vary between records (ticker vs tickers list, numeric vs
//! string year, nested objects stored as JSON text in bronze), so parsing is
//! lenient and never fails; missing pieces simply stay `None`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Identity columns shared by every flattened statement table.
pub const NATURAL_KEY_COLUMNS: [&str; 4] = ["ticker", "filing_date", "fiscal_year", "fiscal_period"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    BalanceSheet,
    IncomeStatement,
    CashFlowStatement,
    ComprehensiveIncome,
}

impl StatementKind {
    pub const ALL: [StatementKind; 4] = [
        StatementKind::BalanceSheet,
        StatementKind::IncomeStatement,
        StatementKind::CashFlowStatement,
        StatementKind::ComprehensiveIncome,
    ];

    /// Column prefix in the wide table.
    pub fn prefix(&self) -> &'static str {
        match self {
            StatementKind::BalanceSheet => "bs",
            StatementKind::IncomeStatement => "is",
            StatementKind::CashFlowStatement => "cf",
            StatementKind::ComprehensiveIncome => "ci",
        }
    }

    /// Key of the statement object inside `financials`.
    pub fn container(&self) -> &'static str {
        match self {
            StatementKind::BalanceSheet => "balance_sheet",
            StatementKind::IncomeStatement => "income_statement",
            StatementKind::CashFlowStatement => "cash_flow_statement",
            StatementKind::ComprehensiveIncome => "comprehensive_income",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.container())
    }
}

impl FromStr for StatementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bs" | "balance_sheet" | "balance_sheets" => Ok(StatementKind::BalanceSheet),
            "is" | "income_statement" | "income_statements" => Ok(StatementKind::IncomeStatement),
            "cf" | "cash_flow" | "cash_flow_statement" | "cash_flow_statements" => {
                Ok(StatementKind::CashFlowStatement)
            }
            "ci" | "comprehensive_income" => Ok(StatementKind::ComprehensiveIncome),
            other => Err(format!("unknown statement type '{other}'")),
        }
    }
}

/// `(ticker, filing_date, fiscal_year, fiscal_period)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub ticker: String,
    pub filing_date: String,
    pub fiscal_year: i32,
    pub fiscal_period: String,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.ticker, self.filing_date, self.fiscal_year, self.fiscal_period
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawStatementRecord {
    pub ticker: Option<String>,
    pub filing_date: Option<String>,
    pub fiscal_year: Option<i32>,
    pub fiscal_period: Option<String>,
    pub financials: Option<Value>,
}

impl RawStatementRecord {
    /// Parse one API or bronze record.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };
        Self::from_map(obj)
    }

    pub fn from_map(obj: &Map<String, Value>) -> Self {
        Self {
            ticker: ticker_of(obj),
            filing_date: non_empty_str(obj.get("filing_date")),
            fiscal_year: obj.get("fiscal_year").and_then(lenient_year),
            fiscal_period: non_empty_str(obj.get("fiscal_period")),
            financials: obj.get("financials").and_then(decode_nested),
        }
    }

    /// Fill a missing ticker, e.g. from the bronze partition the record came from.
    pub fn with_default_ticker(mut self, ticker: &str) -> Self {
        if self.ticker.is_none() {
            self.ticker = Some(ticker.to_string());
        }
        self
    }

    /// Complete natural key, if every part is present.
    pub fn natural_key(&self) -> Option<NaturalKey> {
        Some(NaturalKey {
            ticker: self.ticker.clone()?,
            filing_date: self.filing_date.clone()?,
            fiscal_year: self.fiscal_year?,
            fiscal_period: self.fiscal_period.clone()?,
        })
    }

    /// The statement object for `kind`, if `financials` holds one.
    pub fn statement(&self, kind: StatementKind) -> Option<&Map<String, Value>> {
        self.financials
            .as_ref()?
            .as_object()?
            .get(kind.container())?
            .as_object()
    }
}

fn non_empty_str(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn ticker_of(obj: &Map<String, Value>) -> Option<String> {
    if let Some(t) = non_empty_str(obj.get("ticker")) {
        return Some(t.to_uppercase());
    }
    let tickers = obj.get("tickers").and_then(decode_nested)?;
    tickers
        .as_array()?
        .iter()
        .find_map(|t| non_empty_str(Some(t)))
        .map(|t| t.to_uppercase())
}

fn lenient_year(v: &Value) -> Option<i32> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .and_then(|y| i32::try_from(y).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Nested values arrive either as JSON or as JSON text (bronze storage).
fn decode_nested(v: &Value) -> Option<Value> {
    match v {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                serde_json::from_str(s).ok()
            } else {
                None
            }
        }
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn statement_aliases_parse() {
        for s in ["bs", "balance_sheet", "balance_sheets", "BS"] {
            assert_eq!(s.parse::<StatementKind>().unwrap(), StatementKind::BalanceSheet);
        }
        assert_eq!(
            "cash_flow".parse::<StatementKind>().unwrap(),
            StatementKind::CashFlowStatement
        );
        assert_eq!("ci".parse::<StatementKind>().unwrap().prefix(), "ci");
        assert!("ratios".parse::<StatementKind>().is_err());
    }

    #[test]
    fn parses_api_shape() {
        let r = RawStatementRecord::from_value(&json!({
            "tickers": ["aapl"],
            "filing_date": "2024-05-03",
            "fiscal_year": "2024",
            "fiscal_period": "Q1",
            "financials": {"balance_sheet": {"assets": {"value": 1.0}}}
        }));
        let key = r.natural_key().unwrap();
        assert_eq!(key.ticker, "AAPL");
        assert_eq!(key.fiscal_year, 2024);
        assert!(r.statement(StatementKind::BalanceSheet).is_some());
        assert!(r.statement(StatementKind::IncomeStatement).is_none());
    }

    #[test]
    fn parses_bronze_json_text() {
        let r = RawStatementRecord::from_value(&json!({
            "tickers": "[\"MSFT\"]",
            "filing_date": "2023-10-24",
            "fiscal_year": 2024,
            "fiscal_period": "Q1",
            "financials": "{\"income_statement\": {\"revenues\": {\"value\": 5.6e10}}}"
        }));
        assert_eq!(r.ticker.as_deref(), Some("MSFT"));
        let is = r.statement(StatementKind::IncomeStatement).unwrap();
        assert_eq!(is["revenues"]["value"], json!(5.6e10));
    }

    #[test]
    fn incomplete_key_is_none() {
        let r = RawStatementRecord::from_value(&json!({
            "ticker": "AAPL", "filing_date": "", "fiscal_year": 2024, "fiscal_period": "Q1"
        }));
        assert!(r.natural_key().is_none());
        assert!(RawStatementRecord::from_value(&json!("nope")).natural_key().is_none());
    }

    #[test]
    fn default_ticker_only_fills_gaps() {
        let r = RawStatementRecord::from_value(&json!({"ticker": "AAPL"}));
        assert_eq!(r.with_default_ticker("MSFT").ticker.as_deref(), Some("AAPL"));
        let r = RawStatementRecord::default().with_default_ticker("MSFT");
        assert_eq!(r.ticker.as_deref(), Some("MSFT"));
    }
}
