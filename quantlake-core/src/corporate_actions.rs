//! Corporate actions silver table.
//!
//! Dividends, splits, IPOs and ticker changes arrive as four separate bronze
//! datasets with their own field names. They are normalized into one event
//! row type with an `event_type`, an `event_date` and type-specific columns
//! prefixed `div_`, `split_` and `ipo_`. Columns that do not apply to an
//! event type are null.
//!
//! ```text
//! silver/corporate_actions/ticker=AAPL/event_type=dividend/data.parquet
//! ```

use crate::storage::{PartitionLayout, SortColumn};
use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Dividend,
    Split,
    Ipo,
    TickerChange,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::Dividend,
        EventType::Split,
        EventType::Ipo,
        EventType::TickerChange,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Dividend => "dividend",
            EventType::Split => "split",
            EventType::Ipo => "ipo",
            EventType::TickerChange => "ticker_change",
        }
    }

    /// Bronze dataset holding raw events of this type.
    pub fn bronze_dataset(self) -> &'static str {
        match self {
            EventType::Dividend => "dividends",
            EventType::Split => "splits",
            EventType::Ipo => "ipos",
            EventType::TickerChange => "ticker_events",
        }
    }

    /// Raw field carrying the event date.
    fn date_field(self) -> &'static str {
        match self {
            EventType::Dividend => "ex_dividend_date",
            EventType::Split => "execution_date",
            EventType::Ipo => "listing_date",
            EventType::TickerChange => "date",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dividend" | "dividends" => Ok(EventType::Dividend),
            "split" | "splits" => Ok(EventType::Split),
            "ipo" | "ipos" => Ok(EventType::Ipo),
            "ticker_change" | "ticker_events" => Ok(EventType::TickerChange),
            other => Err(format!("unknown event type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("{event_type} record {index} has no ticker")]
    MissingTicker { event_type: EventType, index: usize },

    #[error("{event_type} record {index} has no valid '{field}'")]
    MissingDate {
        event_type: EventType,
        index: usize,
        field: &'static str,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DividendFields {
    pub cash_amount: Option<f64>,
    pub currency: Option<String>,
    pub declaration_date: Option<NaiveDate>,
    pub dividend_type: Option<String>,
    pub frequency: Option<i64>,
    pub pay_date: Option<NaiveDate>,
    pub record_date: Option<NaiveDate>,
}

impl DividendFields {
    /// Cash amount scaled by payments per year; null for irregular payers.
    pub fn annualized_amount(&self) -> Option<f64> {
        let multiplier = match self.frequency? {
            12 => 12.0,
            4 => 4.0,
            2 => 2.0,
            1 => 1.0,
            _ => return None,
        };
        self.cash_amount.map(|a| a * multiplier)
    }

    pub fn is_special(&self) -> Option<bool> {
        self.frequency.map(|f| f == 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitFields {
    pub split_from: Option<f64>,
    pub split_to: Option<f64>,
}

impl SplitFields {
    /// New shares per old share.
    pub fn ratio(&self) -> Option<f64> {
        match (self.split_to, self.split_from) {
            (Some(to), Some(from)) if from != 0.0 => Some(to / from),
            _ => None,
        }
    }

    pub fn is_reverse(&self) -> Option<bool> {
        self.ratio().map(|r| r < 1.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IpoFields {
    pub issue_price: Option<f64>,
    pub shares_offered: Option<i64>,
    pub exchange: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionDetail {
    Dividend(DividendFields),
    Split(SplitFields),
    Ipo(IpoFields),
    TickerChange { new_ticker: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorporateAction {
    pub ticker: String,
    pub event_date: NaiveDate,
    pub id: String,
    pub downloaded_at: Option<String>,
    pub detail: ActionDetail,
}

impl CorporateAction {
    pub fn event_type(&self) -> EventType {
        match self.detail {
            ActionDetail::Dividend(_) => EventType::Dividend,
            ActionDetail::Split(_) => EventType::Split,
            ActionDetail::Ipo(_) => EventType::Ipo,
            ActionDetail::TickerChange { .. } => EventType::TickerChange,
        }
    }

    /// Normalize one raw bronze row of the given type.
    pub fn from_record(
        event_type: EventType,
        index: usize,
        row: &Map<String, Value>,
    ) -> Result<Self, ActionError> {
        let ticker = text(row, "ticker")
            .map(|t| t.trim().to_ascii_uppercase())
            .filter(|t| !t.is_empty())
            .ok_or(ActionError::MissingTicker { event_type, index })?;
        let field = event_type.date_field();
        let event_date = date(row, field).ok_or(ActionError::MissingDate {
            event_type,
            index,
            field,
        })?;

        let detail = match event_type {
            EventType::Dividend => ActionDetail::Dividend(DividendFields {
                cash_amount: float(row, "cash_amount"),
                currency: text(row, "currency"),
                declaration_date: date(row, "declaration_date"),
                dividend_type: text(row, "dividend_type"),
                frequency: int(row, "frequency"),
                pay_date: date(row, "pay_date"),
                record_date: date(row, "record_date"),
            }),
            EventType::Split => ActionDetail::Split(SplitFields {
                split_from: float(row, "split_from"),
                split_to: float(row, "split_to"),
            }),
            EventType::Ipo => ActionDetail::Ipo(IpoFields {
                issue_price: float(row, "final_issue_price"),
                shares_offered: int(row, "max_shares_offered"),
                exchange: text(row, "primary_exchange"),
                status: text(row, "ipo_status"),
            }),
            EventType::TickerChange => ActionDetail::TickerChange {
                new_ticker: text(row, "new_ticker").or_else(|| nested_ticker(row)),
            },
        };

        let id = text(row, "id")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("{ticker}_{event_date}"));

        Ok(Self {
            ticker,
            event_date,
            id,
            downloaded_at: text(row, "downloaded_at"),
            detail,
        })
    }
}

fn text(row: &Map<String, Value>, field: &str) -> Option<String> {
    match row.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn float(row: &Map<String, Value>, field: &str) -> Option<f64> {
    let value: Option<f64> = match row.get(field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}

fn int(row: &Map<String, Value>, field: &str) -> Option<i64> {
    match row.get(field)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn date(row: &Map<String, Value>, field: &str) -> Option<NaiveDate> {
    let raw = text(row, field)?;
    let head = raw.get(..10).unwrap_or(&raw);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Ticker events sometimes nest the new symbol as `{"ticker_change": {"ticker": ..}}`.
fn nested_ticker(row: &Map<String, Value>) -> Option<String> {
    let nested = match row.get("ticker_change")? {
        Value::String(s) => serde_json::from_str::<Value>(s).ok()?,
        v => v.clone(),
    };
    nested.get("ticker")?.as_str().map(str::to_string)
}

/// Parse a batch of raw rows, skipping and logging the ones that cannot be
/// placed on a ticker and date.
pub fn normalize_records(
    event_type: EventType,
    rows: &[Map<String, Value>],
) -> (Vec<CorporateAction>, Vec<ActionError>) {
    let mut actions = Vec::with_capacity(rows.len());
    let mut rejected = Vec::new();
    for (index, row) in rows.iter().enumerate() {
        match CorporateAction::from_record(event_type, index, row) {
            Ok(action) => actions.push(action),
            Err(e) => {
                tracing::warn!(error = %e, "skipping corporate action record");
                rejected.push(e);
            }
        }
    }
    (actions, rejected)
}

/// Unified column order of the silver table, before the partition writer
/// adds calendar fields and `processed_at`.
pub const UNIFIED_COLUMNS: [&str; 27] = [
    "ticker",
    "event_type",
    "event_date",
    "id",
    "downloaded_at",
    "div_cash_amount",
    "div_currency",
    "div_declaration_date",
    "div_type",
    "div_ex_dividend_date",
    "div_frequency",
    "div_pay_date",
    "div_record_date",
    "div_annualized_amount",
    "div_is_special",
    "div_quarter",
    "split_execution_date",
    "split_from",
    "split_to",
    "split_ratio",
    "split_is_reverse",
    "ipo_listing_date",
    "ipo_issue_price",
    "ipo_shares_offered",
    "ipo_exchange",
    "ipo_status",
    "new_ticker",
];

fn epoch_days(d: NaiveDate) -> i32 {
    d.num_days_from_ce() - 719_163
}

fn date_column(name: &str, values: Vec<Option<NaiveDate>>) -> PolarsResult<Column> {
    let days: Vec<Option<i32>> = values.into_iter().map(|d| d.map(epoch_days)).collect();
    Column::new(name.into(), days).cast(&DataType::Date)
}

/// Build the unified frame. Every column is present even when no event of
/// the matching type is in the batch.
pub fn to_dataframe(actions: &[CorporateAction]) -> PolarsResult<DataFrame> {
    let dividend = |a: &CorporateAction| match &a.detail {
        ActionDetail::Dividend(d) => Some(d.clone()),
        _ => None,
    };
    let split = |a: &CorporateAction| match &a.detail {
        ActionDetail::Split(s) => Some(s.clone()),
        _ => None,
    };
    let ipo = |a: &CorporateAction| match &a.detail {
        ActionDetail::Ipo(i) => Some(i.clone()),
        _ => None,
    };

    let divs: Vec<Option<DividendFields>> = actions.iter().map(dividend).collect();
    let splits: Vec<Option<SplitFields>> = actions.iter().map(split).collect();
    let ipos: Vec<Option<IpoFields>> = actions.iter().map(ipo).collect();
    let on_type = |t: EventType| -> Vec<Option<NaiveDate>> {
        actions
            .iter()
            .map(|a| (a.event_type() == t).then_some(a.event_date))
            .collect()
    };

    let columns = vec![
        Column::new(
            "ticker".into(),
            actions.iter().map(|a| a.ticker.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "event_type".into(),
            actions.iter().map(|a| a.event_type().as_str()).collect::<Vec<_>>(),
        ),
        date_column("event_date", actions.iter().map(|a| Some(a.event_date)).collect())?,
        Column::new(
            "id".into(),
            actions.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "downloaded_at".into(),
            actions.iter().map(|a| a.downloaded_at.clone()).collect::<Vec<_>>(),
        ),
        Column::new(
            "div_cash_amount".into(),
            divs.iter().map(|d| d.as_ref().and_then(|d| d.cash_amount)).collect::<Vec<_>>(),
        ),
        Column::new(
            "div_currency".into(),
            divs.iter().map(|d| d.as_ref().and_then(|d| d.currency.clone())).collect::<Vec<_>>(),
        ),
        date_column(
            "div_declaration_date",
            divs.iter().map(|d| d.as_ref().and_then(|d| d.declaration_date)).collect(),
        )?,
        Column::new(
            "div_type".into(),
            divs.iter()
                .map(|d| d.as_ref().and_then(|d| d.dividend_type.clone()))
                .collect::<Vec<_>>(),
        ),
        date_column("div_ex_dividend_date", on_type(EventType::Dividend))?,
        Column::new(
            "div_frequency".into(),
            divs.iter().map(|d| d.as_ref().and_then(|d| d.frequency)).collect::<Vec<_>>(),
        ),
        date_column(
            "div_pay_date",
            divs.iter().map(|d| d.as_ref().and_then(|d| d.pay_date)).collect(),
        )?,
        date_column(
            "div_record_date",
            divs.iter().map(|d| d.as_ref().and_then(|d| d.record_date)).collect(),
        )?,
        Column::new(
            "div_annualized_amount".into(),
            divs.iter()
                .map(|d| d.as_ref().and_then(DividendFields::annualized_amount))
                .collect::<Vec<_>>(),
        ),
        Column::new(
            "div_is_special".into(),
            divs.iter().map(|d| d.as_ref().and_then(DividendFields::is_special)).collect::<Vec<_>>(),
        ),
        Column::new(
            "div_quarter".into(),
            actions
                .iter()
                .map(|a| {
                    (a.event_type() == EventType::Dividend)
                        .then(|| (a.event_date.month0() / 3 + 1) as i32)
                })
                .collect::<Vec<_>>(),
        ),
        date_column("split_execution_date", on_type(EventType::Split))?,
        Column::new(
            "split_from".into(),
            splits.iter().map(|s| s.as_ref().and_then(|s| s.split_from)).collect::<Vec<_>>(),
        ),
        Column::new(
            "split_to".into(),
            splits.iter().map(|s| s.as_ref().and_then(|s| s.split_to)).collect::<Vec<_>>(),
        ),
        Column::new(
            "split_ratio".into(),
            splits.iter().map(|s| s.as_ref().and_then(SplitFields::ratio)).collect::<Vec<_>>(),
        ),
        Column::new(
            "split_is_reverse".into(),
            splits.iter().map(|s| s.as_ref().and_then(SplitFields::is_reverse)).collect::<Vec<_>>(),
        ),
        date_column("ipo_listing_date", on_type(EventType::Ipo))?,
        Column::new(
            "ipo_issue_price".into(),
            ipos.iter().map(|i| i.as_ref().and_then(|i| i.issue_price)).collect::<Vec<_>>(),
        ),
        Column::new(
            "ipo_shares_offered".into(),
            ipos.iter().map(|i| i.as_ref().and_then(|i| i.shares_offered)).collect::<Vec<_>>(),
        ),
        Column::new(
            "ipo_exchange".into(),
            ipos.iter().map(|i| i.as_ref().and_then(|i| i.exchange.clone())).collect::<Vec<_>>(),
        ),
        Column::new(
            "ipo_status".into(),
            ipos.iter().map(|i| i.as_ref().and_then(|i| i.status.clone())).collect::<Vec<_>>(),
        ),
        Column::new(
            "new_ticker".into(),
            actions
                .iter()
                .map(|a| match &a.detail {
                    ActionDetail::TickerChange { new_ticker } => new_ticker.clone(),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        ),
    ];
    DataFrame::new(columns)
}

/// `ticker=/event_type=` partitions, newest event first, re-runs replace
/// each partition.
pub fn default_layout() -> PartitionLayout {
    PartitionLayout {
        dimensions: vec!["ticker".into(), "event_type".into()],
        sort: vec![SortColumn::desc("event_date"), SortColumn::asc("id")],
        calendar_source: Some("event_date".into()),
        ..PartitionLayout::default()
    }
}
