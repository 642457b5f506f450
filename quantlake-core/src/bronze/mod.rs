//! Raw payload → bronze table decoding.

pub mod csv;
pub mod records;

pub use self::csv::decode_csv;
pub use records::{dataframe_to_records, records_to_dataframe};

use crate::source::{SourcePayload, SourceUnit};
use polars::prelude::{DataFrame, PolarsError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BronzeError {
    #[error("empty payload")]
    EmptyPayload,

    #[error("record {index} is invalid: {reason}")]
    InvalidRecord { index: usize, reason: String },

    #[error("{context}: {source}")]
    Polars {
        context: String,
        #[source]
        source: PolarsError,
    },
}

impl BronzeError {
    pub(crate) fn polars(context: impl Into<String>, source: PolarsError) -> Self {
        BronzeError::Polars {
            context: context.into(),
            source,
        }
    }
}

/// Turns a fetched payload into the bronze frame for its unit.
pub trait UnitTransform: Send + Sync {
    fn transform(&self, unit: &SourceUnit, payload: SourcePayload) -> Result<DataFrame, BronzeError>;
}

/// CSV bytes are parsed; API records are flattened one level.
#[derive(Debug, Default, Clone, Copy)]
pub struct PayloadDecoder;

impl UnitTransform for PayloadDecoder {
    fn transform(&self, _unit: &SourceUnit, payload: SourcePayload) -> Result<DataFrame, BronzeError> {
        match payload {
            SourcePayload::Bytes(bytes) => decode_csv(bytes),
            SourcePayload::Records(records) => records_to_dataframe(&records),
        }
    }
}
