//! Landing CSV day files (plain or gzip) → DataFrame.

use super::BronzeError;
use polars::prelude::*;
use std::io::Cursor;

const INFER_SCHEMA_ROWS: usize = 10_000;

pub fn decode_csv(bytes: Vec<u8>) -> Result<DataFrame, BronzeError> {
    if bytes.is_empty() {
        return Err(BronzeError::EmptyPayload);
    }
    CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(INFER_SCHEMA_ROWS))
        .into_reader_with_file_handle(Cursor::new(bytes))
        .finish()
        .map_err(|e| BronzeError::polars("decode csv", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_flat_file_rows() {
        let csv = b"ticker,volume,open,close,high,low,window_start,transactions\n\
AAPL,1000,185.1,186.0,186.4,184.9,1709269200000000000,120\n\
MSFT,2000,410.0,411.2,412.0,409.5,1709269200000000000,240\n"
            .to_vec();
        let df = decode_csv(csv).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 8);
        assert_eq!(df.column("volume").unwrap().dtype(), &DataType::Int64);
        assert_eq!(df.column("close").unwrap().dtype(), &DataType::Float64);
    }

    #[test]
    fn empty_payload_is_an_error() {
        assert!(matches!(decode_csv(Vec::new()), Err(BronzeError::EmptyPayload)));
    }
}
