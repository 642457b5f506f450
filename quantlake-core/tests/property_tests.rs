//! Property tests for metadata invariants.
//!
//! 1. Watermark monotonicity: advancing never moves the stored date back
//! 2. Partition keys survive a round trip through their directory path

use chrono::NaiveDate;
use proptest::prelude::*;
use quantlake_core::metadata::{FileWatermarkStore, Layer, WatermarkStore};
use quantlake_core::PartitionScheme;

fn date_strategy() -> impl Strategy<Value = NaiveDate> {
    (0i64..3650).prop_map(|offset| {
        NaiveDate::from_ymd_opt(2015, 1, 1).unwrap() + chrono::Duration::days(offset)
    })
}

// ── Properties ───────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn watermark_ends_at_the_maximum_advanced_date(
        dates in prop::collection::vec(date_strategy(), 1..20)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path());
        let mut previous = None;
        for date in &dates {
            store.advance("stocks_daily", *date, Some("AAPL"), Layer::Bronze).unwrap();
            let current = store.get("stocks_daily", Some("AAPL"), Layer::Bronze).unwrap();
            prop_assert!(current >= previous);
            previous = current;
        }
        prop_assert_eq!(previous, dates.iter().max().copied());
    }

    #[test]
    fn daily_key_survives_path_round_trip(date in date_strategy()) {
        let scheme = PartitionScheme::daily("stocks_daily");
        let key = scheme.date_key(date).unwrap();
        let path = key.to_path().join("data.parquet");
        prop_assert_eq!(scheme.parse(&path).unwrap(), key);
    }

    #[test]
    fn ticker_key_survives_path_round_trip(ticker in "[A-Z]{1,5}", year in 1990i32..2100) {
        let scheme = PartitionScheme::new("fundamentals", &["ticker", "year"]);
        let key = scheme.key(&[ticker.clone(), year.to_string()]).unwrap();
        prop_assert_eq!(key.get("ticker"), Some(ticker.as_str()));
        prop_assert_eq!(scheme.parse(&key.to_path()).unwrap(), key);
    }
}
