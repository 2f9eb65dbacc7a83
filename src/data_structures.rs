use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

// --- Core Data Structures ---

/// One cleaned candle, stamped in the timezone the caller asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<FixedOffset>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }
}

/// Raw bar as delivered by an upstream provider, always in UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Time-indexed OHLC table for a single symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcSeries {
    pub symbol: String,
    pub tf_minutes: u32,
    pub candles: Vec<Candle>,
}

impl OhlcSeries {
    pub fn new(symbol: impl Into<String>, tf_minutes: u32, candles: Vec<Candle>) -> Self {
        Self {
            symbol: symbol.into(),
            tf_minutes,
            candles,
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }
}

// --- Uploads ---

/// A set of uploaded CSV files kept on disk for later charting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadBundle {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub series: Vec<OhlcSeries>,
}

impl UploadBundle {
    pub fn symbols(&self) -> Vec<String> {
        self.series.iter().map(|s| s.symbol.clone()).collect()
    }
}

/// Short label for a timeframe in minutes, e.g. `15m`, `4h`, `1D`.
pub fn timeframe_label(tf_minutes: u32) -> String {
    if tf_minutes >= 1440 && tf_minutes % 1440 == 0 {
        format!("{}D", tf_minutes / 1440)
    } else if tf_minutes >= 60 && tf_minutes % 60 == 0 {
        format!("{}h", tf_minutes / 60)
    } else {
        format!("{}m", tf_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_label() {
        assert_eq!(timeframe_label(15), "15m");
        assert_eq!(timeframe_label(90), "90m");
        assert_eq!(timeframe_label(240), "4h");
        assert_eq!(timeframe_label(1440), "1D");
    }

    #[test]
    fn test_bundle_symbols_keep_order() {
        let bundle = UploadBundle {
            key: "upload_20250101_000000".to_string(),
            created_at: Utc::now(),
            series: vec![OhlcSeries::new("EURUSD", 15, vec![]), OhlcSeries::new("XAUUSD", 15, vec![])],
        };
        assert_eq!(bundle.symbols(), vec!["EURUSD", "XAUUSD"]);
    }
}
