use crate::data_structures::{Candle, OhlcSeries};
use crate::utils::symbol::normalize_symbol;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use std::io::{Cursor, Write};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const CSV_HEADER: [&str; 6] = ["datetime", "open", "high", "low", "close", "volume"];
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";
const TIME_COLUMN_NAMES: [&str; 5] = ["datetime", "date", "time", "timestamp", "index"];

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("missing column '{0}'")]
    MissingColumn(&'static str),
    #[error("no valid rows")]
    NoRows,
}

fn file_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

pub fn csv_filename(symbol: &str, tf_minutes: u32, now: DateTime<Utc>) -> String {
    format!("{}_{}m_{}.csv", symbol, tf_minutes, file_timestamp(now))
}

pub fn zip_filename(now: DateTime<Utc>) -> String {
    format!("ohlc_data_{}.zip", file_timestamp(now))
}

pub fn pdf_filename(symbols: &[String], now: DateTime<Utc>) -> String {
    format!("candlestick_{}_{}.pdf", symbols.join("_"), file_timestamp(now))
}

/// Serialise one series with the datetime index as the first column.
pub fn write_csv(series: &OhlcSeries) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;

    for candle in &series.candles {
        writer.write_record([
            candle.time.format(DATETIME_FORMAT).to_string(),
            candle.open.to_string(),
            candle.high.to_string(),
            candle.low.to_string(),
            candle.close.to_string(),
            candle.volume.to_string(),
        ])?;
    }

    writer.into_inner().map_err(|e| ExportError::Io(e.into_error()))
}

/// Bundle several series into a deflated ZIP, one CSV per symbol.
pub fn write_zip(all_series: &[OhlcSeries], now: DateTime<Utc>) -> Result<Vec<u8>, ExportError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for series in all_series {
        let csv_bytes = write_csv(series)?;
        zip.start_file(csv_filename(&series.symbol, series.tf_minutes, now), options)?;
        zip.write_all(&csv_bytes)?;
    }

    Ok(zip.finish()?.into_inner())
}

/// `XAUUSD_15m_20250101_120000.csv` -> `XAUUSD`, normalized like any other
/// symbol. Non-CSV names give `None`.
pub fn symbol_from_filename(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    if !name.to_ascii_lowercase().ends_with(".csv") {
        return None;
    }
    let stem = &name[..name.len() - 4];
    normalize_symbol(stem.split('_').next().unwrap_or(stem))
}

fn parse_datetime(value: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt);
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%z", "%Y-%m-%d %H:%M%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
            return Some(dt);
        }
    }
    // Naive values are taken as UTC
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y.%m.%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(naive.and_utc().fixed_offset());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().fixed_offset())
}

/// Parse an uploaded OHLC CSV. The datetime index is the first column unless
/// a column is explicitly named like one; price columns are matched by name.
/// Rows that fail to parse are skipped.
pub fn read_csv(bytes: &[u8]) -> Result<Vec<Candle>, ExportError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_ascii_lowercase()).collect();
    let find = |name: &'static str| headers.iter().position(|h| h == name);

    let time_idx = TIME_COLUMN_NAMES.iter().find_map(|n| find(*n)).unwrap_or(0);
    let open_idx = find("open").ok_or(ExportError::MissingColumn("open"))?;
    let high_idx = find("high").ok_or(ExportError::MissingColumn("high"))?;
    let low_idx = find("low").ok_or(ExportError::MissingColumn("low"))?;
    let close_idx = find("close").ok_or(ExportError::MissingColumn("close"))?;
    let volume_idx = find("volume").or_else(|| find("tick_volume"));

    let mut candles = Vec::new();
    for record in reader.records() {
        let Ok(record) = record else { continue };

        let price = |idx: usize| record.get(idx).and_then(|v| v.parse::<f64>().ok()).filter(|p| p.is_finite());

        let (Some(time), Some(open), Some(high), Some(low), Some(close)) = (
            record.get(time_idx).and_then(parse_datetime),
            price(open_idx),
            price(high_idx),
            price(low_idx),
            price(close_idx),
        ) else {
            continue;
        };

        if high < low {
            continue;
        }

        let volume = volume_idx.and_then(price).filter(|v| *v >= 0.0).unwrap_or(0.0);
        candles.push(Candle {
            time,
            open,
            high: high.max(open).max(close),
            low: low.min(open).min(close),
            close,
            volume,
        });
    }

    if candles.is_empty() {
        return Err(ExportError::NoRows);
    }

    // Stable sort, so a repeated timestamp keeps the row that came last
    candles.sort_by_key(|c| c.time);
    let mut unique: Vec<Candle> = Vec::with_capacity(candles.len());
    for candle in candles {
        match unique.last_mut() {
            Some(last) if last.time == candle.time => *last = candle,
            _ => unique.push(candle),
        }
    }
    Ok(unique)
}

/// Smallest gap between consecutive candles, in minutes.
pub fn infer_timeframe(candles: &[Candle]) -> Option<u32> {
    candles
        .windows(2)
        .map(|w| (w[1].time - w[0].time).num_minutes())
        .filter(|m| *m > 0)
        .min()
        .and_then(|m| u32::try_from(m).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Read;

    fn sample_series(symbol: &str) -> OhlcSeries {
        let tz = FixedOffset::east_opt(12600).unwrap();
        let candles = (0..3)
            .map(|i| Candle {
                time: tz.with_ymd_and_hms(2025, 1, 2, 10, 15 * i, 0).unwrap(),
                open: 2650.5,
                high: 2660.0,
                low: 2645.25,
                close: 2655.0 + i as f64,
                volume: 120.0,
            })
            .collect();
        OhlcSeries::new(symbol, 15, candles)
    }

    #[test]
    fn test_filenames() {
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(csv_filename("XAUUSD", 15, now), "XAUUSD_15m_20250102_030405.csv");
        assert_eq!(zip_filename(now), "ohlc_data_20250102_030405.zip");
        assert_eq!(
            pdf_filename(&["VCB".to_string(), "FPT".to_string()], now),
            "candlestick_VCB_FPT_20250102_030405.pdf"
        );
    }

    #[test]
    fn test_write_csv_layout() {
        let bytes = write_csv(&sample_series("XAUUSD")).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("datetime,open,high,low,close,volume"));
        assert_eq!(lines.next(), Some("2025-01-02 10:00:00+03:30,2650.5,2660,2645.25,2655,120"));
        assert_eq!(text.lines().count(), 4);
    }

    #[test]
    fn test_csv_can_be_read_back() {
        let series = sample_series("XAUUSD");
        let candles = read_csv(&write_csv(&series).unwrap()).unwrap();
        assert_eq!(candles, series.candles);
        assert_eq!(infer_timeframe(&candles), Some(15));
    }

    #[test]
    fn test_write_zip_contains_one_csv_per_symbol() {
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let bytes = write_zip(&[sample_series("VCB"), sample_series("FPT")], now).unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut names: Vec<String> = archive.file_names().map(String::from).collect();
        names.sort();
        assert_eq!(names, vec!["FPT_15m_20250102_030405.csv", "VCB_15m_20250102_030405.csv"]);

        let mut content = String::new();
        archive
            .by_name("VCB_15m_20250102_030405.csv")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert!(content.starts_with("datetime,open,high,low,close,volume"));
    }

    #[test]
    fn test_read_csv_skips_bad_rows_and_handles_other_layouts() {
        let input = b"Date,Open,High,Low,Close\n\
            2025-01-02 10:00,1.10,1.12,1.09,1.11\n\
            not a date,1,1,1,1\n\
            2025-01-02 09:00,1.00,1.05,0.99,1.04\n\
            2025-01-02 11:00,1.10,1.00,1.20,1.11\n";
        let candles = read_csv(input).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].time.to_rfc3339(), "2025-01-02T09:00:00+00:00");
        assert_eq!(candles[1].volume, 0.0);
        assert_eq!(infer_timeframe(&candles), Some(60));
    }

    #[test]
    fn test_read_csv_duplicate_timestamp_keeps_last_row() {
        let input = b"datetime,open,high,low,close,volume\n\
            2025-01-02 09:00:00,1.00,1.05,0.99,1.01,10\n\
            2025-01-02 09:15:00,1.01,1.06,1.00,1.02,11\n\
            2025-01-02 09:00:00,1.00,1.08,0.98,1.07,12\n";
        let candles = read_csv(input).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 1.07);
        assert_eq!(candles[0].volume, 12.0);
        assert_eq!(candles[1].close, 1.02);
    }

    #[test]
    fn test_read_csv_errors() {
        assert!(matches!(read_csv(b"datetime,open,high,low\n"), Err(ExportError::MissingColumn("close"))));
        assert!(matches!(read_csv(b"datetime,open,high,low,close\n"), Err(ExportError::NoRows)));
    }

    #[test]
    fn test_symbol_from_filename() {
        assert_eq!(symbol_from_filename("XAUUSD_15m_20250101_000000.csv"), Some("XAUUSD".to_string()));
        assert_eq!(symbol_from_filename("vcb.CSV"), Some("VCB".to_string()));
        assert_eq!(symbol_from_filename("VCB_15m.csv"), symbol_from_filename("vcb.csv"));
        assert_eq!(symbol_from_filename("gold€_1h.csv"), Some("GOLD".to_string()));
        assert_eq!(symbol_from_filename("€€.csv"), None);
        assert_eq!(symbol_from_filename("notes.txt"), None);
        assert_eq!(symbol_from_filename(".csv"), None);
    }
}
