use crate::data_structures::{Candle, OhlcSeries, RawBar};
use crate::utils::{OhlcTimezone, TimezoneError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Largest timeframe accepted, one 30-day month.
pub const MAX_TIMEFRAME_MINUTES: u32 = 43_200;
const MAX_COUNT_BACK: u64 = 50_000;
const LOOKBACK_OVERFETCH: u64 = 3;

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Timezone(#[from] TimezoneError),
    #[error("upstream error for {symbol}: {message}")]
    Upstream { symbol: String, message: String },
    #[error("no data returned for {0}")]
    NoData(String),
}

/// Resolution the upstream provider is asked for; candles are resampled
/// from it into the requested timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseInterval {
    OneMinute,
    OneHour,
    OneDay,
}

impl BaseInterval {
    pub fn for_timeframe(tf_minutes: u32) -> Self {
        if tf_minutes % 1440 == 0 {
            BaseInterval::OneDay
        } else if tf_minutes % 60 == 0 {
            BaseInterval::OneHour
        } else {
            BaseInterval::OneMinute
        }
    }

    pub fn minutes(&self) -> u32 {
        match self {
            BaseInterval::OneMinute => 1,
            BaseInterval::OneHour => 60,
            BaseInterval::OneDay => 1440,
        }
    }
}

/// Anything that can hand back raw bars for a symbol.
#[async_trait]
pub trait OhlcSource: Send + Sync {
    /// Fetch up to `count_back` bars of `interval` resolution ending at `to`.
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: BaseInterval,
        to: DateTime<Utc>,
        count_back: u32,
    ) -> Result<Vec<RawBar>, MarketDataError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DateMode {
    Lookback { output_candles: usize },
    Range { from: DateTime<Utc>, to: DateTime<Utc> },
}

impl DateMode {
    /// Build a date mode from the raw request fields. `mode` is either
    /// `lookback` or anything else for an explicit range, matching the form.
    pub fn from_request(
        mode: &str,
        output_candles: usize,
        from: Option<&str>,
        to: Option<&str>,
        timezone: &OhlcTimezone,
    ) -> Result<Self, MarketDataError> {
        if mode.trim().eq_ignore_ascii_case("lookback") {
            if output_candles == 0 {
                return Err(MarketDataError::InvalidRequest(
                    "output_candles must be greater than zero".to_string(),
                ));
            }
            return Ok(DateMode::Lookback { output_candles });
        }

        let from = from
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| MarketDataError::InvalidRequest("from_date is required for a date range".to_string()))?;
        let to = to
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| MarketDataError::InvalidRequest("to_date is required for a date range".to_string()))?;

        let from = parse_date_bound(from, timezone, false)?;
        let to = parse_date_bound(to, timezone, true)?;
        if from > to {
            return Err(MarketDataError::InvalidRequest(
                "from_date must not be after to_date".to_string(),
            ));
        }

        Ok(DateMode::Range { from, to })
    }
}

#[derive(Debug, Clone)]
pub struct FetchParams {
    pub tf_minutes: u32,
    pub timezone: OhlcTimezone,
    pub mode: DateMode,
}

impl FetchParams {
    pub fn validate(&self) -> Result<(), MarketDataError> {
        if self.tf_minutes == 0 || self.tf_minutes > MAX_TIMEFRAME_MINUTES {
            return Err(MarketDataError::InvalidRequest(format!(
                "tf must be between 1 and {} minutes, got {}",
                MAX_TIMEFRAME_MINUTES, self.tf_minutes
            )));
        }
        if let DateMode::Lookback { output_candles: 0 } = self.mode {
            return Err(MarketDataError::InvalidRequest(
                "output_candles must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Base interval, end instant and number of base bars to request.
    pub fn request_window(&self, now: DateTime<Utc>) -> (BaseInterval, DateTime<Utc>, u32) {
        let base = BaseInterval::for_timeframe(self.tf_minutes);
        let ratio = u64::from(self.tf_minutes / base.minutes());

        let (to, count_back) = match &self.mode {
            DateMode::Lookback { output_candles } => {
                let wanted = (*output_candles as u64)
                    .saturating_mul(ratio)
                    .saturating_mul(LOOKBACK_OVERFETCH);
                (now, wanted.saturating_add(10))
            }
            DateMode::Range { from, to } => {
                let span = (*to - *from).num_minutes().max(0) as u64;
                (*to, span / u64::from(base.minutes()) + ratio + 10)
            }
        };

        (base, to, count_back.min(MAX_COUNT_BACK) as u32)
    }
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM[:SS]` and the `T`-separated form
/// sent by `datetime-local` inputs. A bare date is the start of that day, or
/// its last second when it closes a range.
pub fn parse_date_bound(
    input: &str,
    timezone: &OhlcTimezone,
    end_of_day: bool,
) -> Result<DateTime<Utc>, MarketDataError> {
    let input = input.trim();

    const DATETIME_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ];

    let naive = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(input, "%Y-%m-%d").ok().and_then(|date| {
                if end_of_day {
                    date.and_hms_opt(23, 59, 59)
                } else {
                    date.and_hms_opt(0, 0, 0)
                }
            })
        })
        .ok_or_else(|| MarketDataError::InvalidRequest(format!("unrecognised date '{}'", input)))?;

    Ok(timezone.from_local(&naive))
}

/// Drop unusable bars, repair wicks that do not bound the body, sort by
/// time and keep the last bar for any duplicated timestamp.
pub fn clean_bars(mut bars: Vec<RawBar>) -> Vec<RawBar> {
    bars.retain(|b| {
        [b.open, b.high, b.low, b.close].iter().all(|p| p.is_finite() && *p > 0.0) && b.high >= b.low
    });

    for bar in bars.iter_mut() {
        bar.high = bar.high.max(bar.open).max(bar.close);
        bar.low = bar.low.min(bar.open).min(bar.close);
        if !bar.volume.is_finite() || bar.volume < 0.0 {
            bar.volume = 0.0;
        }
    }

    bars.sort_by_key(|b| b.time);

    let mut cleaned: Vec<RawBar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match cleaned.last_mut() {
            Some(last) if last.time == bar.time => *last = bar,
            _ => cleaned.push(bar),
        }
    }
    cleaned
}

/// Aggregate sorted bars into `tf_minutes` buckets aligned to wall-clock
/// time in `timezone`.
pub fn resample(bars: &[RawBar], tf_minutes: u32, timezone: &OhlcTimezone) -> Vec<Candle> {
    let step = i64::from(tf_minutes) * 60;
    let mut candles: Vec<Candle> = Vec::new();
    let mut current_bucket: Option<i64> = None;

    for bar in bars {
        let offset = timezone.offset_at(&bar.time).local_minus_utc() as i64;
        let local_secs = bar.time.timestamp() + offset;
        let bucket = local_secs.div_euclid(step) * step;

        match candles.last_mut() {
            Some(candle) if current_bucket == Some(bucket) => {
                candle.high = candle.high.max(bar.high);
                candle.low = candle.low.min(bar.low);
                candle.close = bar.close;
                candle.volume += bar.volume;
            }
            _ => {
                let Some(start) = DateTime::<Utc>::from_timestamp(bucket - offset, 0) else {
                    continue;
                };
                candles.push(Candle {
                    time: timezone.to_local(&start),
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                });
                current_bucket = Some(bucket);
            }
        }
    }

    candles
}

/// Re-express a stored series in `timezone`, aggregating it into
/// `tf_minutes` buckets when that is a coarser multiple of its own timeframe.
pub fn regroup_series(
    mut series: OhlcSeries,
    tf_minutes: u32,
    timezone: &OhlcTimezone,
) -> Result<OhlcSeries, MarketDataError> {
    if tf_minutes == series.tf_minutes {
        for candle in series.candles.iter_mut() {
            candle.time = timezone.to_local(&candle.time.to_utc());
        }
        return Ok(series);
    }

    if tf_minutes < series.tf_minutes || tf_minutes.checked_rem(series.tf_minutes) != Some(0) {
        return Err(MarketDataError::InvalidRequest(format!(
            "cannot resample {} from {}m to {}m",
            series.symbol, series.tf_minutes, tf_minutes
        )));
    }

    let bars: Vec<RawBar> = series
        .candles
        .iter()
        .map(|c| RawBar {
            time: c.time.to_utc(),
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
        })
        .collect();

    Ok(OhlcSeries::new(series.symbol, tf_minutes, resample(&bars, tf_minutes, timezone)))
}

/// Cut a resampled table down to what the caller asked for.
pub fn apply_window(mut candles: Vec<Candle>, mode: &DateMode) -> Vec<Candle> {
    match mode {
        DateMode::Lookback { output_candles } => {
            let skip = candles.len().saturating_sub(*output_candles);
            candles.drain(..skip);
            candles
        }
        DateMode::Range { from, to } => {
            candles.retain(|c| c.time >= *from && c.time <= *to);
            candles
        }
    }
}

/// Fetch-and-normalise front end over an [`OhlcSource`].
#[derive(Clone)]
pub struct MarketDataService {
    source: Arc<dyn OhlcSource>,
}

impl MarketDataService {
    pub fn new(source: Arc<dyn OhlcSource>) -> Self {
        Self { source }
    }

    #[instrument(skip(self, params), fields(tf = params.tf_minutes, timezone = %params.timezone))]
    pub async fn fetch_and_clean(&self, symbol: &str, params: &FetchParams) -> Result<OhlcSeries, MarketDataError> {
        params.validate()?;

        let (interval, to, count_back) = params.request_window(Utc::now());
        debug!(?interval, %to, count_back, "Requesting bars from source");

        let raw = self.source.fetch_bars(symbol, interval, to, count_back).await?;
        let raw_count = raw.len();
        let cleaned = clean_bars(raw);
        let resampled = resample(&cleaned, params.tf_minutes, &params.timezone);
        let candles = apply_window(resampled, &params.mode);

        debug!(raw_count, cleaned = cleaned.len(), candles = candles.len(), "Cleaned bars");

        if candles.is_empty() {
            return Err(MarketDataError::NoData(symbol.to_string()));
        }

        Ok(OhlcSeries::new(symbol, params.tf_minutes, candles))
    }

    /// Fetch each symbol in order. Symbols that fail or come back empty are
    /// logged and left out.
    pub async fn fetch_many(&self, symbols: &[String], params: &FetchParams) -> Vec<OhlcSeries> {
        let mut all_series = Vec::with_capacity(symbols.len());

        for symbol in symbols {
            match self.fetch_and_clean(symbol, params).await {
                Ok(series) => {
                    info!(symbol, candles = series.len(), "Fetched candles");
                    all_series.push(series);
                }
                Err(MarketDataError::NoData(_)) => {
                    warn!(symbol, "No data returned");
                }
                Err(e) => {
                    warn!(symbol, error = %e, "Failed to fetch symbol");
                }
            }
        }

        all_series
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    /// Source serving one-minute bars from a fixed start, ignoring `to`.
    pub struct StaticSource {
        pub bars: Vec<RawBar>,
        pub missing: Vec<String>,
    }

    impl StaticSource {
        pub fn minutes(start: DateTime<Utc>, count: usize) -> Self {
            let bars = (0..count)
                .map(|i| {
                    let base = 100.0 + i as f64;
                    RawBar {
                        time: start + Duration::minutes(i as i64),
                        open: base,
                        high: base + 2.0,
                        low: base - 1.0,
                        close: base + 1.0,
                        volume: 10.0,
                    }
                })
                .collect();
            Self { bars, missing: Vec::new() }
        }
    }

    #[async_trait]
    impl OhlcSource for StaticSource {
        async fn fetch_bars(
            &self,
            symbol: &str,
            _interval: BaseInterval,
            _to: DateTime<Utc>,
            _count_back: u32,
        ) -> Result<Vec<RawBar>, MarketDataError> {
            if self.missing.iter().any(|m| m == symbol) {
                return Err(MarketDataError::Upstream {
                    symbol: symbol.to_string(),
                    message: "unknown symbol".to_string(),
                });
            }
            Ok(self.bars.clone())
        }
    }

    fn bar(minute: i64, open: f64, high: f64, low: f64, close: f64) -> RawBar {
        RawBar {
            time: Utc.with_ymd_and_hms(2025, 1, 2, 9, 0, 0).unwrap() + Duration::minutes(minute),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_base_interval_selection() {
        assert_eq!(BaseInterval::for_timeframe(15), BaseInterval::OneMinute);
        assert_eq!(BaseInterval::for_timeframe(90), BaseInterval::OneMinute);
        assert_eq!(BaseInterval::for_timeframe(240), BaseInterval::OneHour);
        assert_eq!(BaseInterval::for_timeframe(1440), BaseInterval::OneDay);
    }

    #[test]
    fn test_clean_bars_drops_and_repairs() {
        let bars = vec![
            bar(2, 10.0, 11.0, 9.0, 10.5),
            bar(0, 10.0, 9.5, 9.0, 10.2), // high below close, repaired
            bar(1, f64::NAN, 11.0, 9.0, 10.0),
            bar(3, 10.0, 8.0, 9.0, 10.0), // high < low, dropped
            bar(2, 10.0, 12.0, 9.0, 11.0), // duplicate, last wins
        ];

        let cleaned = clean_bars(bars);
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[0].high, 10.2);
        assert_eq!(cleaned[1].close, 11.0);
        assert!(cleaned.windows(2).all(|w| w[0].time < w[1].time));
    }

    #[test]
    fn test_resample_aligns_to_local_wall_clock() {
        // 09:00 UTC is 12:30 at utc+3:30, so 15m buckets start at :30 UTC-wise
        let tz = OhlcTimezone::parse("utc+3:30").unwrap();
        let bars: Vec<RawBar> = (0..30).map(|m| bar(m, 10.0, 50.0, 9.0, 10.0 + m as f64)).collect();

        let candles = resample(&bars, 15, &tz);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].time.to_rfc3339(), "2025-01-02T12:30:00+03:30");
        assert_eq!(candles[1].time.to_rfc3339(), "2025-01-02T12:45:00+03:30");
        assert_eq!(candles[0].volume, 15.0);
        assert_eq!(candles[1].open, 10.0);
        assert_eq!(candles[1].close, 39.0);
        assert_eq!(candles[1].high, 50.0);
    }

    #[test]
    fn test_resample_partial_first_bucket() {
        let tz = OhlcTimezone::utc();
        let bars: Vec<RawBar> = (5..20).map(|m| bar(m, 10.0, 11.0, 9.0, 10.0)).collect();
        let candles = resample(&bars, 15, &tz);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].time.to_rfc3339(), "2025-01-02T09:00:00+00:00");
        assert_eq!(candles[0].volume, 10.0);
    }

    #[test]
    fn test_apply_window_lookback_keeps_tail() {
        let tz = OhlcTimezone::utc();
        let bars: Vec<RawBar> = (0..10).map(|m| bar(m, 10.0, 11.0, 9.0, 10.0)).collect();
        let candles = apply_window(resample(&bars, 1, &tz), &DateMode::Lookback { output_candles: 3 });
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].time.to_rfc3339(), "2025-01-02T09:07:00+00:00");
    }

    #[test]
    fn test_apply_window_range_is_inclusive() {
        let tz = OhlcTimezone::utc();
        let bars: Vec<RawBar> = (0..120).map(|m| bar(m, 10.0, 11.0, 9.0, 10.0)).collect();
        let candles = resample(&bars, 15, &tz);
        assert_eq!(candles.len(), 8);

        let mode = DateMode::Range {
            from: Utc.with_ymd_and_hms(2025, 1, 2, 9, 30, 0).unwrap(),
            to: Utc.with_ymd_and_hms(2025, 1, 2, 10, 30, 0).unwrap(),
        };
        let windowed = apply_window(candles, &mode);
        assert_eq!(windowed.len(), 5);
        assert_eq!(windowed[0].time.to_rfc3339(), "2025-01-02T09:30:00+00:00");
        assert_eq!(windowed[4].time.to_rfc3339(), "2025-01-02T10:30:00+00:00");
    }

    #[test]
    fn test_request_window_range() {
        let from = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap();
        let mut params = FetchParams {
            tf_minutes: 15,
            timezone: OhlcTimezone::utc(),
            mode: DateMode::Range { from, to },
        };

        let (interval, end, count_back) = params.request_window(Utc::now());
        assert_eq!(interval, BaseInterval::OneMinute);
        assert_eq!(end, to);
        assert_eq!(count_back, 1440 + 15 + 10);

        params.tf_minutes = 240;
        let (interval, _, count_back) = params.request_window(Utc::now());
        assert_eq!(interval, BaseInterval::OneHour);
        assert_eq!(count_back, 24 + 4 + 10);
    }

    #[test]
    fn test_regroup_series() {
        let tz = OhlcTimezone::utc();
        let bars: Vec<RawBar> = (0..60).map(|m| bar(m, 10.0, 11.0 + m as f64, 9.0, 10.0)).collect();
        let series = OhlcSeries::new("XAUUSD", 15, resample(&bars, 15, &tz));
        assert_eq!(series.len(), 4);

        let hourly = regroup_series(series.clone(), 60, &tz).unwrap();
        assert_eq!(hourly.tf_minutes, 60);
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly.candles[0].high, 70.0);
        assert_eq!(hourly.candles[0].volume, 60.0);

        let tehran = OhlcTimezone::parse("utc+3:30").unwrap();
        let same = regroup_series(series.clone(), 15, &tehran).unwrap();
        assert_eq!(same.len(), 4);
        assert_eq!(same.candles[0].time.to_rfc3339(), "2025-01-02T12:30:00+03:30");

        assert!(regroup_series(series.clone(), 5, &tz).is_err());
        assert!(regroup_series(series, 40, &tz).is_err());
    }

    #[test]
    fn test_date_mode_range_parsing() {
        let tz = OhlcTimezone::parse("utc+3:30").unwrap();
        let mode = DateMode::from_request("range", 85, Some("2025-01-02"), Some("2025-01-03"), &tz).unwrap();
        match mode {
            DateMode::Range { from, to } => {
                assert_eq!(from.to_rfc3339(), "2025-01-01T20:30:00+00:00");
                assert_eq!(to.to_rfc3339(), "2025-01-03T20:29:59+00:00");
            }
            other => panic!("unexpected mode {:?}", other),
        }

        assert!(DateMode::from_request("range", 85, Some("2025-01-03"), Some("2025-01-02"), &tz).is_err());
        assert!(DateMode::from_request("range", 85, Some("yesterday"), Some("2025-01-02"), &tz).is_err());
        assert!(DateMode::from_request("range", 85, None, Some("2025-01-02"), &tz).is_err());
        assert!(DateMode::from_request("lookback", 0, None, None, &tz).is_err());
    }

    #[test]
    fn test_parse_datetime_local_input() {
        let tz = OhlcTimezone::utc();
        let parsed = parse_date_bound("2025-01-02T10:15", &tz, true).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-01-02T10:15:00+00:00");
    }

    #[test]
    fn test_request_window_lookback() {
        let params = FetchParams {
            tf_minutes: 15,
            timezone: OhlcTimezone::utc(),
            mode: DateMode::Lookback { output_candles: 85 },
        };
        let now = Utc::now();
        let (interval, to, count_back) = params.request_window(now);
        assert_eq!(interval, BaseInterval::OneMinute);
        assert_eq!(to, now);
        assert_eq!(count_back, 85 * 15 * 3 + 10);
    }

    #[test]
    fn test_validate_rejects_bad_timeframe() {
        let mut params = FetchParams {
            tf_minutes: 0,
            timezone: OhlcTimezone::utc(),
            mode: DateMode::Lookback { output_candles: 10 },
        };
        assert!(params.validate().is_err());
        params.tf_minutes = MAX_TIMEFRAME_MINUTES + 1;
        assert!(params.validate().is_err());
        params.tf_minutes = 60;
        assert!(params.validate().is_ok());
    }

    #[tokio::test]
    async fn test_fetch_many_skips_failures() {
        let start = Utc.with_ymd_and_hms(2025, 1, 2, 9, 0, 0).unwrap();
        let mut source = StaticSource::minutes(start, 60);
        source.missing.push("BAD".to_string());
        let service = MarketDataService::new(Arc::new(source));

        let params = FetchParams {
            tf_minutes: 15,
            timezone: OhlcTimezone::utc(),
            mode: DateMode::Lookback { output_candles: 3 },
        };
        let symbols = vec!["VCB".to_string(), "BAD".to_string(), "FPT".to_string()];
        let series = service.fetch_many(&symbols, &params).await;

        assert_eq!(series.len(), 2);
        assert_eq!(series[0].symbol, "VCB");
        assert_eq!(series[1].symbol, "FPT");
        assert_eq!(series[0].len(), 3);
        assert_eq!(series[0].last().unwrap().close, 160.0);
    }
}
