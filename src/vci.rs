use crate::data_structures::RawBar;
use crate::market_data::{BaseInterval, MarketDataError, OhlcSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;
use reqwest::Client;
use serde_json::Value;
use std::time::{Duration as StdDuration, SystemTime};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

const MAX_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum VciError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("rejected by upstream with status {0}")]
    Rejected(u16),
    #[error("no data")]
    NoData,
}

pub struct VciClient {
    client: Client,
    base_url: String,
    rate_limit_per_minute: u32,
    request_timestamps: Vec<SystemTime>,
    user_agents: Vec<String>,
    random_agent: bool,
}

impl VciClient {
    pub fn with_base_url(base_url: &str, random_agent: bool, rate_limit_per_minute: u32) -> Result<Self, VciError> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()?;

        let user_agents = vec![
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0".to_string(),
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.3 Safari/605.1.15".to_string(),
        ];

        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(VciClient {
            client,
            base_url,
            rate_limit_per_minute: rate_limit_per_minute.max(1),
            request_timestamps: Vec::new(),
            user_agents,
            random_agent,
        })
    }

    fn get_interval_value(&self, interval: BaseInterval) -> &'static str {
        match interval {
            BaseInterval::OneMinute => "ONE_MINUTE",
            BaseInterval::OneHour => "ONE_HOUR",
            BaseInterval::OneDay => "ONE_DAY",
        }
    }

    fn get_user_agent(&self) -> String {
        let agent = if self.random_agent {
            self.user_agents.choose(&mut rand::rng())
        } else {
            self.user_agents.first()
        };
        agent.cloned().unwrap_or_default()
    }

    async fn enforce_rate_limit(&mut self) {
        let current_time = SystemTime::now();

        // Remove timestamps older than 1 minute
        self.request_timestamps.retain(|&timestamp| {
            current_time.duration_since(timestamp).unwrap_or(StdDuration::from_secs(0)) < StdDuration::from_secs(60)
        });

        if self.request_timestamps.len() >= self.rate_limit_per_minute as usize {
            if let Some(&oldest_request) = self.request_timestamps.first() {
                let elapsed = current_time.duration_since(oldest_request).unwrap_or(StdDuration::from_secs(0));
                let wait_time = StdDuration::from_secs(60).saturating_sub(elapsed);
                if !wait_time.is_zero() {
                    debug!(wait_ms = wait_time.as_millis(), "Rate limit reached, waiting");
                    sleep(wait_time + StdDuration::from_millis(100)).await;
                }
            }
        }

        self.request_timestamps.push(current_time);
    }

    async fn make_request(&mut self, url: &str, payload: &Value) -> Result<Value, VciError> {
        let mut last_error = VciError::InvalidResponse("Max retries exceeded".to_string());

        for attempt in 0..MAX_RETRIES {
            self.enforce_rate_limit().await;

            if attempt > 0 {
                let delay = StdDuration::from_secs_f64(2.0_f64.powi(attempt as i32 - 1) + rand::random::<f64>());
                let delay = delay.min(StdDuration::from_secs(60));
                debug!(attempt, delay_ms = delay.as_millis(), "Retrying VCI request");
                sleep(delay).await;
            }

            let user_agent = self.get_user_agent();

            let response = self.client
                .post(url)
                .header("Accept", "application/json, text/plain, */*")
                .header("Accept-Language", "en-US,en;q=0.9,vi-VN;q=0.8,vi;q=0.7")
                .header("Content-Type", "application/json")
                .header("Cache-Control", "no-cache")
                .header("Pragma", "no-cache")
                .header("Sec-Fetch-Dest", "empty")
                .header("Sec-Fetch-Mode", "cors")
                .header("Sec-Fetch-Site", "same-site")
                .header("User-Agent", user_agent)
                .header("Referer", "https://trading.vietcap.com.vn/")
                .header("Origin", "https://trading.vietcap.com.vn")
                .json(payload)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();

                    if status.is_success() {
                        match resp.json::<Value>().await {
                            Ok(data) => return Ok(data),
                            Err(e) => {
                                warn!(attempt, error = %e, "Failed to decode VCI response");
                                last_error = VciError::Http(e);
                            }
                        }
                    } else if status.as_u16() == 403 || status.as_u16() == 429 || status.is_server_error() {
                        warn!(attempt, %status, "VCI responded with retryable status");
                        last_error = VciError::Rejected(status.as_u16());
                    } else {
                        warn!(%status, "VCI rejected request");
                        return Err(VciError::Rejected(status.as_u16()));
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "VCI request failed");
                    last_error = VciError::Http(e);
                }
            }
        }

        Err(last_error)
    }

    /// Fetch `count_back` bars of `interval` resolution ending at `to`.
    pub async fn get_history(
        &mut self,
        symbol: &str,
        interval: BaseInterval,
        to: DateTime<Utc>,
        count_back: u32,
    ) -> Result<Vec<RawBar>, VciError> {
        let url = format!("{}chart/OHLCChart/gap-chart", self.base_url);
        let payload = serde_json::json!({
            "timeFrame": self.get_interval_value(interval),
            "symbols": [symbol],
            "to": to.timestamp(),
            "countBack": count_back
        });

        let response_data = self.make_request(&url, &payload).await?;
        parse_chart_response(&response_data)
    }
}

/// Decode the column-oriented `gap-chart` payload: `[{o: [], h: [], l: [],
/// c: [], v: [], t: []}]`. Timestamps arrive either as numbers or strings.
pub fn parse_chart_response(response_data: &Value) -> Result<Vec<RawBar>, VciError> {
    let data_item = response_data
        .as_array()
        .and_then(|items| items.first())
        .ok_or(VciError::NoData)?;

    let column = |key: &str| -> Result<&Vec<Value>, VciError> {
        data_item
            .get(key)
            .and_then(|v| v.as_array())
            .ok_or_else(|| VciError::InvalidResponse(format!("Missing key: {}", key)))
    };

    let opens = column("o")?;
    let highs = column("h")?;
    let lows = column("l")?;
    let closes = column("c")?;
    let volumes = column("v")?;
    let times = column("t")?;

    let length = times.len();
    if [opens.len(), highs.len(), lows.len(), closes.len(), volumes.len()].iter().any(|&len| len != length) {
        return Err(VciError::InvalidResponse("Inconsistent array lengths".to_string()));
    }

    let mut result = Vec::with_capacity(length);
    for i in 0..length {
        let timestamp = if let Some(ts_str) = times[i].as_str() {
            ts_str.parse::<i64>().map_err(|_| {
                VciError::InvalidResponse(format!("Cannot parse timestamp string '{}' at index {}", ts_str, i))
            })?
        } else if let Some(ts_int) = times[i].as_i64() {
            ts_int
        } else {
            return Err(VciError::InvalidResponse(format!("Invalid timestamp format at index {}: {:?}", i, &times[i])));
        };

        let time = DateTime::<Utc>::from_timestamp(timestamp, 0).ok_or_else(|| {
            VciError::InvalidResponse(format!("Cannot convert timestamp {} at index {}", timestamp, i))
        })?;

        // Missing prices become NaN and are dropped during cleaning
        result.push(RawBar {
            time,
            open: opens[i].as_f64().unwrap_or(f64::NAN),
            high: highs[i].as_f64().unwrap_or(f64::NAN),
            low: lows[i].as_f64().unwrap_or(f64::NAN),
            close: closes[i].as_f64().unwrap_or(f64::NAN),
            volume: volumes[i].as_f64().unwrap_or(0.0),
        });
    }

    result.sort_by_key(|bar| bar.time);
    Ok(result)
}

/// Shares one rate-limited [`VciClient`] across request handlers.
pub struct VciSource {
    client: Mutex<VciClient>,
}

impl VciSource {
    pub fn new(client: VciClient) -> Self {
        Self { client: Mutex::new(client) }
    }
}

#[async_trait]
impl OhlcSource for VciSource {
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: BaseInterval,
        to: DateTime<Utc>,
        count_back: u32,
    ) -> Result<Vec<RawBar>, MarketDataError> {
        let mut client = self.client.lock().await;
        match client.get_history(symbol, interval, to, count_back).await {
            Ok(bars) => Ok(bars),
            Err(VciError::NoData) => Err(MarketDataError::NoData(symbol.to_string())),
            Err(e) => Err(MarketDataError::Upstream {
                symbol: symbol.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VCI_BASE_URL: &str = "https://trading.vietcap.com.vn/api/";

    #[tokio::test]
    async fn test_vci_client_creation() {
        let client = VciClient::with_base_url(VCI_BASE_URL, true, 6);
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_interval_mapping() {
        let client = VciClient::with_base_url(VCI_BASE_URL, false, 6).unwrap();
        assert_eq!(client.get_interval_value(BaseInterval::OneDay), "ONE_DAY");
        assert_eq!(client.get_interval_value(BaseInterval::OneHour), "ONE_HOUR");
        assert_eq!(client.get_interval_value(BaseInterval::OneMinute), "ONE_MINUTE");
    }

    #[tokio::test]
    async fn test_base_url_gets_trailing_slash() {
        let client = VciClient::with_base_url("http://localhost:9/api", false, 6).unwrap();
        assert_eq!(client.base_url, "http://localhost:9/api/");
    }

    #[test]
    fn test_parse_chart_response() {
        let payload = serde_json::json!([{
            "o": [101.0, 100.0],
            "h": [103.0, 102.0],
            "l": [100.5, 99.0],
            "c": [102.5, 101.0],
            "v": [1500, 1200],
            "t": ["1735812060", 1735812000]
        }]);

        let bars = parse_chart_response(&payload).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].time.timestamp(), 1735812000);
        assert_eq!(bars[0].open, 100.0);
        assert_eq!(bars[1].volume, 1500.0);
    }

    #[test]
    fn test_parse_chart_response_errors() {
        assert!(matches!(parse_chart_response(&serde_json::json!([])), Err(VciError::NoData)));

        let missing = serde_json::json!([{ "o": [], "h": [], "l": [], "c": [], "v": [] }]);
        assert!(matches!(parse_chart_response(&missing), Err(VciError::InvalidResponse(_))));

        let ragged = serde_json::json!([{ "o": [1.0], "h": [], "l": [], "c": [], "v": [], "t": [] }]);
        assert!(matches!(parse_chart_response(&ragged), Err(VciError::InvalidResponse(_))));
    }
}
