use crate::chart::{ChartStyle, FigureSizing};
use crate::utils::OhlcTimezone;
use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

// Upstream market data provider settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub rate_limit_per_minute: u32,
    pub random_agent: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://trading.vietcap.com.vn/api/".to_string(),
            rate_limit_per_minute: 30,
            random_agent: true,
        }
    }
}

// Defaults applied when a request leaves a field out
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestDefaults {
    pub tf_minutes: u32,
    pub output_candles: usize,
    pub timezone: String,
    pub candle_width: f64,
    pub right_margin: f64,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            tf_minutes: 15,
            output_candles: 85,
            timezone: "utc+3:30".to_string(),
            candle_width: 0.6,
            right_margin: 8.0,
        }
    }
}

// Per-IP request throttling on the API routes
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_second: u64,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 10,
            burst_size: 20,
        }
    }
}

// YAML-serializable configuration structure
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
pub struct ConfigYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub environment: Option<String>,
    pub temp_dir: Option<String>,
    pub upload_ttl_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    pub provider: ProviderConfig,
    pub defaults: RequestDefaults,
    pub sizing: FigureSizing,
    pub rate_limit: RateLimitConfig,
    pub style: ChartStyle,
}

// Holds application-wide settings
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub temp_dir: PathBuf,
    pub upload_ttl: Duration,
    pub cleanup_interval: Duration,
    pub provider: ProviderConfig,
    pub defaults: RequestDefaults,
    pub sizing: FigureSizing,
    pub rate_limit: RateLimitConfig,
    pub style: ChartStyle,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_yaml_config(ConfigYaml::default())
    }
}

impl AppConfig {
    // Load configuration from YAML file or environment variables
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let config = if let Ok(config_file) = env::var("CONFIG_FILE") {
            Self::from_yaml(&config_file)?
        } else {
            Self::from_env()?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(file_path: &str) -> Result<Self, ConfigError> {
        let yaml_content = fs::read_to_string(file_path).map_err(|source| ConfigError::Read {
            path: file_path.to_string(),
            source,
        })?;
        Self::from_yaml_str(&yaml_content)
    }

    pub fn from_yaml_str(yaml_content: &str) -> Result<Self, ConfigError> {
        let yaml_config: ConfigYaml = serde_yaml::from_str(yaml_content)?;
        Ok(Self::from_yaml_config(yaml_config))
    }

    fn from_yaml_config(yaml_config: ConfigYaml) -> Self {
        Self {
            host: yaml_config.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: yaml_config.port.unwrap_or(5000),
            environment: yaml_config.environment.unwrap_or_else(|| "development".to_string()),
            temp_dir: PathBuf::from(yaml_config.temp_dir.unwrap_or_else(|| "temp".to_string())),
            upload_ttl: Duration::from_secs(yaml_config.upload_ttl_secs.unwrap_or(86_400)),
            cleanup_interval: Duration::from_secs(yaml_config.cleanup_interval_secs.unwrap_or(3_600)),
            provider: yaml_config.provider,
            defaults: yaml_config.defaults,
            sizing: yaml_config.sizing,
            rate_limit: yaml_config.rate_limit,
            style: yaml_config.style,
        }
    }

    // Load all configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(host) = lookup("HOST") {
            config.host = host;
        }
        if let Some(environment) = lookup("ENVIRONMENT") {
            config.environment = environment;
        }
        if let Some(temp_dir) = lookup("TEMP_DIR") {
            config.temp_dir = PathBuf::from(temp_dir);
        }
        if let Some(base_url) = lookup("VCI_BASE_URL") {
            config.provider.base_url = base_url;
        }
        if let Some(timezone) = lookup("DEFAULT_TIMEZONE") {
            config.defaults.timezone = timezone;
        }

        if let Some(port) = parse_var(&lookup, "PORT")? {
            config.port = port;
        }
        if let Some(secs) = parse_var(&lookup, "UPLOAD_TTL_SECS")? {
            config.upload_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "CLEANUP_INTERVAL_SECS")? {
            config.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(limit) = parse_var(&lookup, "VCI_RATE_LIMIT_PER_MINUTE")? {
            config.provider.rate_limit_per_minute = limit;
        }
        if let Some(random_agent) = parse_var(&lookup, "VCI_RANDOM_AGENT")? {
            config.provider.random_agent = random_agent;
        }
        if let Some(per_second) = parse_var(&lookup, "RATE_LIMIT_PER_SECOND")? {
            config.rate_limit.per_second = per_second;
        }
        if let Some(burst) = parse_var(&lookup, "RATE_LIMIT_BURST")? {
            config.rate_limit.burst_size = burst;
        }
        if let Some(tf) = parse_var(&lookup, "DEFAULT_TF")? {
            config.defaults.tf_minutes = tf;
        }
        if let Some(candles) = parse_var(&lookup, "DEFAULT_OUTPUT_CANDLES")? {
            config.defaults.output_candles = candles;
        }
        if let Some(width) = parse_var(&lookup, "CHART_WIDTH")? {
            config.sizing.width = width;
        }
        if let Some(height) = parse_var(&lookup, "CHART_HEIGHT")? {
            config.sizing.height_per_panel = height;
        }

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        OhlcTimezone::parse(&self.defaults.timezone).map_err(|_| ConfigError::InvalidValue {
            key: "DEFAULT_TIMEZONE",
            value: self.defaults.timezone.clone(),
        })?;
        if StrftimeItems::new(&self.style.date_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::InvalidValue {
                key: "style.date_format",
                value: self.style.date_format.clone(),
            });
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "CLEANUP_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }
        if self.rate_limit.per_second == 0 || self.rate_limit.burst_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RATE_LIMIT",
                value: format!("{}/{}", self.rate_limit.per_second, self.rate_limit.burst_size),
            });
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.temp_dir, PathBuf::from("temp"));
        assert_eq!(config.defaults.timezone, "utc+3:30");
        assert_eq!(config.defaults.output_candles, 85);
        assert_eq!(config.sizing.width, 16.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("PORT", "8080"),
            ("TEMP_DIR", "/tmp/uploads"),
            ("VCI_RANDOM_AGENT", "false"),
            ("UPLOAD_TTL_SECS", "60"),
            ("CHART_WIDTH", "20.5"),
        ]))
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.temp_dir, PathBuf::from("/tmp/uploads"));
        assert!(!config.provider.random_agent);
        assert_eq!(config.upload_ttl, Duration::from_secs(60));
        assert_eq!(config.sizing.width, 20.5);
    }

    #[test]
    fn test_invalid_env_value() {
        let err = AppConfig::from_lookup(lookup_from(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "PORT", .. }));
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r##"
port: 9000
environment: production
temp_dir: /var/tmp/ohlc
defaults:
  tf_minutes: 60
  timezone: Asia/Tehran
sizing:
  auto: true
style:
  up_color: "#26a69a"
"##;
        let config = AppConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.environment, "production");
        assert_eq!(config.defaults.tf_minutes, 60);
        assert_eq!(config.defaults.output_candles, 85);
        assert!(config.sizing.auto);
        assert_eq!(config.sizing.width_per_candle, 0.12);
        assert_eq!(config.style.up_color.to_string(), "#26a69a");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_timezone() {
        let mut config = AppConfig::default();
        config.defaults.timezone = "nowhere".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_cleanup_interval() {
        let config = AppConfig::from_lookup(lookup_from(&[("CLEANUP_INTERVAL_SECS", "0")])).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "CLEANUP_INTERVAL_SECS", .. }));
    }

    #[test]
    fn test_validate_rejects_bad_date_format() {
        let mut config = AppConfig::default();
        config.style.date_format = "%m/%d %Q".to_string();
        assert!(config.validate().is_err());
    }
}
