use crate::chart::{self, ChartError, ChartOptions, FigureSizing};
use crate::config::{AppConfig, RequestDefaults};
use crate::data_structures::OhlcSeries;
use crate::export::{self, ExportError};
use crate::market_data::{DateMode, FetchParams, MarketDataError, MarketDataService, apply_window, regroup_series};
use crate::utils::{OhlcTimezone, TimezoneError, UploadError, UploadStore, lenient, parse_symbols};
use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, FromRef, Multipart, State,
        multipart::MultipartRejection,
        rejection::JsonRejection,
    },
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

const INDEX_HTML: &str = include_str!("../static/index.html");
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

pub type SharedConfig = Arc<AppConfig>;

#[derive(Clone)]
pub struct AppState {
    pub market: MarketDataService,
    pub uploads: UploadStore,
    pub config: SharedConfig,
}

impl FromRef<AppState> for MarketDataService {
    fn from_ref(app_state: &AppState) -> MarketDataService {
        app_state.market.clone()
    }
}

impl FromRef<AppState> for UploadStore {
    fn from_ref(app_state: &AppState) -> UploadStore {
        app_state.uploads.clone()
    }
}

impl FromRef<AppState> for SharedConfig {
    fn from_ref(app_state: &AppState) -> SharedConfig {
        app_state.config.clone()
    }
}

// --- Errors ---

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(message) => {
                error!(error = %message, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<MarketDataError> for ApiError {
    fn from(e: MarketDataError) -> Self {
        match e {
            MarketDataError::InvalidRequest(_) | MarketDataError::Timezone(_) => ApiError::BadRequest(e.to_string()),
            MarketDataError::Upstream { .. } | MarketDataError::NoData(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<TimezoneError> for ApiError {
    fn from(e: TimezoneError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::InvalidKey(_) => ApiError::BadRequest(e.to_string()),
            UploadError::NotFound(_) => ApiError::NotFound(e.to_string()),
            UploadError::Io(_) | UploadError::Serialization(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<ExportError> for ApiError {
    fn from(e: ExportError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<ChartError> for ApiError {
    fn from(e: ChartError) -> Self {
        match e {
            ChartError::NoSeries | ChartError::EmptySeries(_) => {
                ApiError::BadRequest("No data available to plot".to_string())
            }
            ChartError::FigureTooSmall => ApiError::BadRequest(e.to_string()),
            ChartError::Pdf(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// --- Requests ---

/// Date selection fields shared by the fetch endpoints.
struct WindowFields<'a> {
    tf: Option<u32>,
    date_mode: Option<&'a str>,
    timezone: Option<&'a str>,
    output_candles: Option<usize>,
    from_date: Option<&'a str>,
    to_date: Option<&'a str>,
}

impl WindowFields<'_> {
    fn timezone(&self, defaults: &RequestDefaults) -> Result<OhlcTimezone, ApiError> {
        Ok(OhlcTimezone::parse(self.timezone.unwrap_or(&defaults.timezone))?)
    }

    fn date_mode(&self, defaults: &RequestDefaults, timezone: &OhlcTimezone) -> Result<DateMode, ApiError> {
        Ok(DateMode::from_request(
            self.date_mode.unwrap_or("lookback"),
            self.output_candles.unwrap_or(defaults.output_candles),
            self.from_date,
            self.to_date,
            timezone,
        )?)
    }

    fn fetch_params(&self, defaults: &RequestDefaults) -> Result<FetchParams, ApiError> {
        let timezone = self.timezone(defaults)?;
        let params = FetchParams {
            tf_minutes: self.tf.unwrap_or(defaults.tf_minutes),
            mode: self.date_mode(defaults, &timezone)?,
            timezone,
        };
        params.validate()?;
        Ok(params)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DownloadCsvRequest {
    #[serde(alias = "symbols")]
    pub asset: String,
    #[serde(deserialize_with = "lenient::optional")]
    pub tf: Option<u32>,
    pub date_mode: Option<String>,
    pub timezone: Option<String>,
    #[serde(deserialize_with = "lenient::optional")]
    pub output_candles: Option<usize>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
}

impl DownloadCsvRequest {
    fn window(&self) -> WindowFields<'_> {
        WindowFields {
            tf: self.tf,
            date_mode: self.date_mode.as_deref(),
            timezone: self.timezone.as_deref(),
            output_candles: self.output_candles,
            from_date: self.from_date.as_deref(),
            to_date: self.to_date.as_deref(),
        }
    }
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    #[default]
    Fetch,
    Upload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GeneratePdfRequest {
    pub data_source: DataSource,
    #[serde(alias = "asset")]
    pub symbols: String,
    pub temp_key: Option<String>,
    #[serde(deserialize_with = "lenient::optional")]
    pub tf: Option<u32>,
    pub timezone: Option<String>,
    #[serde(deserialize_with = "lenient::optional")]
    pub chart_width: Option<f64>,
    #[serde(deserialize_with = "lenient::optional")]
    pub chart_height: Option<f64>,
    #[serde(deserialize_with = "lenient::optional")]
    pub candle_width: Option<f64>,
    #[serde(deserialize_with = "lenient::optional")]
    pub right_margin: Option<f64>,
    #[serde(deserialize_with = "lenient::optional")]
    pub auto_size: Option<bool>,
    pub date_mode: Option<String>,
    #[serde(deserialize_with = "lenient::optional")]
    pub output_candles: Option<usize>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
}

impl GeneratePdfRequest {
    fn window(&self) -> WindowFields<'_> {
        WindowFields {
            tf: self.tf,
            date_mode: self.date_mode.as_deref(),
            timezone: self.timezone.as_deref(),
            output_candles: self.output_candles,
            from_date: self.from_date.as_deref(),
            to_date: self.to_date.as_deref(),
        }
    }

    fn chart_options(&self, config: &AppConfig) -> Result<ChartOptions, ApiError> {
        let width = self.chart_width.unwrap_or(config.sizing.width);
        let height = self.chart_height.unwrap_or(config.sizing.height_per_panel);
        let candle_width = self.candle_width.unwrap_or(config.defaults.candle_width);
        let right_margin = self.right_margin.unwrap_or(config.defaults.right_margin);

        if !(width.is_finite() && width > 0.0 && height.is_finite() && height > 0.0) {
            return Err(ApiError::BadRequest(
                "chart_width and chart_height must be positive numbers".to_string(),
            ));
        }
        if !(candle_width > 0.0 && candle_width <= 1.0) {
            return Err(ApiError::BadRequest("candle_width must be in (0, 1]".to_string()));
        }
        if !(right_margin.is_finite() && right_margin >= 0.0) {
            return Err(ApiError::BadRequest("right_margin must not be negative".to_string()));
        }

        Ok(ChartOptions {
            sizing: FigureSizing {
                auto: self.auto_size.unwrap_or(config.sizing.auto),
                width,
                height_per_panel: height,
                ..config.sizing.clone()
            },
            candle_width,
            right_margin,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    pub temp_key: String,
    pub symbols: Vec<String>,
    pub message: String,
}

// --- Handlers ---

pub async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn attachment(content_type: &str, filename: &str, body: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", filename)),
        ],
        body,
    )
        .into_response()
}

#[instrument(skip_all, fields(asset = %payload.as_ref().map(|p| p.asset.as_str()).unwrap_or("")))]
pub async fn download_csv_handler(
    State(market): State<MarketDataService>,
    State(config): State<SharedConfig>,
    payload: Result<Json<DownloadCsvRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let symbols = parse_symbols(&request.asset);
    if symbols.is_empty() {
        return Err(ApiError::BadRequest("Please provide at least one symbol".to_string()));
    }

    let params = request.window().fetch_params(&config.defaults)?;
    debug!(?symbols, tf = params.tf_minutes, mode = ?params.mode, "Fetching data for CSV download");

    let all_series = market.fetch_many(&symbols, &params).await;
    let now = Utc::now();

    match all_series.as_slice() {
        [] => Err(ApiError::BadRequest("No data could be fetched for any symbol".to_string())),
        [series] => {
            let body = export::write_csv(series)?;
            info!(symbol = %series.symbol, candles = series.len(), "Serving CSV download");
            Ok(attachment("text/csv", &export::csv_filename(&series.symbol, series.tf_minutes, now), body))
        }
        many => {
            let body = export::write_zip(many, now)?;
            info!(files = many.len(), size = body.len(), "Serving ZIP download");
            Ok(attachment("application/zip", &export::zip_filename(now), body))
        }
    }
}

fn load_uploaded(
    uploads: &UploadStore,
    request: &GeneratePdfRequest,
    defaults: &RequestDefaults,
) -> Result<Vec<OhlcSeries>, ApiError> {
    let key = request
        .temp_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ApiError::BadRequest("temp_key is required for uploaded data".to_string()))?;

    let bundle = uploads.load(key)?;
    let wanted = parse_symbols(&request.symbols);
    let window = request.window();
    let timezone = window.timezone(defaults)?;
    let mode = window.date_mode(defaults, &timezone)?;

    let mut series = Vec::new();
    for stored in bundle.series {
        if !wanted.is_empty() && !wanted.iter().any(|w| w.eq_ignore_ascii_case(&stored.symbol)) {
            continue;
        }
        // Without an explicit tf the upload keeps its own timeframe
        let tf = request.tf.unwrap_or(stored.tf_minutes);
        let mut regrouped = regroup_series(stored, tf, &timezone)?;
        regrouped.candles = apply_window(regrouped.candles, &mode);
        if !regrouped.is_empty() {
            series.push(regrouped);
        }
    }

    Ok(series)
}

#[instrument(skip_all, fields(source = ?payload.as_ref().map(|p| &p.data_source).ok()))]
pub async fn generate_pdf_handler(
    State(market): State<MarketDataService>,
    State(uploads): State<UploadStore>,
    State(config): State<SharedConfig>,
    payload: Result<Json<GeneratePdfRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let options = request.chart_options(&config)?;

    let all_series = match request.data_source {
        DataSource::Fetch => {
            let symbols = parse_symbols(&request.symbols);
            if symbols.is_empty() {
                return Err(ApiError::BadRequest("Please provide at least one symbol".to_string()));
            }
            let params = request.window().fetch_params(&config.defaults)?;
            market.fetch_many(&symbols, &params).await
        }
        DataSource::Upload => load_uploaded(&uploads, &request, &config.defaults)?,
    };

    if all_series.is_empty() {
        return Err(ApiError::BadRequest("No data available to plot".to_string()));
    }

    let symbols: Vec<String> = all_series.iter().map(|s| s.symbol.clone()).collect();
    let candles: usize = all_series.iter().map(OhlcSeries::len).sum();
    debug!(?symbols, candles, "Rendering chart");

    let style = config.style.clone();
    let bytes = tokio::task::spawn_blocking(move || chart::render_series_pdf(&all_series, &options, &style))
        .await
        .map_err(|e| ApiError::Internal(format!("chart rendering task failed: {}", e)))??;

    info!(?symbols, size = bytes.len(), "Serving chart PDF");
    Ok(attachment("application/pdf", &export::pdf_filename(&symbols, Utc::now()), bytes))
}

#[instrument(skip_all)]
pub async fn upload_csv_handler(
    State(uploads): State<UploadStore>,
    State(config): State<SharedConfig>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut multipart = multipart.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let mut saw_files = false;
    let mut loaded: Vec<OhlcSeries> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() != Some("files") {
            continue;
        }
        saw_files = true;

        let filename = field.file_name().unwrap_or_default().to_string();
        let Some(symbol) = export::symbol_from_filename(&filename) else {
            debug!(filename, "Skipping non-CSV upload");
            continue;
        };

        let bytes = field.bytes().await.map_err(|e| ApiError::BadRequest(e.body_text()))?;
        match export::read_csv(&bytes) {
            Ok(candles) => {
                let tf = export::infer_timeframe(&candles).unwrap_or(config.defaults.tf_minutes);
                info!(filename, symbol, candles = candles.len(), tf, "Loaded uploaded CSV");
                let series = OhlcSeries::new(symbol, tf, candles);
                match loaded.iter_mut().find(|s| s.symbol == series.symbol) {
                    Some(existing) => *existing = series,
                    None => loaded.push(series),
                }
            }
            Err(e) => warn!(filename, error = %e, "Failed to load uploaded CSV"),
        }
    }

    if !saw_files {
        return Err(ApiError::BadRequest("No files uploaded".to_string()));
    }
    if loaded.is_empty() {
        return Err(ApiError::BadRequest("No valid CSV files loaded".to_string()));
    }

    let bundle = uploads.save(loaded, Utc::now())?;
    let symbols = bundle.symbols();
    info!(key = %bundle.key, ?symbols, "Stored upload bundle");

    Ok(Json(UploadResponse {
        success: true,
        message: format!("Successfully loaded {} CSV files", symbols.len()),
        temp_key: bundle.key,
        symbols,
    }))
}

/// Build the application router. `wrap_api` layers extra middleware (rate
/// limiting) onto the `/api` routes only.
pub fn router(state: AppState, wrap_api: impl FnOnce(Router<AppState>) -> Router<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/api/download-csv", post(download_csv_handler))
        .route("/api/generate-pdf", post(generate_pdf_handler))
        .route(
            "/api/upload-csv",
            post(upload_csv_handler).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        );

    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .merge(wrap_api(api_routes))
        .with_state(state)
}
