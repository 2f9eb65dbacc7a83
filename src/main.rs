pub mod api;
pub mod chart;
pub mod config;
pub mod data_structures;
pub mod export;
pub mod market_data;
pub mod utils;
pub mod vci;
pub mod worker;

use crate::api::AppState;
use crate::market_data::MarketDataService;
use crate::utils::UploadStore;
use crate::vci::{VciClient, VciSource};
use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let app_config = config::AppConfig::load().context("failed to load configuration")?;

    tracing::info!("Starting ohlc-chart-service");
    tracing::info!(
        environment = %app_config.environment,
        port = app_config.port,
        temp_dir = ?app_config.temp_dir,
        timezone = %app_config.defaults.timezone,
        "Loaded configuration"
    );

    let vci_client = VciClient::with_base_url(
        &app_config.provider.base_url,
        app_config.provider.random_agent,
        app_config.provider.rate_limit_per_minute,
    )
    .context("failed to initialize VCI client")?;
    tracing::info!(base_url = %app_config.provider.base_url, "VCI client initialized");

    let uploads = UploadStore::new(&app_config.temp_dir);
    uploads.init().context("failed to create upload directory")?;

    tracing::info!("Spawning upload cleanup worker");
    tokio::spawn(worker::run(
        uploads.clone(),
        app_config.upload_ttl,
        app_config.cleanup_interval,
    ));

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(app_config.rate_limit.per_second)
            .burst_size(app_config.rate_limit.burst_size)
            .finish()
            .context("invalid rate limit configuration")?,
    );

    let addr: SocketAddr = format!("{}:{}", app_config.host, app_config.port)
        .parse()
        .context("invalid HOST/PORT")?;

    let app_state = AppState {
        market: MarketDataService::new(Arc::new(VciSource::new(vci_client))),
        uploads,
        config: Arc::new(app_config),
    };

    let app = api::router(app_state, |routes| routes.layer(GovernorLayer::new(governor_conf)))
        .layer(CorsLayer::permissive());

    tracing::info!(%addr, "Server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
