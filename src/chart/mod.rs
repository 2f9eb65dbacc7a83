//! Candlestick chart rendering: page layout first, then PDF output.

pub mod layout;
pub mod pdf;
pub mod style;

pub use layout::{ChartOptions, FigureSizing, build_page};
pub use pdf::render_pdf;
pub use style::ChartStyle;

use crate::data_structures::OhlcSeries;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("no series to plot")]
    NoSeries,
    #[error("series '{0}' has no candles")]
    EmptySeries(String),
    #[error("figure is too small for the chart margins")]
    FigureTooSmall,
    #[error("pdf rendering failed: {0}")]
    Pdf(String),
}

/// Lay out and render all series into one PDF.
pub fn render_series_pdf(series: &[OhlcSeries], options: &ChartOptions, style: &ChartStyle) -> Result<Vec<u8>, ChartError> {
    let page = build_page(series, options, style)?;
    let title = series.iter().map(|s| s.symbol.as_str()).collect::<Vec<_>>().join(" ");
    render_pdf(&page, &format!("Candlestick {}", title))
}
