//! Page geometry for stacked candlestick panels.
//!
//! Everything here works in PDF points with the origin at the bottom-left of
//! the page. Candles sit on an integer x axis (candle index), so gaps in
//! trading time do not show up as empty space.

use super::ChartError;
use super::style::{ChartStyle, Rgb};
use crate::data_structures::{Candle, OhlcSeries, timeframe_label};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

pub const POINTS_PER_INCH: f64 = 72.0;

// Glyph metrics approximating Helvetica, as fractions of the font size.
const CHAR_WIDTH: f64 = 0.56;
const ASCENT: f64 = 0.72;
const DESCENT: f64 = 0.21;

const MARGIN_TOP: f64 = 40.0;
const MARGIN_BOTTOM: f64 = 72.0;
const TICK_LENGTH: f64 = 4.0;
const TICK_GAP: f64 = 3.0;
const Y_TICK_TARGET: usize = 6;

/// Axes-y position of the last-datetime badge, just under the axes.
pub const DATETIME_LABEL_AXES_Y: f64 = -0.03;

/// How the figure is sized, in inches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FigureSizing {
    /// Scale the width with the candle count instead of using `width`.
    pub auto: bool,
    pub width: f64,
    pub height_per_panel: f64,
    pub width_per_candle: f64,
    pub min_width: f64,
    pub max_width: f64,
}

impl Default for FigureSizing {
    fn default() -> Self {
        Self {
            auto: false,
            width: 16.0,
            height_per_panel: 6.0,
            width_per_candle: 0.12,
            min_width: 12.0,
            max_width: 300.0,
        }
    }
}

/// Figure `(width, height_per_panel)` in inches for a panel showing `candles`.
pub fn figure_size(candles: usize, sizing: &FigureSizing) -> (f64, f64) {
    if !sizing.auto {
        return (sizing.width, sizing.height_per_panel);
    }

    let width = candles as f64 * sizing.width_per_candle;
    let width = width.min(sizing.max_width).max(sizing.min_width);
    (width, sizing.height_per_panel)
}

#[derive(Debug, Clone)]
pub struct ChartOptions {
    pub sizing: FigureSizing,
    /// Body width in candle units.
    pub candle_width: f64,
    /// Extra candles of empty space right of the last candle.
    pub right_margin: f64,
}

impl Default for ChartOptions {
    fn default() -> Self {
        Self {
            sizing: FigureSizing::default(),
            candle_width: 0.6,
            right_margin: 8.0,
        }
    }
}

/// Maps data and axes-fraction coordinates onto the page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxesTransform {
    pub x0: f64,
    pub y0: f64,
    pub width: f64,
    pub height: f64,
    pub xlim: (f64, f64),
    pub ylim: (f64, f64),
}

impl AxesTransform {
    pub fn data_x(&self, x: f64) -> f64 {
        self.x0 + (x - self.xlim.0) / (self.xlim.1 - self.xlim.0) * self.width
    }

    pub fn data_y(&self, y: f64) -> f64 {
        self.y0 + (y - self.ylim.0) / (self.ylim.1 - self.ylim.0) * self.height
    }

    pub fn data_to_page(&self, x: f64, y: f64) -> (f64, f64) {
        (self.data_x(x), self.data_y(y))
    }

    /// `(0, 0)` is the bottom-left corner of the axes, `(1, 1)` the top-right.
    pub fn axes_to_page(&self, ax: f64, ay: f64) -> (f64, f64) {
        (self.x0 + ax * self.width, self.y0 + ay * self.height)
    }

    /// x in data coordinates, y as a fraction of the axes height.
    pub fn blended(&self, x: f64, ay: f64) -> (f64, f64) {
        (self.data_x(x), self.y0 + ay * self.height)
    }

    /// Page distance covered by one candle.
    pub fn x_scale(&self) -> f64 {
        self.width / (self.xlim.1 - self.xlim.0)
    }

    pub fn right(&self) -> f64 {
        self.x0 + self.width
    }

    pub fn top(&self) -> f64 {
        self.y0 + self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stroke {
    pub color: Rgb,
    pub width: f64,
    /// Dash and gap lengths in points.
    pub dash: Option<(f64, f64)>,
}

impl Stroke {
    pub fn solid(color: Rgb, width: f64) -> Self {
        Self { color, width, dash: None }
    }

    pub fn dashed(color: Rgb, width: f64) -> Self {
        Self {
            color,
            width,
            dash: Some((4.0 * width, 2.5 * width)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextShape {
    /// Baseline origin of the first glyph.
    pub x: f64,
    pub y: f64,
    pub text: String,
    pub size: f64,
    pub color: Rgb,
    pub bold: bool,
    /// Counter-clockwise, in degrees.
    pub rotation: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Rect {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        fill: Option<Rgb>,
        stroke: Option<Stroke>,
    },
    Line {
        points: Vec<(f64, f64)>,
        stroke: Stroke,
    },
    Text(TextShape),
}

/// Where a labelled box ended up, useful for checking placement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxBounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoxBounds {
    pub fn center_x(&self) -> f64 {
        self.x + self.width / 2.0
    }

    pub fn center_y(&self) -> f64 {
        self.y + self.height / 2.0
    }

    pub fn top(&self) -> f64 {
        self.y + self.height
    }
}

#[derive(Debug, Clone)]
pub struct Panel {
    pub symbol: String,
    pub axes: AxesTransform,
    pub last_price_label: Option<BoxBounds>,
    pub last_datetime_label: Option<BoxBounds>,
}

/// Fully laid out page, ready for a renderer.
#[derive(Debug, Clone)]
pub struct ChartPage {
    pub width: f64,
    pub height: f64,
    pub background: Rgb,
    pub panels: Vec<Panel>,
    pub shapes: Vec<Shape>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HAlign {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VAlign {
    Top,
    Center,
}

pub fn text_width(text: &str, size: f64) -> f64 {
    text.chars().count() as f64 * size * CHAR_WIDTH
}

fn place_text(x: f64, y: f64, text: &str, size: f64, color: Rgb, bold: bool, ha: HAlign, va: VAlign) -> TextShape {
    let width = text_width(text, size);
    let x = match ha {
        HAlign::Left => x,
        HAlign::Center => x - width / 2.0,
        HAlign::Right => x - width,
    };
    let y = match va {
        VAlign::Top => y - ASCENT * size,
        VAlign::Center => y - ASCENT * size / 2.0,
    };
    TextShape {
        x,
        y,
        text: text.to_string(),
        size,
        color,
        bold,
        rotation: 0.0,
    }
}

struct Badge<'a> {
    text: &'a str,
    size: f64,
    text_color: Rgb,
    fill: Rgb,
    edge: Option<Stroke>,
    /// Padding as a fraction of the font size.
    pad: f64,
}

/// Text inside a filled box anchored at `(x, y)`.
fn badge(shapes: &mut Vec<Shape>, b: Badge<'_>, x: f64, y: f64, ha: HAlign, va: VAlign) -> BoxBounds {
    let pad = b.pad * b.size;
    let width = text_width(b.text, b.size) + 2.0 * pad;
    let height = (ASCENT + DESCENT) * b.size + 2.0 * pad;

    let bx = match ha {
        HAlign::Left => x,
        HAlign::Center => x - width / 2.0,
        HAlign::Right => x - width,
    };
    let by = match va {
        VAlign::Top => y - height,
        VAlign::Center => y - height / 2.0,
    };

    shapes.push(Shape::Rect {
        x: bx,
        y: by,
        width,
        height,
        fill: Some(b.fill),
        stroke: b.edge,
    });
    shapes.push(Shape::Text(TextShape {
        x: bx + pad,
        y: by + pad + DESCENT * b.size,
        text: b.text.to_string(),
        size: b.size,
        color: b.text_color,
        bold: false,
        rotation: 0.0,
    }));

    BoxBounds { x: bx, y: by, width, height }
}

/// Format with `,` thousands separators and a fixed number of decimals.
pub fn format_number(value: f64, decimals: usize) -> String {
    let formatted = format!("{:.*}", decimals, value.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };

    let mut grouped = String::with_capacity(formatted.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if let Some(frac) = frac_part {
        grouped.push('.');
        grouped.push_str(frac);
    }

    let is_zero = formatted.chars().all(|c| c == '0' || c == '.');
    if value < 0.0 && !is_zero {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

/// Last-price badge text: more decimals for smaller prices.
pub fn format_price(price: f64) -> String {
    let decimals = if price.abs() >= 100.0 {
        2
    } else if price.abs() >= 1.0 {
        4
    } else {
        6
    };
    format_number(price, decimals)
}

pub fn format_last_datetime(time: &DateTime<FixedOffset>) -> String {
    time.format("%a %d %b '%y  %H:%M").to_string()
}

/// Pad the price range so candles do not touch the axes.
pub fn price_limits(candles: &[Candle], padding: f64) -> Option<(f64, f64)> {
    let low = candles.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let high = candles.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    if !low.is_finite() || !high.is_finite() {
        return None;
    }

    let range = high - low;
    let pad = if range > 0.0 {
        range * padding
    } else if high != 0.0 {
        high.abs() * 0.01
    } else {
        1.0
    };
    Some((low - pad, high + pad))
}

/// Round `value` to 1, 2, 2.5, 5 or 10 times a power of ten.
fn nice_step(value: f64) -> f64 {
    let exponent = value.log10().floor();
    let magnitude = 10f64.powf(exponent);
    let fraction = value / magnitude;
    let nice = if fraction <= 1.0 {
        1.0
    } else if fraction <= 2.0 {
        2.0
    } else if fraction <= 2.5 {
        2.5
    } else if fraction <= 5.0 {
        5.0
    } else {
        10.0
    };
    nice * magnitude
}

/// Evenly spaced round values inside `(lo, hi)` plus the decimals needed to
/// print them.
pub fn nice_ticks(lo: f64, hi: f64, target: usize) -> (Vec<f64>, usize) {
    if !(hi > lo) || target < 2 {
        return (Vec::new(), 0);
    }

    let step = nice_step((hi - lo) / (target - 1) as f64);
    let decimals = (0..=10)
        .find(|d| {
            let scaled = step * 10f64.powi(*d);
            (scaled - scaled.round()).abs() < 1e-6 * scaled.max(1.0)
        })
        .unwrap_or(10);
    let first = (lo / step).ceil() as i64;
    let last = (hi / step).floor() as i64;

    let ticks = (first..=last).map(|i| i as f64 * step).collect();
    (ticks, decimals as usize)
}

/// Lay out one panel per series, stacked top to bottom on a single page.
pub fn build_page(series: &[OhlcSeries], options: &ChartOptions, style: &ChartStyle) -> Result<ChartPage, ChartError> {
    if series.is_empty() {
        return Err(ChartError::NoSeries);
    }
    if let Some(empty) = series.iter().find(|s| s.is_empty()) {
        return Err(ChartError::EmptySeries(empty.symbol.clone()));
    }

    let max_candles = series.iter().map(OhlcSeries::len).max().unwrap_or(0);
    let (width_in, height_in) = figure_size(max_candles, &options.sizing);
    let page_width = width_in * POINTS_PER_INCH;
    let panel_height = height_in * POINTS_PER_INCH;
    let page_height = panel_height * series.len() as f64;

    let mut shapes = vec![Shape::Rect {
        x: 0.0,
        y: 0.0,
        width: page_width,
        height: page_height,
        fill: Some(style.bg_color),
        stroke: None,
    }];
    let mut panels = Vec::with_capacity(series.len());

    for (idx, s) in series.iter().enumerate() {
        let panel_top = page_height - idx as f64 * panel_height;
        let panel = layout_panel(&mut shapes, s, panel_top, panel_height, page_width, options, style)?;
        panels.push(panel);
    }

    Ok(ChartPage {
        width: page_width,
        height: page_height,
        background: style.bg_color,
        panels,
        shapes,
    })
}

fn layout_panel(
    shapes: &mut Vec<Shape>,
    series: &OhlcSeries,
    panel_top: f64,
    panel_height: f64,
    page_width: f64,
    options: &ChartOptions,
    style: &ChartStyle,
) -> Result<Panel, ChartError> {
    let candles = &series.candles;
    let ylim = price_limits(candles, style.y_padding).ok_or_else(|| ChartError::EmptySeries(series.symbol.clone()))?;
    let (y_ticks, y_decimals) = nice_ticks(ylim.0, ylim.1, Y_TICK_TARGET);
    let y_labels: Vec<String> = y_ticks.iter().map(|v| format_number(*v, y_decimals)).collect();

    // Room for the y tick labels and the axis label on the left, the price
    // badge on the right.
    let widest_y_label = y_labels.iter().map(|l| text_width(l, style.tick_fontsize)).fold(0.0, f64::max);
    let margin_left = 12.0 + style.label_fontsize + 6.0 + widest_y_label + TICK_LENGTH + TICK_GAP;
    let last = series.last().ok_or_else(|| ChartError::EmptySeries(series.symbol.clone()))?;
    let price_text = format!(" {} ", format_price(last.close));
    let margin_right = text_width(&price_text, style.last_price_fontsize) + 2.0 * 0.35 * style.last_price_fontsize + 12.0;

    let axes_width = page_width - margin_left - margin_right;
    let axes_height = panel_height - MARGIN_TOP - MARGIN_BOTTOM;
    if axes_width <= 0.0 || axes_height <= 0.0 {
        return Err(ChartError::FigureTooSmall);
    }

    let n = candles.len() as f64;
    let axes = AxesTransform {
        x0: margin_left,
        y0: panel_top - panel_height + MARGIN_BOTTOM,
        width: axes_width,
        height: axes_height,
        xlim: (-1.0, n + options.right_margin),
        ylim,
    };

    if style.show_grid {
        let stroke = if style.grid_dashed {
            Stroke::dashed(style.grid_color, 0.5)
        } else {
            Stroke::solid(style.grid_color, 0.5)
        };
        for tick in &y_ticks {
            let y = axes.data_y(*tick);
            shapes.push(Shape::Line {
                points: vec![(axes.x0, y), (axes.right(), y)],
                stroke,
            });
        }
    }

    draw_spines(shapes, &axes, style);
    draw_y_axis(shapes, &axes, &y_ticks, &y_labels, style);
    draw_x_axis(shapes, &axes, candles, style);
    draw_candles(shapes, &axes, candles, options.candle_width, style);

    let title = format!("{} - {}", series.symbol, timeframe_label(series.tf_minutes));
    shapes.push(Shape::Text(place_text(
        axes.x0,
        panel_top - 12.0,
        &title,
        style.title_fontsize,
        style.title_color,
        style.title_bold,
        HAlign::Left,
        VAlign::Top,
    )));

    let last_price_label = Some(draw_last_price(shapes, &axes, candles, &price_text, style));
    let last_datetime_label = Some(draw_last_datetime(shapes, &axes, last, candles.len(), style));

    Ok(Panel {
        symbol: series.symbol.clone(),
        axes,
        last_price_label,
        last_datetime_label,
    })
}

fn draw_spines(shapes: &mut Vec<Shape>, axes: &AxesTransform, style: &ChartStyle) {
    let stroke = Stroke::solid(style.spine_color, style.spine_linewidth);
    let mut spine = |from: (f64, f64), to: (f64, f64)| {
        shapes.push(Shape::Line { points: vec![from, to], stroke });
    };

    spine((axes.x0, axes.y0), (axes.right(), axes.y0));
    spine((axes.x0, axes.y0), (axes.x0, axes.top()));
    if style.show_top_spine {
        spine((axes.x0, axes.top()), (axes.right(), axes.top()));
    }
    if style.show_right_spine {
        spine((axes.right(), axes.y0), (axes.right(), axes.top()));
    }
}

fn draw_y_axis(shapes: &mut Vec<Shape>, axes: &AxesTransform, ticks: &[f64], labels: &[String], style: &ChartStyle) {
    let tick_stroke = Stroke::solid(style.tick_color, 0.8);

    for (value, label) in ticks.iter().zip(labels) {
        let y = axes.data_y(*value);
        shapes.push(Shape::Line {
            points: vec![(axes.x0 - TICK_LENGTH, y), (axes.x0, y)],
            stroke: tick_stroke,
        });
        shapes.push(Shape::Text(place_text(
            axes.x0 - TICK_LENGTH - TICK_GAP,
            y,
            label,
            style.tick_fontsize,
            style.tick_color,
            false,
            HAlign::Right,
            VAlign::Center,
        )));
    }

    // Axis label, rotated to read bottom to top
    let label = "Price";
    let size = style.label_fontsize;
    let center_y = axes.y0 + axes.height / 2.0;
    shapes.push(Shape::Text(TextShape {
        x: 12.0 + ASCENT * size,
        y: center_y - text_width(label, size) / 2.0,
        text: label.to_string(),
        size,
        color: style.label_color,
        bold: false,
        rotation: 90.0,
    }));
}

/// Candle index step so that rotated tick labels do not overlap.
pub fn x_tick_step(axes: &AxesTransform, label_width: f64, label_size: f64, rotation: f64) -> usize {
    let theta = rotation.to_radians();
    let footprint = if theta.sin().abs() > 0.1 {
        // Rotated labels stack along the axis by their line height
        (label_size * 1.6 / theta.sin().abs()).min(label_width + 8.0)
    } else {
        label_width + 8.0
    };
    let per_candle = axes.x_scale();
    if per_candle <= 0.0 {
        return 1;
    }
    (footprint / per_candle).ceil().max(1.0) as usize
}

fn draw_x_axis(shapes: &mut Vec<Shape>, axes: &AxesTransform, candles: &[Candle], style: &ChartStyle) {
    let size = style.tick_fontsize;
    let sample = candles[0].time.format(&style.date_format).to_string();
    let step = x_tick_step(axes, text_width(&sample, size), size, style.rotation);
    let tick_stroke = Stroke::solid(style.tick_color, 0.8);

    let theta = style.rotation.to_radians();
    let (sin, cos) = theta.sin_cos();

    for (i, candle) in candles.iter().enumerate().step_by(step) {
        let x = axes.data_x(i as f64);
        shapes.push(Shape::Line {
            points: vec![(x, axes.y0), (x, axes.y0 - TICK_LENGTH)],
            stroke: tick_stroke,
        });

        let label = candle.time.format(&style.date_format).to_string();
        let width = text_width(&label, size);
        let anchor_y = axes.y0 - TICK_LENGTH - TICK_GAP;

        if sin.abs() > 0.1 {
            // Right end of the rotated label sits under the tick
            let centre_shift = ASCENT * size / 2.0;
            shapes.push(Shape::Text(TextShape {
                x: x - width * cos + centre_shift * sin,
                y: anchor_y - width * sin - centre_shift * cos,
                text: label,
                size,
                color: style.tick_color,
                bold: false,
                rotation: style.rotation,
            }));
        } else {
            shapes.push(Shape::Text(place_text(
                x,
                anchor_y,
                &label,
                size,
                style.tick_color,
                false,
                HAlign::Center,
                VAlign::Top,
            )));
        }
    }
}

fn draw_candles(shapes: &mut Vec<Shape>, axes: &AxesTransform, candles: &[Candle], candle_width: f64, style: &ChartStyle) {
    let half_body = candle_width.clamp(0.05, 1.0) / 2.0 * axes.x_scale();
    let wick_width = (axes.x_scale() * 0.1).clamp(0.4, 1.2);

    for (i, candle) in candles.iter().enumerate() {
        let body_color = if candle.is_bullish() { style.up_color } else { style.down_color };
        let x = axes.data_x(i as f64);

        shapes.push(Shape::Line {
            points: vec![(x, axes.data_y(candle.low)), (x, axes.data_y(candle.high))],
            stroke: Stroke::solid(style.wick_color.unwrap_or(body_color), wick_width),
        });

        let top = axes.data_y(candle.open.max(candle.close));
        let bottom = axes.data_y(candle.open.min(candle.close));
        let height = (top - bottom).max(0.6);
        shapes.push(Shape::Rect {
            x: x - half_body,
            y: bottom,
            width: half_body * 2.0,
            height,
            fill: Some(body_color),
            stroke: style.edge_color.map(|c| Stroke::solid(c, 0.6)),
        });
    }
}

/// Dashed line from the last candle to the right edge, with the price in a
/// badge just outside the axes.
fn draw_last_price(shapes: &mut Vec<Shape>, axes: &AxesTransform, candles: &[Candle], text: &str, style: &ChartStyle) -> BoxBounds {
    let last_x = (candles.len() - 1) as f64;
    let last_price = candles[candles.len() - 1].close;
    let (x_left, y) = axes.data_to_page(last_x, last_price);
    let x_right = axes.data_x(axes.xlim.1);

    shapes.push(Shape::Line {
        points: vec![(x_left, y), (x_right, y)],
        stroke: Stroke::dashed(style.last_price_color, 1.5),
    });

    badge(
        shapes,
        Badge {
            text,
            size: style.last_price_fontsize,
            text_color: style.last_price_text_color,
            fill: style.last_price_color,
            edge: None,
            pad: 0.35,
        },
        x_right,
        y,
        HAlign::Left,
        VAlign::Center,
    )
}

/// Datetime badge centred under the last candle, hanging below the axes.
fn draw_last_datetime(shapes: &mut Vec<Shape>, axes: &AxesTransform, last: &Candle, count: usize, style: &ChartStyle) -> BoxBounds {
    let (x, y) = axes.blended((count - 1) as f64, DATETIME_LABEL_AXES_Y);
    let text = format_last_datetime(&last.time);

    badge(
        shapes,
        Badge {
            text: &text,
            size: style.datetime_fontsize,
            text_color: style.datetime_text_color,
            fill: style.datetime_box_color,
            edge: Some(Stroke::solid(style.datetime_edge_color, 1.0)),
            pad: 0.45,
        },
        x,
        y,
        HAlign::Center,
        VAlign::Top,
    )
}
