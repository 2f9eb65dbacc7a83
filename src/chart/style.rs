use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error};
use std::fmt;
use std::str::FromStr;

/// Opaque sRGB color parsed from `#rrggbb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const WHITE: Rgb = Rgb(0xff, 0xff, 0xff);

    pub fn hex(value: &str) -> Option<Self> {
        let digits = value.trim().strip_prefix('#').unwrap_or(value.trim());
        if digits.len() != 6 || !digits.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).ok();
        Some(Rgb(channel(0)?, channel(2)?, channel(4)?))
    }

    /// Channels scaled to `0.0..=1.0`.
    pub fn unit(&self) -> (f32, f32, f32) {
        (
            f32::from(self.0) / 255.0,
            f32::from(self.1) / 255.0,
            f32::from(self.2) / 255.0,
        )
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

impl FromStr for Rgb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Rgb::hex(s).ok_or_else(|| format!("invalid color '{}'", s))
    }
}

impl Serialize for Rgb {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Rgb {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

fn rgb(value: &str) -> Rgb {
    Rgb::hex(value).unwrap_or(Rgb::WHITE)
}

/// Colors, fonts and toggles for a candlestick panel. Defaults give the dark
/// TradingView-like look.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartStyle {
    pub bg_color: Rgb,
    pub up_color: Rgb,
    pub down_color: Rgb,
    /// Body outline; `None` draws bodies without an edge.
    pub edge_color: Option<Rgb>,
    /// Wick color; `None` reuses the body color.
    pub wick_color: Option<Rgb>,
    pub grid_color: Rgb,
    pub grid_dashed: bool,
    pub show_grid: bool,
    pub date_format: String,
    pub rotation: f64,
    pub title_fontsize: f64,
    pub title_bold: bool,
    pub title_color: Rgb,
    pub label_fontsize: f64,
    pub label_color: Rgb,
    pub tick_fontsize: f64,
    pub tick_color: Rgb,
    pub spine_color: Rgb,
    pub spine_linewidth: f64,
    pub show_top_spine: bool,
    pub show_right_spine: bool,
    pub y_padding: f64,
    pub last_price_color: Rgb,
    pub last_price_text_color: Rgb,
    pub last_price_fontsize: f64,
    pub datetime_box_color: Rgb,
    pub datetime_edge_color: Rgb,
    pub datetime_text_color: Rgb,
    pub datetime_fontsize: f64,
}

impl Default for ChartStyle {
    fn default() -> Self {
        Self {
            bg_color: rgb("#131722"),
            up_color: rgb("#fbc02d"),
            down_color: rgb("#9598a1"),
            edge_color: None,
            wick_color: None,
            grid_color: rgb("#e0e0e0"),
            grid_dashed: true,
            show_grid: false,
            date_format: "%m/%d %H:%M".to_string(),
            rotation: 45.0,
            title_fontsize: 14.0,
            title_bold: true,
            title_color: Rgb::WHITE,
            label_fontsize: 11.0,
            label_color: rgb("#d1d4dc"),
            tick_fontsize: 9.0,
            tick_color: rgb("#787b86"),
            spine_color: rgb("#2a2e39"),
            spine_linewidth: 1.0,
            show_top_spine: false,
            show_right_spine: false,
            y_padding: 0.05,
            last_price_color: rgb("#2962ff"),
            last_price_text_color: Rgb::WHITE,
            last_price_fontsize: 9.0,
            datetime_box_color: rgb("#2a2e39"),
            datetime_edge_color: rgb("#434651"),
            datetime_text_color: rgb("#d1d4dc"),
            datetime_fontsize: 10.0,
        }
    }
}
