//! Serde helpers for form-style JSON where numbers sometimes arrive as strings.

use serde::{Deserialize, Deserializer, de::Error};
use std::fmt::Display;
use std::str::FromStr;

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(serde_json::Number),
    Bool(bool),
    String(String),
}

/// Deserialize an optional value from a JSON number, bool or string. Empty
/// strings and `null` become `None`.
pub fn optional<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<NumberOrString> = Option::deserialize(deserializer)?;
    let text = match raw {
        None => return Ok(None),
        Some(NumberOrString::Number(n)) => n.to_string(),
        Some(NumberOrString::Bool(b)) => b.to_string(),
        Some(NumberOrString::String(s)) => s.trim().to_string(),
    };

    if text.is_empty() {
        return Ok(None);
    }

    // "15.0" for an integer field
    match text.parse::<T>() {
        Ok(value) => Ok(Some(value)),
        Err(e) => match text.strip_suffix(".0").map(str::parse::<T>) {
            Some(Ok(value)) => Ok(Some(value)),
            _ => Err(D::Error::custom(format!("invalid value '{}': {}", text, e))),
        },
    }
}
