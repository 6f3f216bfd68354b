//! Caller-side helpers for the weather / URL shortener tool server.
//!
//! Each tool answers with `{"content": [{"type": "text", "text": ...}]}` where
//! the text is a fixed prose prefix followed by the upstream API's JSON.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current conditions for a coordinate.
pub const GET_WEATHER: &str = "getWeather";
/// Five-day forecast for a coordinate.
pub const FORECAST: &str = "get-next-5days-forecast-weather-from-latitude-and-longitude";
/// URL shortener.
pub const SHORTEN_URL: &str = "get-shortened-url";

/// Prose the server puts in front of every payload.
pub const API_RESPONSE_PREFIX: &str =
    "This response is returned from the api you need to parse it the following is the data returned from api: ";

/// Parameters for [`GET_WEATHER`] and [`FORECAST`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Parameters for [`SHORTEN_URL`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortenUrlParams {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Result object returned by every tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
}

/// Why a tool result could not be turned into its payload.
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("unexpected result structure: {0}")]
    Structure(#[source] serde_json::Error),

    #[error("result has no text content")]
    MissingText,

    #[error("unexpected text format: {0}")]
    UnexpectedFormat(String),

    #[error("invalid payload JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
}

impl ToolResult {
    /// Interpret the raw `result` of a tool call.
    pub fn from_value(value: serde_json::Value) -> Result<Self, PayloadError> {
        serde_json::from_value(value).map_err(PayloadError::Structure)
    }

    /// Text of the first content item, if any.
    pub fn text(&self) -> Option<&str> {
        self.content.first().and_then(|c| c.text.as_deref())
    }

    /// Strip [`API_RESPONSE_PREFIX`] from the first text item and parse the rest.
    pub fn payload(&self) -> Result<serde_json::Value, PayloadError> {
        let text = self.text().ok_or(PayloadError::MissingText)?;
        let json = text
            .strip_prefix(API_RESPONSE_PREFIX)
            .ok_or_else(|| PayloadError::UnexpectedFormat(text.to_string()))?;
        serde_json::from_str(json).map_err(PayloadError::InvalidJson)
    }
}
