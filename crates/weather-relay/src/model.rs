//! Wire types: inbound requests, provider payloads, and outbound events.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::PipelineError;

/// A weather lookup request as it arrives on the inbound topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupRequest {
    pub city: String,
    #[serde(deserialize_with = "string_or_number")]
    pub lat: String,
    #[serde(deserialize_with = "string_or_number")]
    pub lon: String,
}

impl LookupRequest {
    pub fn new(city: impl Into<String>, lat: impl Into<String>, lon: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            lat: lat.into(),
            lon: lon.into(),
        }
    }

    /// Decode a JSON payload, rejecting requests without a city.
    pub fn from_json(payload: &[u8]) -> Result<Self, PipelineError> {
        let request: LookupRequest =
            serde_json::from_slice(payload).map_err(|e| PipelineError::Decode(e.to_string()))?;
        if request.city.trim().is_empty() {
            return Err(PipelineError::Decode("empty city".to_string()));
        }
        Ok(request)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Coordinates may be sent as strings or bare JSON numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Coordinate {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Coordinate::deserialize(deserializer)? {
        Coordinate::Text(s) => s,
        Coordinate::Number(n) => n.to_string(),
    })
}

// ── Provider payloads ───────────────────────────────────────────────

/// Wind block, passed through to the outbound event as delivered.
///
/// Kept as the raw JSON object: every key the provider sends (`speed`,
/// `deg`, `gust` or anything else) is republished unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Wind(pub Map<String, Value>);

/// `main` block: temperature in °C, pressure in hPa, humidity in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMain {
    pub temp: f64,
    pub pressure: f64,
    pub humidity: f64,
}

/// Current conditions response (`/weather`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCurrent {
    pub dt: i64,
    pub main: ProviderMain,
    pub wind: Wind,
}

/// One forecast point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderForecastEntry {
    pub dt: i64,
    pub main: ProviderMain,
    pub wind: Wind,
}

/// Forecast response (`/forecast`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderForecast {
    pub list: Vec<ProviderForecastEntry>,
}

/// The provider response pair for one coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSnapshot {
    pub current: ProviderCurrent,
    pub forecast: ProviderForecast,
}

// ── Outbound event ──────────────────────────────────────────────────

/// Current conditions in SI-friendly units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentConditions {
    pub wind: Wind,
    /// °C
    pub temp: f64,
    /// Pa
    #[serde(serialize_with = "whole_as_integer")]
    pub pressure: f64,
    /// 0..1
    pub humidity: f64,
    /// `YYYY-MM-DD`, UTC
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub wind: Wind,
    pub temp: f64,
    #[serde(serialize_with = "whole_as_integer")]
    pub pressure: f64,
    pub humidity: f64,
    /// `YYYY-MM-DD HH:MM:SS`, UTC
    pub dt: String,
}

/// The event published on the outbound topic, keyed by `city`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub timestamp: String,
    pub city: String,
    pub current: CurrentConditions,
    pub forecast: Vec<ForecastPoint>,
}

/// Whole values are written as JSON integers (`101200`, not `101200.0`).
fn whole_as_integer<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}
