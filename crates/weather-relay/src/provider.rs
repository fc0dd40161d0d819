//! Weather provider client.
//!
//! A lookup is two independent calls against an OpenWeather-compatible API,
//! current conditions and forecast. Both must succeed; there are no partial
//! snapshots and no retries.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::FetchError;
use crate::model::{ProviderCurrent, ProviderForecast, RawSnapshot};

/// Default base URL for the provider API.
pub const DEFAULT_API_URL: &str = "https://api.openweathermap.org/data/2.5";

const CURRENT_ENDPOINT: &str = "weather";
const FORECAST_ENDPOINT: &str = "forecast";

/// Error bodies are cut to this many bytes before logging.
const MAX_ERROR_BODY: usize = 200;

/// Source of raw weather snapshots.
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn fetch(&self, lat: &str, lon: &str) -> Result<RawSnapshot, FetchError>;
}

/// Client for the `/weather` and `/forecast` endpoints.
#[derive(Debug, Clone)]
pub struct OpenWeatherClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenWeatherClient {
    /// Build a client; `timeout` bounds each HTTP call.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        lat: &str,
        lon: &str,
    ) -> Result<T, FetchError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("lat", lat),
                ("lon", lon),
                ("appid", self.api_key.as_str()),
                ("units", "metric"),
            ])
            .send()
            .await
            .map_err(|source| FetchError::Http { endpoint, source })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| FetchError::Http { endpoint, source })?;

        if !status.is_success() {
            return Err(FetchError::Status {
                endpoint,
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        serde_json::from_str(&body).map_err(|source| FetchError::Decode { endpoint, source })
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherClient {
    async fn fetch(&self, lat: &str, lon: &str) -> Result<RawSnapshot, FetchError> {
        log::info!("Fetching weather for ({}, {})", lat, lon);
        let (current, forecast) = tokio::try_join!(
            self.get_json::<ProviderCurrent>(CURRENT_ENDPOINT, lat, lon),
            self.get_json::<ProviderForecast>(FORECAST_ENDPOINT, lat, lon),
        )?;
        Ok(RawSnapshot { current, forecast })
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
