//! Weather provider client.
//!
//! Thin typed wrapper over the upstream weather HTTP API. Failures map
//! to provider-category errors so callers can tell a flaky upstream
//! apart from a broken job definition.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::WeatherConfig;
use crate::error::{ErrorCode, MeteoError, Result};

/// A location as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherLocation {
    pub name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Current conditions for a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentConditions {
    pub last_updated: String,
    pub temp_c: f64,
    pub is_day: i64,
    pub condition: Condition,
    pub wind_kph: f64,
    pub wind_degree: i64,
    pub wind_dir: String,
    pub precip_mm: f64,
    pub humidity: i64,
    pub cloud: i64,
    pub feelslike_c: f64,
    pub vis_km: f64,
    pub uv: f64,
    pub gust_kph: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub text: String,
    pub icon: String,
    pub code: i64,
}

/// A current-weather lookup result: the resolved location plus its
/// current conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherLookup {
    pub location: WeatherLocation,
    pub current: CurrentConditions,
}

/// HTTP client for the weather API.
pub struct WeatherProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl WeatherProvider {
    /// Build a provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the HTTP client cannot be built.
    pub fn new(config: &WeatherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                MeteoError::with_internal(
                    ErrorCode::ConfigurationError,
                    "Failed to build weather API client",
                    e.to_string(),
                )
                .with_source(e)
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    /// Fetch current weather for a location query.
    pub async fn fetch_current(&self, query: &str) -> Result<WeatherLookup> {
        let url = format!("{}/current.json", self.base_url);
        debug!(%query, "Fetching current weather");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("q", query),
                ("lang", "en"),
            ])
            .send()
            .await?;

        let response = Self::check_status(response)?;
        Ok(response.json().await?)
    }

    /// Search locations matching a free-text query.
    pub async fn fetch_locations(&self, query: &str) -> Result<Vec<WeatherLocation>> {
        let url = format!("{}/search.json", self.base_url);
        debug!(%query, "Searching locations");

        let response = self
            .client
            .get(&url)
            .query(&[("key", self.api_key.as_str()), ("q", query)])
            .send()
            .await?;

        let response = Self::check_status(response)?;
        Ok(response.json().await?)
    }

    fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let code = if status == StatusCode::TOO_MANY_REQUESTS {
            ErrorCode::ProviderRateLimited
        } else {
            ErrorCode::ProviderUnavailable
        };

        Err(MeteoError::with_internal(
            code,
            "Weather provider request failed",
            format!("provider returned status {}", status),
        ))
    }
}
