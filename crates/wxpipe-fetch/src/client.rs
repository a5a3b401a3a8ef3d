//! HTTP client for the "current weather" endpoint.
//!
//! Wraps `reqwest` with API key handling, status classification and typed
//! response decoding. One call to [`WeatherClient::fetch`] issues up to
//! `retry_attempts` sequential requests for a single city.

use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, StatusCode, Url};
use tokio::time::Instant;
use wxpipe_core::{ApiConfig, CityTarget, PipelineSettings, RawReading, TemperatureUnit};

use crate::error::{ClientError, FetchError, FetchFailure};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::types::{ApiErrorBody, CurrentWeather};
use crate::{Fetched, WeatherSource};

const USER_AGENT: &str = "wxpipe/0.1 (weather-batch-pipeline)";

/// Client for the weather API.
///
/// Use [`WeatherClient::new`] with the resolved configuration, or
/// [`WeatherClient::with_policy`] to point at a mock server in tests.
pub struct WeatherClient {
    client: Client,
    base_url: Url,
    api_key: String,
    unit: TemperatureUnit,
    policy: RetryPolicy,
}

impl WeatherClient {
    /// Creates a client from the `api` and `pipeline` configuration sections.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Http`] if the `reqwest::Client` cannot be
    /// built, or [`ClientError::InvalidUrl`] if `api.url` does not parse.
    pub fn new(api: &ApiConfig, settings: &PipelineSettings) -> Result<Self, ClientError> {
        Self::with_policy(
            &api.url,
            &api.key,
            api.unit,
            settings.timeout(),
            RetryPolicy::from_settings(settings),
        )
    }

    /// Creates a client with an explicit endpoint, timeout and retry policy.
    ///
    /// # Errors
    ///
    /// See [`WeatherClient::new`].
    pub fn with_policy(
        base_url: &str,
        api_key: &str,
        unit: TemperatureUnit,
        timeout: Duration,
        policy: RetryPolicy,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()?;

        let base_url = Url::parse(base_url).map_err(|e| ClientError::InvalidUrl {
            url: base_url.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.to_owned(),
            unit,
            policy,
        })
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetches the current reading for `target`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] carrying the target, the number of attempts
    /// made and the last [`FetchFailure`] when every attempt failed, the
    /// failure was terminal, or `deadline` passed.
    pub async fn fetch_reading(
        &self,
        target: &CityTarget,
        deadline: Option<Instant>,
    ) -> Result<Fetched, FetchError> {
        let url = self.build_url(target);
        let outcome = retry_with_backoff(&self.policy, deadline, |attempt| {
            let url = url.clone();
            async move {
                tracing::debug!(city = %target, attempt, "requesting current weather");
                self.request_once(target, url).await
            }
        })
        .await;

        match outcome {
            Ok((reading, attempts)) => Ok(Fetched { reading, attempts }),
            Err(exhausted) => Err(FetchError::new(
                target.clone(),
                exhausted.failure,
                exhausted.attempts,
            )),
        }
    }

    /// Builds the request URL with percent-encoded `q`, `appid` and `units`.
    fn build_url(&self, target: &CityTarget) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("q", &target.query())
            .append_pair("appid", &self.api_key)
            .append_pair("units", self.unit.api_units());
        url
    }

    /// One request, classified into a reading or a [`FetchFailure`].
    async fn request_once(
        &self,
        target: &CityTarget,
        url: Url,
    ) -> Result<RawReading, FetchFailure> {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok());
            return Err(FetchFailure::RateLimited { retry_after_secs });
        }

        if status.is_server_error() {
            return Err(FetchFailure::ServerError {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|e| e.message)
                .unwrap_or_else(|_| truncate(&body, 200));
            return Err(FetchFailure::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        parse_reading(&body, target, self.unit)
    }
}

impl WeatherSource for WeatherClient {
    async fn fetch(
        &self,
        target: &CityTarget,
        deadline: Option<Instant>,
    ) -> Result<Fetched, FetchError> {
        self.fetch_reading(target, deadline).await
    }
}

/// Decodes a 2xx body. Anything without the required fields is a
/// [`FetchFailure::Schema`].
pub(crate) fn parse_reading(
    body: &str,
    target: &CityTarget,
    unit: TemperatureUnit,
) -> Result<RawReading, FetchFailure> {
    let payload: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| FetchFailure::Schema(format!("body is not JSON: {e}")))?;
    let parsed: CurrentWeather = serde_json::from_value(payload.clone())
        .map_err(|e| FetchFailure::Schema(e.to_string()))?;
    if parsed.weather.is_empty() {
        return Err(FetchFailure::Schema(
            "weather condition list is empty".to_owned(),
        ));
    }
    let target = target.clone();
    Ok(parsed.into_reading(target, unit, Utc::now(), payload))
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
