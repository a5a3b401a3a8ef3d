//! Response shape of the "current weather" endpoint.
//!
//! Only the fields the pipeline reads are modelled; everything else stays in
//! the raw payload kept on each reading.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use wxpipe_core::{CityTarget, RawReading, TemperatureUnit};

#[derive(Debug, Deserialize)]
pub struct CurrentWeather {
    /// Observation time, unix seconds.
    pub dt: Option<i64>,
    pub main: MainBlock,
    pub wind: WindBlock,
    pub weather: Vec<ConditionBlock>,
}

#[derive(Debug, Deserialize)]
pub struct MainBlock {
    pub temp: f64,
    pub humidity: f64,
    pub feels_like: Option<f64>,
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
    pub pressure: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct WindBlock {
    pub speed: f64,
    pub deg: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ConditionBlock {
    pub main: String,
    pub description: Option<String>,
}

/// Error envelope, e.g. `{"cod": "404", "message": "city not found"}`.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub message: String,
}

impl CurrentWeather {
    /// Builds a [`RawReading`] for `city`. Falls back to `fetched_at` when the
    /// payload carries no observation time.
    #[must_use]
    pub fn into_reading(
        self,
        city: CityTarget,
        unit: TemperatureUnit,
        fetched_at: DateTime<Utc>,
        raw_payload: serde_json::Value,
    ) -> RawReading {
        let timestamp = self
            .dt
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or(fetched_at);
        let (condition, description) = self
            .weather
            .into_iter()
            .next()
            .map_or((None, None), |c| (Some(c.main), c.description));

        RawReading {
            city,
            timestamp: Some(timestamp),
            unit,
            temperature: Some(self.main.temp),
            feels_like: self.main.feels_like,
            temp_min: self.main.temp_min,
            temp_max: self.main.temp_max,
            pressure: self.main.pressure,
            humidity: Some(self.main.humidity),
            wind_speed: Some(self.wind.speed),
            wind_direction: self.wind.deg,
            condition,
            description,
            fetched_at,
            raw_payload,
        }
    }
}
