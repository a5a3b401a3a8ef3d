//! Validation, repair and outlier flagging for a batch of raw readings.
//!
//! The cleaner is a pure function of its input batch and policy: the same
//! batch always yields the same output and report.
//!
//! Per reading, in order:
//!
//! 1. Non-finite numbers are treated as missing.
//! 2. A reading without city name, timestamp or temperature is dropped.
//! 3. A temperature beyond the hard sanity bound (°C) is dropped.
//! 4. Humidity outside `[0, 100]` is clamped and flagged; negative wind speed
//!    is clamped to zero and flagged; temperature outside the plausible
//!    range is flagged but kept as reported.
//!
//! Then, across the retained readings, each [`Metric`] gets a z-score pass
//! using the population standard deviation, and derived metrics are
//! computed.

use std::collections::BTreeMap;

use wxpipe_core::{CleanedReading, CleaningConfig, CleaningReport, Metric, RawReading};

use crate::error::CleaningError;

pub const HUMIDITY_OUT_OF_RANGE: &str = "humidity_out_of_range";
pub const TEMPERATURE_OUT_OF_RANGE: &str = "temperature_out_of_range";
pub const WIND_SPEED_OUT_OF_RANGE: &str = "wind_speed_out_of_range";
pub const UNKNOWN_CONDITION: &str = "Unknown";

/// Cleans batches under a validated [`CleaningConfig`].
#[derive(Debug, Clone)]
pub struct Cleaner {
    policy: CleaningConfig,
}

impl Cleaner {
    /// # Errors
    ///
    /// Returns [`CleaningError::InvalidPolicy`] when a threshold is not a
    /// finite positive number or the plausible range is empty.
    pub fn new(policy: CleaningConfig) -> Result<Self, CleaningError> {
        let CleaningConfig {
            plausible_min,
            plausible_max,
            hard_limit,
            zscore_threshold,
        } = policy;
        if !(plausible_min.is_finite() && plausible_max.is_finite())
            || plausible_min >= plausible_max
        {
            return Err(CleaningError::InvalidPolicy(format!(
                "plausible range [{plausible_min}, {plausible_max}] is empty"
            )));
        }
        if !hard_limit.is_finite() || hard_limit <= 0.0 {
            return Err(CleaningError::InvalidPolicy(format!(
                "hard_limit must be positive, got {hard_limit}"
            )));
        }
        if !zscore_threshold.is_finite() || zscore_threshold <= 0.0 {
            return Err(CleaningError::InvalidPolicy(format!(
                "zscore_threshold must be positive, got {zscore_threshold}"
            )));
        }
        Ok(Self { policy })
    }

    #[must_use]
    pub fn policy(&self) -> &CleaningConfig {
        &self.policy
    }

    /// Cleans `batch` without modifying it.
    ///
    /// `report.dropped + output.len() == batch.len()` always holds, and the
    /// output keeps the input order.
    ///
    /// # Errors
    ///
    /// Returns [`CleaningError::MixedUnits`] if the readings disagree on the
    /// temperature unit.
    pub fn clean(
        &self,
        batch: &[RawReading],
    ) -> Result<(Vec<CleanedReading>, CleaningReport), CleaningError> {
        check_units(batch)?;

        let mut cleaned: Vec<CleanedReading> = Vec::with_capacity(batch.len());
        let mut dropped = 0usize;
        for raw in batch {
            if let Some(reading) = self.repair(raw) {
                cleaned.push(reading);
            } else {
                dropped += 1;
            }
        }

        for metric in Metric::ALL {
            self.flag_zscore_outliers(&mut cleaned, metric);
        }

        for reading in &mut cleaned {
            reading.derived = derive_metrics(reading);
        }

        let flagged = cleaned.iter().filter(|r| r.is_outlier).count();
        if dropped > 0 || flagged > 0 {
            tracing::info!(
                input = batch.len(),
                kept = cleaned.len(),
                dropped,
                flagged,
                "cleaning adjusted batch"
            );
        }

        Ok((cleaned, CleaningReport { dropped, flagged }))
    }

    /// Range checks for one reading. `None` means the reading is unusable.
    fn repair(&self, raw: &RawReading) -> Option<CleanedReading> {
        let Some(timestamp) = raw.timestamp else {
            tracing::debug!(city = %raw.city, "dropping reading without timestamp");
            return None;
        };
        let Some(temperature) = finite(raw.temperature) else {
            tracing::debug!(city = %raw.city, "dropping reading without temperature");
            return None;
        };
        if raw.city.name.trim().is_empty() {
            tracing::debug!("dropping reading without city name");
            return None;
        }

        let celsius = raw.unit.to_celsius(temperature);
        if celsius.abs() > self.policy.hard_limit {
            tracing::warn!(
                city = %raw.city,
                temperature_c = celsius,
                hard_limit = self.policy.hard_limit,
                "dropping reading beyond sanity bound"
            );
            return None;
        }

        let condition = raw
            .condition
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(UNKNOWN_CONDITION)
            .to_owned();

        let mut reading = CleanedReading {
            city: raw.city.clone(),
            timestamp,
            unit: raw.unit,
            temperature,
            feels_like: finite(raw.feels_like),
            temp_min: finite(raw.temp_min),
            temp_max: finite(raw.temp_max),
            pressure: finite(raw.pressure),
            humidity: finite(raw.humidity),
            wind_speed: finite(raw.wind_speed),
            wind_direction: finite(raw.wind_direction),
            condition,
            description: raw.description.clone(),
            fetched_at: raw.fetched_at,
            raw_payload: raw.raw_payload.clone(),
            is_outlier: false,
            outlier_reason: None,
            derived: BTreeMap::new(),
        };

        if let Some(h) = reading.humidity {
            if !(0.0..=100.0).contains(&h) {
                reading.humidity = Some(h.clamp(0.0, 100.0));
                reading.flag(HUMIDITY_OUT_OF_RANGE);
            }
        }
        if celsius < self.policy.plausible_min || celsius > self.policy.plausible_max {
            reading.flag(TEMPERATURE_OUT_OF_RANGE);
        }
        if reading.wind_speed.is_some_and(|w| w < 0.0) {
            reading.wind_speed = Some(0.0);
            reading.flag(WIND_SPEED_OUT_OF_RANGE);
        }

        Some(reading)
    }

    fn flag_zscore_outliers(&self, readings: &mut [CleanedReading], metric: Metric) {
        let values: Vec<f64> = readings.iter().filter_map(|r| metric.value(r)).collect();
        let Some((mean, std_dev)) = mean_and_std(&values) else {
            return;
        };
        if std_dev <= f64::EPSILON {
            return;
        }

        let reason = format!("{metric}_zscore");
        for reading in readings.iter_mut() {
            let Some(value) = metric.value(reading) else {
                continue;
            };
            let z = (value - mean).abs() / std_dev;
            if z > self.policy.zscore_threshold {
                tracing::debug!(city = %reading.city, metric = %metric, z, "statistical outlier");
                reading.flag(&reason);
            }
        }
    }
}

fn check_units(batch: &[RawReading]) -> Result<(), CleaningError> {
    let Some(first) = batch.first() else {
        return Ok(());
    };
    match batch.iter().find(|r| r.unit != first.unit) {
        Some(other) => Err(CleaningError::MixedUnits {
            expected: first.unit,
            found: other.unit,
            city: other.city.clone(),
        }),
        None => Ok(()),
    }
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// Mean and population standard deviation; `None` for fewer than two values.
pub(crate) fn mean_and_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.len() < 2 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}

/// `heat_index` and `dew_point` in °C, `temp_range` in the reading's unit.
fn derive_metrics(reading: &CleanedReading) -> BTreeMap<String, f64> {
    let mut derived = BTreeMap::new();
    let celsius = reading.temperature_celsius();

    if let Some(humidity) = reading.humidity {
        derived.insert("heat_index".to_owned(), heat_index_c(celsius, humidity));
        if humidity > 0.0 {
            derived.insert("dew_point".to_owned(), dew_point_c(celsius, humidity));
        }
    }
    if let (Some(min), Some(max)) = (reading.temp_min, reading.temp_max) {
        derived.insert("temp_range".to_owned(), max - min);
    }
    derived
}

/// NWS heat index. Uses Steadman's simple formula when its result is below
/// 80 °F, otherwise the Rothfusz regression with the low/high humidity
/// adjustments.
pub(crate) fn heat_index_c(celsius: f64, humidity: f64) -> f64 {
    let t = celsius * 9.0 / 5.0 + 32.0;
    let rh = humidity;

    let simple = 0.5 * (t + 61.0 + (t - 68.0) * 1.2 + rh * 0.094);
    let hi_f = if (simple + t) / 2.0 < 80.0 {
        simple
    } else {
        let mut hi = -42.379 + 2.049_015_23 * t + 10.143_331_27 * rh
            - 0.224_755_41 * t * rh
            - 0.006_837_83 * t * t
            - 0.054_817_17 * rh * rh
            + 0.001_228_74 * t * t * rh
            + 0.000_852_82 * t * rh * rh
            - 0.000_001_99 * t * t * rh * rh;
        if rh < 13.0 && (80.0..=112.0).contains(&t) {
            hi -= ((13.0 - rh) / 4.0) * ((17.0 - (t - 95.0).abs()) / 17.0).sqrt();
        } else if rh > 85.0 && (80.0..=87.0).contains(&t) {
            hi += ((rh - 85.0) / 10.0) * ((87.0 - t) / 5.0);
        }
        hi
    };

    (hi_f - 32.0) * 5.0 / 9.0
}

/// Magnus approximation. `humidity` must be positive.
pub(crate) fn dew_point_c(celsius: f64, humidity: f64) -> f64 {
    const A: f64 = 17.62;
    const B: f64 = 243.12;
    let gamma = (humidity / 100.0).ln() + A * celsius / (B + celsius);
    B * gamma / (A - gamma)
}

#[cfg(test)]
#[path = "clean_test.rs"]
mod tests;
