//! The load stage: persists the output batch, flat CSV exports and the
//! SQLite table.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use wxpipe_core::{CleanedReading, Metric, RunId, StageName};
use wxpipe_store::{StageStore, StorageError};

use crate::analyze::Summary;
use crate::error::ExportError;
use crate::sqlite::export_sqlite;

/// Attempts for each write in an optional stage.
pub const STORAGE_ATTEMPTS: u32 = 3;
const STORAGE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// What a successful load produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub records: usize,
    pub artifacts: Vec<String>,
    /// Rows now held by the SQLite `weather_data` table.
    pub database_rows: usize,
}

#[must_use]
pub fn readings_csv_name(run_id: &RunId) -> String {
    format!("weather_{run_id}.csv")
}

#[must_use]
pub fn summary_csv_name(run_id: &RunId) -> String {
    format!("weather_summary_{run_id}.csv")
}

/// Writes the output batch, `weather_<run>.csv` and
/// `weather_summary_<run>.csv`, then replaces the `weather_data` table in
/// the SQLite file at `database`. Every store write is retried up to
/// [`STORAGE_ATTEMPTS`] times.
///
/// # Errors
///
/// Returns [`ExportError`] when encoding fails, a write still fails after
/// the last attempt, or the SQLite export fails.
pub async fn load<S: StageStore>(
    store: &S,
    run_id: &RunId,
    records: &[CleanedReading],
    summary: &Summary,
    database: &Path,
) -> Result<LoadReport, ExportError> {
    with_storage_retry("output batch", || {
        store.write(StageName::Output, run_id, records.to_vec())
    })
    .await?;

    let readings = readings_csv(records)?;
    let readings_name = readings_csv_name(run_id);
    with_storage_retry(&readings_name, || {
        store.write_artifact(run_id, &readings_name, &readings)
    })
    .await?;

    let cities = city_summary_csv(summary)?;
    let summary_name = summary_csv_name(run_id);
    with_storage_retry(&summary_name, || {
        store.write_artifact(run_id, &summary_name, &cities)
    })
    .await?;

    let database_rows = export_sqlite(database, run_id, records).await?;

    Ok(LoadReport {
        records: records.len(),
        artifacts: vec![readings_name, summary_name],
        database_rows,
    })
}

/// Retries a storage write a fixed number of times with a short pause.
pub(crate) async fn with_storage_retry<T, F>(what: &str, mut write: F) -> Result<T, StorageError>
where
    F: FnMut() -> Result<T, StorageError>,
{
    let mut attempt = 1;
    loop {
        match write() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < STORAGE_ATTEMPTS => {
                tracing::warn!(what, attempt, error = %e, "storage write failed; retrying");
                tokio::time::sleep(STORAGE_RETRY_DELAY).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Serialize)]
struct ReadingRow<'a> {
    city: &'a str,
    country: &'a str,
    timestamp: String,
    unit: &'static str,
    temperature: f64,
    feels_like: Option<f64>,
    temp_min: Option<f64>,
    temp_max: Option<f64>,
    pressure: Option<f64>,
    humidity: Option<f64>,
    wind_speed: Option<f64>,
    wind_direction: Option<f64>,
    condition: &'a str,
    description: Option<&'a str>,
    is_outlier: bool,
    outlier_reason: Option<&'a str>,
    heat_index: Option<f64>,
    dew_point: Option<f64>,
    temp_range: Option<f64>,
}

/// One row per reading, flags and derived metrics included.
///
/// # Errors
///
/// Returns [`csv::Error`] if a row cannot be encoded.
pub fn readings_csv(records: &[CleanedReading]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for r in records {
        writer.serialize(ReadingRow {
            city: &r.city.name,
            country: &r.city.country,
            timestamp: r.timestamp.to_rfc3339(),
            unit: r.unit.api_units(),
            temperature: r.temperature,
            feels_like: r.feels_like,
            temp_min: r.temp_min,
            temp_max: r.temp_max,
            pressure: r.pressure,
            humidity: r.humidity,
            wind_speed: r.wind_speed,
            wind_direction: r.wind_direction,
            condition: &r.condition,
            description: r.description.as_deref(),
            is_outlier: r.is_outlier,
            outlier_reason: r.outlier_reason.as_deref(),
            heat_index: r.derived.get("heat_index").copied(),
            dew_point: r.derived.get("dew_point").copied(),
            temp_range: r.derived.get("temp_range").copied(),
        })?;
    }
    into_bytes(writer)
}

#[derive(Serialize)]
struct CityRow<'a> {
    city: &'a str,
    count: usize,
    temperature_mean: Option<f64>,
    temperature_min: Option<f64>,
    temperature_max: Option<f64>,
    humidity_mean: Option<f64>,
    wind_speed_mean: Option<f64>,
}

/// One row per city from the summary's per-city statistics.
///
/// # Errors
///
/// Returns [`csv::Error`] if a row cannot be encoded.
pub fn city_summary_csv(summary: &Summary) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for (city, s) in &summary.per_city_stats {
        let temperature = s.stats.get(&Metric::Temperature);
        writer.serialize(CityRow {
            city,
            count: s.count,
            temperature_mean: temperature.map(|t| t.mean),
            temperature_min: temperature.map(|t| t.min),
            temperature_max: temperature.map(|t| t.max),
            humidity_mean: s.stats.get(&Metric::Humidity).map(|t| t.mean),
            wind_speed_mean: s.stats.get(&Metric::WindSpeed).map(|t| t.mean),
        })?;
    }
    into_bytes(writer)
}

fn into_bytes(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, csv::Error> {
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use wxpipe_core::{CityTarget, TemperatureUnit};

    use super::*;
    use crate::analyze::analyze;

    fn reading(city: &str, temperature: f64) -> CleanedReading {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        CleanedReading {
            city: CityTarget::new(city, "US"),
            timestamp: at,
            unit: TemperatureUnit::Celsius,
            temperature,
            feels_like: None,
            temp_min: None,
            temp_max: None,
            pressure: None,
            humidity: Some(100.0),
            wind_speed: Some(5.0),
            wind_direction: None,
            condition: "Clear".to_owned(),
            description: None,
            fetched_at: at,
            raw_payload: serde_json::Value::Null,
            is_outlier: true,
            outlier_reason: Some("humidity_out_of_range".to_owned()),
            derived: BTreeMap::from([("heat_index".to_owned(), 20.5)]),
        }
    }

    #[test]
    fn readings_csv_has_header_and_one_row_per_reading() {
        let csv = String::from_utf8(readings_csv(&[reading("New York", 20.0)]).unwrap()).unwrap();
        let mut lines = csv.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("city,country,timestamp,unit,temperature"));
        assert!(header.ends_with("heat_index,dew_point,temp_range"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("New York,US,2024-06-01T12:00:00+00:00,metric,20.0"));
        assert!(row.contains("true,humidity_out_of_range,20.5,,"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn city_summary_csv_aggregates_per_city() {
        let batch = vec![
            reading("Oslo", 2.0),
            reading("Oslo", 4.0),
            reading("Rome", 25.0),
        ];
        let csv = String::from_utf8(city_summary_csv(&analyze(&batch)).unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "city,count,temperature_mean,temperature_min,temperature_max,humidity_mean,wind_speed_mean"
        );
        assert_eq!(lines[1], "\"Oslo, US\",2,3.0,2.0,4.0,100.0,5.0");
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn storage_retry_gives_up_after_fixed_attempts() {
        let mut calls = 0;
        let result: Result<(), StorageError> = with_storage_retry("test", || {
            calls += 1;
            Err(StorageError::InvalidArtifactName("x".to_owned()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, STORAGE_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn storage_retry_recovers() {
        let mut calls = 0;
        let result = with_storage_retry("test", || {
            calls += 1;
            if calls < 2 {
                Err(StorageError::InvalidArtifactName("x".to_owned()))
            } else {
                Ok(calls)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
