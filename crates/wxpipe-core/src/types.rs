use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// One fetch target, as listed under `data.cities` in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CityTarget {
    pub name: String,
    pub country: String,
}

impl CityTarget {
    #[must_use]
    pub fn new(name: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            country: country.into(),
        }
    }

    /// The `q` parameter understood by the weather API, e.g. `"London,GB"`.
    #[must_use]
    pub fn query(&self) -> String {
        format!("{},{}", self.name, self.country)
    }
}

impl fmt::Display for CityTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.name, self.country)
    }
}

/// Temperature unit of every reading in a run. Fixed by `api.units`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Kelvin,
    Fahrenheit,
}

impl TemperatureUnit {
    /// Value of the API's `units` query parameter that yields this unit.
    #[must_use]
    pub fn api_units(self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "metric",
            TemperatureUnit::Kelvin => "standard",
            TemperatureUnit::Fahrenheit => "imperial",
        }
    }

    /// Inverse of [`TemperatureUnit::api_units`].
    #[must_use]
    pub fn from_api_units(units: &str) -> Option<Self> {
        match units {
            "metric" => Some(TemperatureUnit::Celsius),
            "standard" => Some(TemperatureUnit::Kelvin),
            "imperial" => Some(TemperatureUnit::Fahrenheit),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_celsius(self, value: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => value,
            TemperatureUnit::Kelvin => value - 273.15,
            TemperatureUnit::Fahrenheit => (value - 32.0) * 5.0 / 9.0,
        }
    }
}

/// A single observation as returned by the weather API.
///
/// Everything except `city`, `unit` and `fetched_at` is optional so that a
/// batch read back from disk can still carry incomplete records; the cleaner
/// decides what is usable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub city: CityTarget,
    pub timestamp: Option<DateTime<Utc>>,
    pub unit: TemperatureUnit,
    pub temperature: Option<f64>,
    pub feels_like: Option<f64>,
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
    pub pressure: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub condition: Option<String>,
    pub description: Option<String>,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub raw_payload: serde_json::Value,
}

/// A reading that survived cleaning.
///
/// `humidity`, when present, is always within `[0, 100]`. Flagged readings
/// keep their original values; `outlier_reason` lists every reason joined
/// with `,`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedReading {
    pub city: CityTarget,
    pub timestamp: DateTime<Utc>,
    pub unit: TemperatureUnit,
    pub temperature: f64,
    pub feels_like: Option<f64>,
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
    pub pressure: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub condition: String,
    pub description: Option<String>,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub raw_payload: serde_json::Value,
    pub is_outlier: bool,
    pub outlier_reason: Option<String>,
    #[serde(default)]
    pub derived: BTreeMap<String, f64>,
}

impl CleanedReading {
    /// Marks the reading as an outlier, appending `reason` to any earlier ones.
    pub fn flag(&mut self, reason: &str) {
        self.is_outlier = true;
        match &mut self.outlier_reason {
            Some(existing) => {
                existing.push(',');
                existing.push_str(reason);
            }
            None => self.outlier_reason = Some(reason.to_owned()),
        }
    }

    /// Temperature converted to Celsius, whatever the configured unit.
    #[must_use]
    pub fn temperature_celsius(&self) -> f64 {
        self.unit.to_celsius(self.temperature)
    }
}

/// Numeric fields of a [`CleanedReading`] that are screened and summarised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    FeelsLike,
    Humidity,
    WindSpeed,
    Pressure,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Temperature,
        Metric::FeelsLike,
        Metric::Humidity,
        Metric::WindSpeed,
        Metric::Pressure,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::FeelsLike => "feels_like",
            Metric::Humidity => "humidity",
            Metric::WindSpeed => "wind_speed",
            Metric::Pressure => "pressure",
        }
    }

    #[must_use]
    pub fn value(self, reading: &CleanedReading) -> Option<f64> {
        match self {
            Metric::Temperature => Some(reading.temperature),
            Metric::FeelsLike => reading.feels_like,
            Metric::Humidity => reading.humidity,
            Metric::WindSpeed => reading.wind_speed,
            Metric::Pressure => reading.pressure,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a run. Doubles as a file name in the stage store, so only
/// path-safe characters are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// A fresh random run id (UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Validates a caller-supplied run id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRunId`] if `raw` is empty, longer than 64
    /// characters, or contains anything other than ASCII alphanumerics, `-`
    /// and `_`.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(raw.to_owned()))
        } else {
            Err(CoreError::InvalidRunId(raw.to_owned()))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RunId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RunId> for String {
    fn from(value: RunId) -> Self {
        value.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted stages of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Raw,
    Processed,
    Output,
}

impl StageName {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Raw => "raw",
            StageName::Processed => "processed",
            StageName::Output => "output",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ordered records one stage produced for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageBatch<R> {
    pub stage_name: StageName,
    pub run_id: RunId,
    pub records: Vec<R>,
    pub created_at: DateTime<Utc>,
}

/// Pipeline phases that report an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Extract,
    Transform,
    Load,
    Analyze,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 4] = [
        PipelineStage::Extract,
        PipelineStage::Transform,
        PipelineStage::Load,
        PipelineStage::Analyze,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Extract => "extract",
            PipelineStage::Transform => "transform",
            PipelineStage::Load => "load",
            PipelineStage::Analyze => "analyze",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration: Duration,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageOutcome {
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// `true` when the stage ran and nothing in it failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub const ALL: [RunStatus; 3] = [RunStatus::Success, RunStatus::Partial, RunStatus::Failed];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts reported by the cleaner for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningReport {
    pub dropped: usize,
    pub flagged: usize,
}

/// A city whose fetch did not produce a usable reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityFailure {
    pub target: CityTarget,
    pub message: String,
    pub retryable: bool,
    pub attempts: u32,
}

/// Bookkeeping for one run; the only source of run metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stage_outcomes: BTreeMap<PipelineStage, StageOutcome>,
    #[serde(default)]
    pub city_failures: Vec<CityFailure>,
    pub cleaning: Option<CleaningReport>,
    pub overall_status: RunStatus,
}

impl RunResult {
    /// An empty result for a run that is about to start. The status stays
    /// `Failed` until the orchestrator finalizes it.
    #[must_use]
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            stage_outcomes: BTreeMap::new(),
            city_failures: Vec::new(),
            cleaning: None,
            overall_status: RunStatus::Failed,
        }
    }

    pub fn record(&mut self, stage: PipelineStage, outcome: StageOutcome) {
        self.stage_outcomes.insert(stage, outcome);
    }

    #[must_use]
    pub fn outcome(&self, stage: PipelineStage) -> Option<&StageOutcome> {
        self.stage_outcomes.get(&stage)
    }

    pub fn finalize(&mut self, status: RunStatus) {
        self.overall_status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Wall-clock duration of the run, once finalized.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.finished_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }
}
