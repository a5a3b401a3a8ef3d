//! Pipeline configuration: a YAML file validated once into [`PipelineConfig`].
//!
//! Unknown keys are rejected, every recognised option has a named field, and
//! the API key may be supplied through `OPENWEATHERMAP_KEY` instead of the
//! file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio_cron_scheduler::Job;

use crate::error::ConfigError;
use crate::types::{CityTarget, TemperatureUnit};

const DEFAULT_DATABASE_FILE: &str = "weather_data.db";

/// Environment variable that overrides `api.key`.
pub const API_KEY_ENV: &str = "OPENWEATHERMAP_KEY";

#[derive(Clone)]
pub struct ApiConfig {
    pub url: String,
    pub key: String,
    pub unit: TemperatureUnit,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("url", &self.url)
            .field("key", &"[redacted]")
            .field("unit", &self.unit)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct DataConfig {
    pub cities: Vec<CityTarget>,
    pub raw_data_path: PathBuf,
    pub processed_data_path: PathBuf,
    pub output_data_path: PathBuf,
    /// SQLite export target, `<output_data_path>/weather_data.db` by default.
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineSettings {
    pub batch_size: usize,
    /// Per-request timeout in seconds.
    #[serde(rename = "timeout")]
    pub timeout_secs: u64,
    /// Total attempts per city, the first one included.
    pub retry_attempts: u32,
    pub backoff: BackoffConfig,
    pub deadline_secs: Option<u64>,
    pub schedule: String,
    /// Prior processed batches read back for temperature trends.
    pub history_batches: usize,
}

impl PipelineSettings {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            timeout_secs: 10,
            retry_attempts: 3,
            backoff: BackoffConfig::default(),
            deadline_secs: None,
            schedule: "0 0 * * * *".to_owned(),
            history_batches: 48,
        }
    }
}

/// Thresholds for the cleaner. Temperatures are in degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CleaningConfig {
    pub plausible_min: f64,
    pub plausible_max: f64,
    pub hard_limit: f64,
    pub zscore_threshold: f64,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            plausible_min: -90.0,
            plausible_max: 60.0,
            hard_limit: 200.0,
            zscore_threshold: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MonitoringConfig {
    pub prometheus_port: u16,
    pub path: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_port: 8000,
            path: "/metrics".to_owned(),
        }
    }
}

/// Fully validated configuration, resolved once before a run starts.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api: ApiConfig,
    pub data: DataConfig,
    pub pipeline: PipelineSettings,
    pub cleaning: CleaningConfig,
    pub logging: LoggingConfig,
    pub monitoring: MonitoringConfig,
}

// ---------------------------------------------------------------------------
// File shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    api: ApiSection,
    data: DataSection,
    #[serde(default)]
    pipeline: PipelineSettings,
    #[serde(default)]
    cleaning: CleaningConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    monitoring: MonitoringConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ApiSection {
    url: String,
    key: Option<String>,
    #[serde(default = "default_units")]
    units: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DataSection {
    cities: Vec<CityTarget>,
    #[serde(default = "default_raw_path")]
    raw_data_path: PathBuf,
    #[serde(default = "default_processed_path")]
    processed_data_path: PathBuf,
    #[serde(default = "default_output_path")]
    output_data_path: PathBuf,
    database_path: Option<PathBuf>,
}

fn default_units() -> String {
    "metric".to_owned()
}

fn default_raw_path() -> PathBuf {
    PathBuf::from("./data/raw")
}

fn default_processed_path() -> PathBuf {
    PathBuf::from("./data/processed")
}

fn default_output_path() -> PathBuf {
    PathBuf::from("./data/output")
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load and validate the pipeline configuration from a YAML file.
///
/// Calls `dotenvy::dotenv().ok()` first so `OPENWEATHERMAP_KEY` may live in a
/// `.env` file.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed, contains
/// unknown keys, lacks an API key, or fails validation.
pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    dotenvy::dotenv().ok();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileIo {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_config(&content, |key| std::env::var(key))
}

/// Parse and validate configuration text, resolving environment overrides
/// through `lookup` so tests can supply a plain map.
///
/// # Errors
///
/// See [`load_config`].
pub fn parse_config<F>(content: &str, lookup: F) -> Result<PipelineConfig, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let file: ConfigFile = serde_yaml::from_str(content)?;

    let key = lookup(API_KEY_ENV)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .or(file.api.key.filter(|k| !k.trim().is_empty()))
        .ok_or(ConfigError::MissingApiKey(API_KEY_ENV))?;

    let unit = TemperatureUnit::from_api_units(&file.api.units).ok_or_else(|| {
        ConfigError::Validation(format!(
            "api.units must be one of metric, standard, imperial (got {:?})",
            file.api.units
        ))
    })?;

    validate_url(&file.api.url)?;
    validate_cities(&file.data.cities)?;
    validate_paths(&file.data)?;
    validate_pipeline(&file.pipeline)?;
    validate_cleaning(&file.cleaning)?;
    validate_monitoring(&file.monitoring)?;

    Ok(PipelineConfig {
        api: ApiConfig {
            url: file.api.url,
            key,
            unit,
        },
        data: DataConfig {
            cities: file.data.cities,
            raw_data_path: file.data.raw_data_path,
            processed_data_path: file.data.processed_data_path,
            database_path: file
                .data
                .database_path
                .unwrap_or_else(|| file.data.output_data_path.join(DEFAULT_DATABASE_FILE)),
            output_data_path: file.data.output_data_path,
        },
        pipeline: file.pipeline,
        cleaning: file.cleaning,
        logging: file.logging,
        monitoring: file.monitoring,
    })
}

fn validate_url(url: &str) -> Result<(), ConfigError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(()),
        _ => Err(ConfigError::Validation(format!(
            "api.url must be an http(s) URL (got {url:?})"
        ))),
    }
}

fn validate_cities(cities: &[CityTarget]) -> Result<(), ConfigError> {
    if cities.is_empty() {
        return Err(ConfigError::Validation(
            "data.cities must list at least one city".to_owned(),
        ));
    }

    let mut seen = HashSet::new();
    for city in cities {
        if city.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "data.cities: city name must be non-empty".to_owned(),
            ));
        }
        if city.country.len() != 2 || !city.country.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ConfigError::Validation(format!(
                "data.cities: city '{}' has invalid country code {:?}; expected two letters",
                city.name, city.country
            )));
        }
        let key = (city.name.to_lowercase(), city.country.to_uppercase());
        if !seen.insert(key) {
            return Err(ConfigError::Validation(format!(
                "data.cities: duplicate city '{city}'"
            )));
        }
    }
    Ok(())
}

/// Every stage keeps its batches as `<dir>/<run_id>.json`, so two stages
/// sharing a directory would overwrite each other's batches.
fn validate_paths(data: &DataSection) -> Result<(), ConfigError> {
    let artifacts = data.output_data_path.join("artifacts");
    let dirs = [
        ("data.raw_data_path", &data.raw_data_path),
        ("data.processed_data_path", &data.processed_data_path),
        ("data.output_data_path", &data.output_data_path),
        ("the output artifacts directory", &artifacts),
    ];
    for (i, (name, dir)) in dirs.iter().enumerate() {
        for (other, other_dir) in &dirs[i + 1..] {
            if dir == other_dir {
                return Err(ConfigError::Validation(format!(
                    "{name} and {other} must be different directories (both {})",
                    dir.display()
                )));
            }
        }
    }
    Ok(())
}

fn validate_pipeline(settings: &PipelineSettings) -> Result<(), ConfigError> {
    if settings.batch_size == 0 {
        return Err(ConfigError::Validation(
            "pipeline.batch_size must be at least 1".to_owned(),
        ));
    }
    if settings.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "pipeline.timeout must be at least 1 second".to_owned(),
        ));
    }
    if settings.retry_attempts == 0 {
        return Err(ConfigError::Validation(
            "pipeline.retry_attempts must be at least 1".to_owned(),
        ));
    }
    let backoff = &settings.backoff;
    if !backoff.factor.is_finite() || backoff.factor < 1.0 {
        return Err(ConfigError::Validation(format!(
            "pipeline.backoff.factor must be a finite number >= 1.0 (got {})",
            backoff.factor
        )));
    }
    if backoff.max_delay_ms < backoff.base_delay_ms {
        return Err(ConfigError::Validation(
            "pipeline.backoff.max_delay_ms must not be below base_delay_ms".to_owned(),
        ));
    }
    if settings.deadline_secs == Some(0) {
        return Err(ConfigError::Validation(
            "pipeline.deadline_secs must be positive when set".to_owned(),
        ));
    }
    if let Err(e) = Job::new(settings.schedule.as_str(), |_uuid, _lock| {}) {
        return Err(ConfigError::Validation(format!(
            "pipeline.schedule {:?} is not a valid cron expression: {e}",
            settings.schedule
        )));
    }
    Ok(())
}

fn validate_cleaning(cleaning: &CleaningConfig) -> Result<(), ConfigError> {
    let all_finite = [
        cleaning.plausible_min,
        cleaning.plausible_max,
        cleaning.hard_limit,
        cleaning.zscore_threshold,
    ]
    .iter()
    .all(|v| v.is_finite());
    if !all_finite {
        return Err(ConfigError::Validation(
            "cleaning thresholds must be finite numbers".to_owned(),
        ));
    }
    if cleaning.plausible_min >= cleaning.plausible_max {
        return Err(ConfigError::Validation(
            "cleaning.plausible_min must be below cleaning.plausible_max".to_owned(),
        ));
    }
    if cleaning.hard_limit <= 0.0 {
        return Err(ConfigError::Validation(
            "cleaning.hard_limit must be positive".to_owned(),
        ));
    }
    if cleaning.zscore_threshold <= 0.0 {
        return Err(ConfigError::Validation(
            "cleaning.zscore_threshold must be positive".to_owned(),
        ));
    }
    Ok(())
}

fn validate_monitoring(monitoring: &MonitoringConfig) -> Result<(), ConfigError> {
    if !monitoring.path.starts_with('/') {
        return Err(ConfigError::Validation(format!(
            "monitoring.path must start with '/' (got {:?})",
            monitoring.path
        )));
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
