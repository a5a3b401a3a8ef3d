//! Shared data model and configuration for the weather pipeline.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    load_config, parse_config, ApiConfig, BackoffConfig, BackoffStrategy, CleaningConfig,
    DataConfig, LogFormat, LoggingConfig, MonitoringConfig, PipelineConfig, PipelineSettings,
};
pub use error::{ConfigError, CoreError};
pub use types::{
    CityFailure, CityTarget, CleanedReading, CleaningReport, Metric, PipelineStage, RawReading,
    RunId, RunResult, RunStatus, StageBatch, StageName, StageOutcome, TemperatureUnit,
};
