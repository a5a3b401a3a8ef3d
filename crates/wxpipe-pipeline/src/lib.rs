//! Cleaning, analysis, export (CSV and SQLite) and orchestration for
//! weather batch runs.
//!
//! [`Pipeline::run`] drives extract → transform → load/analyze for one run
//! and returns the [`wxpipe_core::RunResult`] that [`MetricsRegistry`]
//! exposes.

pub mod analyze;
pub mod clean;
pub mod error;
pub mod export;
pub mod metrics;
pub mod orchestrator;
pub mod sqlite;

pub use analyze::{
    analyze, analyze_with_history, ChartData, CitySummary, Correlation, MetricCorrelation, Stats,
    Summary, Trend, TrendDirection,
};
pub use clean::Cleaner;
pub use error::{CleaningError, ExportError, PipelineError};
pub use export::{load, LoadReport};
pub use sqlite::export_sqlite;
pub use metrics::MetricsRegistry;
pub use orchestrator::{Pipeline, RunFlags};
