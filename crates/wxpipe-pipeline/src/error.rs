use thiserror::Error;
use wxpipe_core::{CityTarget, StageName, TemperatureUnit};
use wxpipe_store::StorageError;

/// Batch-level corruption or an unusable cleaning policy. Problems with a
/// single reading are never a `CleaningError`; that reading is dropped.
#[derive(Debug, Error)]
pub enum CleaningError {
    #[error("mixed temperature units in one batch: expected {expected:?}, {city} reported {found:?}")]
    MixedUnits {
        expected: TemperatureUnit,
        found: TemperatureUnit,
        city: CityTarget,
    },

    #[error("invalid cleaning policy: {0}")]
    InvalidPolicy(String),
}

/// Failures that stop a run before it starts. Anything after `Init` is
/// recorded on the `RunResult` instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot skip the stage producing {stage} data: no prior batch available")]
    MissingPriorBatch {
        stage: StageName,
        #[source]
        source: StorageError,
    },

    #[error("failed to read prior {stage} batch: {source}")]
    PriorBatchUnreadable {
        stage: StageName,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Cleaning(#[from] CleaningError),
}

impl PipelineError {
    pub(crate) fn from_prior_read(stage: StageName, source: StorageError) -> Self {
        if source.is_not_found() {
            PipelineError::MissingPriorBatch { stage, source }
        } else {
            PipelineError::PriorBatchUnreadable { stage, source }
        }
    }
}

/// Failure of an optional output stage (load or analyze).
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("CSV encoding error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite export error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
