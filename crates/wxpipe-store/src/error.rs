use std::path::PathBuf;

use thiserror::Error;
use wxpipe_core::{RunId, StageName};

#[derive(Debug, Error)]
pub enum StorageError {
    /// No batch exists for this identity. Distinct from a batch with zero
    /// records.
    #[error("no {stage} batch for run {run_id}")]
    NotFound { stage: StageName, run_id: RunId },

    /// The stage holds no batches from any run.
    #[error("no {0} batches have been written yet")]
    NoBatches(StageName),

    #[error("I/O error on {stage} store at {}: {source}", path.display())]
    Io {
        stage: StageName,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {stage} batch at {}: {source}", path.display())]
    Serde {
        stage: StageName,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid artifact name {0:?}")]
    InvalidArtifactName(String),
}

impl StorageError {
    /// `true` when nothing was stored yet, as opposed to a failed read.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::NotFound { .. } | StorageError::NoBatches(_)
        )
    }
}
