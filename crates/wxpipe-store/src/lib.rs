//! Persistence of per-run stage batches.
//!
//! One artifact per `(stage, run_id)`. Writes replace atomically, so a
//! re-run of a failed stage overwrites instead of appending and a reader
//! never observes a half-written batch.

pub mod error;
pub mod fs;

use serde::de::DeserializeOwned;
use serde::Serialize;
use wxpipe_core::{RunId, StageBatch, StageName};

pub use error::StorageError;
pub use fs::{write_atomic, FsStageStore, StagePaths};

/// Storage seam between pipeline stages.
pub trait StageStore: Send + Sync {
    /// Persists `records` as the batch for `(stage, run_id)`, replacing any
    /// earlier batch with the same identity.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O or serialization failure.
    fn write<R: Serialize>(
        &self,
        stage: StageName,
        run_id: &RunId,
        records: Vec<R>,
    ) -> Result<StageBatch<R>, StorageError>;

    /// Reads the batch for `(stage, run_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when no batch was written for that
    /// identity. An existing batch with zero records is returned as such.
    fn read<R: DeserializeOwned>(
        &self,
        stage: StageName,
        run_id: &RunId,
    ) -> Result<StageBatch<R>, StorageError>;

    /// Up to `limit` readable batches of `stage`, newest first by
    /// `created_at` (ties broken by run id). Unreadable batch files are
    /// skipped, so one damaged file never hides the rest of the history.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] only when the stage itself cannot be listed.
    fn recent<R: DeserializeOwned>(
        &self,
        stage: StageName,
        limit: usize,
    ) -> Result<Vec<StageBatch<R>>, StorageError>;

    /// Reads the most recently created readable batch of `stage`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NoBatches`] when the stage holds nothing
    /// readable yet.
    fn latest<R: DeserializeOwned>(&self, stage: StageName) -> Result<StageBatch<R>, StorageError> {
        self.recent(stage, 1)?
            .into_iter()
            .next()
            .ok_or(StorageError::NoBatches(stage))
    }

    /// Atomically writes an auxiliary output file (export, report) for a run.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure.
    fn write_artifact(&self, run_id: &RunId, name: &str, bytes: &[u8]) -> Result<(), StorageError>;
}
