//! Filesystem-backed [`StageStore`]: one directory per stage, one pretty JSON
//! file per run.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use wxpipe_core::{DataConfig, RunId, StageBatch, StageName};

use crate::{StageStore, StorageError};

const ARTIFACT_DIR: &str = "artifacts";

/// The identity fields of a stored batch; `records` is skipped unparsed.
#[derive(Deserialize)]
struct BatchHeader {
    run_id: RunId,
    created_at: DateTime<Utc>,
}

/// Directory for each stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePaths {
    pub raw: PathBuf,
    pub processed: PathBuf,
    pub output: PathBuf,
}

impl StagePaths {
    #[must_use]
    pub fn from_config(data: &DataConfig) -> Self {
        Self {
            raw: data.raw_data_path.clone(),
            processed: data.processed_data_path.clone(),
            output: data.output_data_path.clone(),
        }
    }

    /// All three stages under one root, as `root/{raw,processed,output}`.
    #[must_use]
    pub fn under(root: &Path) -> Self {
        Self {
            raw: root.join("raw"),
            processed: root.join("processed"),
            output: root.join("output"),
        }
    }

    #[must_use]
    pub fn dir(&self, stage: StageName) -> &Path {
        match stage {
            StageName::Raw => &self.raw,
            StageName::Processed => &self.processed,
            StageName::Output => &self.output,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FsStageStore {
    paths: StagePaths,
}

impl FsStageStore {
    /// Directories are created lazily on first write.
    #[must_use]
    pub fn new(paths: StagePaths) -> Self {
        Self { paths }
    }

    #[must_use]
    pub fn paths(&self) -> &StagePaths {
        &self.paths
    }

    /// Location of the batch for `(stage, run_id)`.
    #[must_use]
    pub fn batch_path(&self, stage: StageName, run_id: &RunId) -> PathBuf {
        self.paths.dir(stage).join(format!("{run_id}.json"))
    }

    #[must_use]
    pub fn artifact_dir(&self) -> PathBuf {
        self.paths.output.join(ARTIFACT_DIR)
    }

    /// Batch files of `stage`, newest first by `(created_at, run_id)`.
    ///
    /// Only the header of each file is decoded here. Files whose header
    /// cannot be read are logged and left out.
    fn newest_first(&self, stage: StageName) -> Result<Vec<PathBuf>, StorageError> {
        let dir = self.paths.dir(stage);
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::Io {
                    stage,
                    path: dir.to_path_buf(),
                    source,
                });
            }
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::Io {
                stage,
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let is_batch = path.extension().is_some_and(|ext| ext == "json")
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| RunId::parse(s).is_ok());
            if !is_batch || !path.is_file() {
                continue;
            }

            match Self::read_header(stage, &path) {
                Ok(header) => found.push((header.created_at, header.run_id, path)),
                Err(e) => {
                    tracing::warn!(stage = %stage, error = %e, "skipping unreadable batch");
                }
            }
        }

        found.sort_by(|a, b| (b.0, &b.1).cmp(&(a.0, &a.1)));
        Ok(found.into_iter().map(|(_, _, path)| path).collect())
    }

    fn read_header(stage: StageName, path: &Path) -> Result<BatchHeader, StorageError> {
        let file = fs::File::open(path).map_err(|source| StorageError::Io {
            stage,
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(io::BufReader::new(file)).map_err(|source| StorageError::Serde {
            stage,
            path: path.to_path_buf(),
            source,
        })
    }

    fn read_path<R: DeserializeOwned>(
        stage: StageName,
        path: &Path,
    ) -> Result<StageBatch<R>, StorageError> {
        let bytes = fs::read(path).map_err(|source| StorageError::Io {
            stage,
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| StorageError::Serde {
            stage,
            path: path.to_path_buf(),
            source,
        })
    }
}

impl StageStore for FsStageStore {
    fn write<R: Serialize>(
        &self,
        stage: StageName,
        run_id: &RunId,
        records: Vec<R>,
    ) -> Result<StageBatch<R>, StorageError> {
        let batch = StageBatch {
            stage_name: stage,
            run_id: run_id.clone(),
            records,
            created_at: Utc::now(),
        };
        let path = self.batch_path(stage, run_id);
        let bytes = serde_json::to_vec_pretty(&batch).map_err(|source| StorageError::Serde {
            stage,
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes).map_err(|source| StorageError::Io {
            stage,
            path: path.clone(),
            source,
        })?;

        tracing::debug!(
            stage = %stage,
            run_id = %run_id,
            records = batch.records.len(),
            path = %path.display(),
            "stage batch written"
        );
        Ok(batch)
    }

    fn read<R: DeserializeOwned>(
        &self,
        stage: StageName,
        run_id: &RunId,
    ) -> Result<StageBatch<R>, StorageError> {
        let path = self.batch_path(stage, run_id);
        match Self::read_path(stage, &path) {
            Err(StorageError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound {
                    stage,
                    run_id: run_id.clone(),
                })
            }
            other => other,
        }
    }

    fn recent<R: DeserializeOwned>(
        &self,
        stage: StageName,
        limit: usize,
    ) -> Result<Vec<StageBatch<R>>, StorageError> {
        let mut batches = Vec::new();
        for path in self.newest_first(stage)? {
            if batches.len() == limit {
                break;
            }
            match Self::read_path(stage, &path) {
                Ok(batch) => batches.push(batch),
                Err(e) => {
                    tracing::warn!(stage = %stage, error = %e, "skipping unreadable batch");
                }
            }
        }
        Ok(batches)
    }

    fn write_artifact(
        &self,
        run_id: &RunId,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        if !is_safe_file_name(name) {
            return Err(StorageError::InvalidArtifactName(name.to_owned()));
        }
        let path = self.artifact_dir().join(name);
        write_atomic(&path, bytes).map_err(|source| StorageError::Io {
            stage: StageName::Output,
            path: path.clone(),
            source,
        })?;
        tracing::debug!(run_id = %run_id, path = %path.display(), "artifact written");
        Ok(())
    }
}

/// Writes `bytes` to `<path>.tmp`, syncs, then renames over `path`, so
/// readers see either the old file or the new one.
///
/// # Errors
///
/// Returns any I/O error from creating the parent directory, writing the
/// temporary file or renaming it.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
