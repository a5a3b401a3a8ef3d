//! Sequencing of one pipeline run.
//!
//! A run moves through explicit phases:
//!
//! ```text
//! Init → Extracting → Transforming → Publishing (load ∥ analyze) → Finalized
//! ```
//!
//! Skip flags are resolved at `Init`: a skipped extract or transform is
//! replaced by the most recent prior batch of its output stage, and a
//! missing prior batch stops the run before anything else happens. After
//! `Init` every failure is recorded on the [`RunResult`] and nothing is
//! raised.

use std::path::PathBuf;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use wxpipe_core::{
    CityFailure, CityTarget, CleanedReading, PipelineConfig, PipelineStage, RawReading, RunId,
    RunResult, RunStatus, StageName, StageOutcome,
};
use wxpipe_fetch::{FetchError, FetchFailure, WeatherSource};
use wxpipe_store::StageStore;

use crate::analyze::{analyze_with_history, ChartData, Summary};
use crate::clean::Cleaner;
use crate::error::{ExportError, PipelineError};
use crate::export::{load, with_storage_retry, LoadReport};

/// Run-level switches, one per stage, plus per-run overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFlags {
    pub skip_extract: bool,
    pub skip_transform: bool,
    pub skip_analyze: bool,
    pub skip_load: bool,
    /// Generated when absent.
    pub run_id: Option<RunId>,
    /// Overrides `pipeline.deadline_secs`.
    pub deadline: Option<Duration>,
}

#[must_use]
pub fn analysis_artifact_name(run_id: &RunId) -> String {
    format!("analysis_{run_id}.json")
}

#[must_use]
pub fn charts_artifact_name(run_id: &RunId) -> String {
    format!("charts_{run_id}.json")
}

enum Phase {
    Extracting,
    Transforming(Vec<RawReading>),
    Publishing(Vec<CleanedReading>),
    Finalized(RunStatus),
}

/// Mutable bookkeeping for the run in progress.
struct RunState {
    result: RunResult,
    /// Set by anything that makes a run `partial` rather than `success`.
    degraded: bool,
    /// Stand-in for a skipped transform.
    prior_processed: Option<Vec<CleanedReading>>,
}

impl RunState {
    fn fail(&mut self, stage: PipelineStage, mut outcome: StageOutcome, error: String) -> Phase {
        tracing::error!(
            run_id = %self.result.run_id,
            stage = %stage,
            error = %error,
            "required stage failed; finalizing run"
        );
        outcome.error = Some(error);
        self.result.record(stage, outcome);
        Phase::Finalized(RunStatus::Failed)
    }
}

/// The pipeline for a fixed configuration, weather source and store.
pub struct Pipeline<F, S> {
    source: F,
    store: S,
    cities: Vec<CityTarget>,
    concurrency: usize,
    deadline: Option<Duration>,
    cleaner: Cleaner,
    database: PathBuf,
    history_batches: usize,
}

impl<F: WeatherSource, S: StageStore> Pipeline<F, S> {
    /// # Errors
    ///
    /// Returns [`PipelineError::Cleaning`] when the cleaning policy is
    /// unusable.
    pub fn new(config: &PipelineConfig, source: F, store: S) -> Result<Self, PipelineError> {
        Ok(Self {
            source,
            store,
            cities: config.data.cities.clone(),
            concurrency: config.pipeline.batch_size.max(1),
            deadline: config.pipeline.deadline(),
            cleaner: Cleaner::new(config.cleaning)?,
            database: config.data.database_path.clone(),
            history_batches: config.pipeline.history_batches,
        })
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Executes one run.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] only when the run cannot start: a skipped
    /// stage has no prior batch to stand in for it. Every other failure is
    /// reported through the returned [`RunResult`].
    pub async fn run(&self, flags: RunFlags) -> Result<RunResult, PipelineError> {
        let run_id = flags.run_id.clone().unwrap_or_else(RunId::generate);
        let deadline = flags
            .deadline
            .or(self.deadline)
            .map(|d| Instant::now() + d);

        let mut state = RunState {
            result: RunResult::new(run_id.clone()),
            degraded: false,
            prior_processed: None,
        };
        tracing::info!(
            run_id = %run_id,
            cities = self.cities.len(),
            skip_extract = flags.skip_extract,
            skip_transform = flags.skip_transform,
            skip_load = flags.skip_load,
            skip_analyze = flags.skip_analyze,
            "pipeline run starting"
        );

        let mut phase = self.init(&flags, &mut state)?;
        loop {
            phase = match phase {
                Phase::Extracting => self.extract(&mut state, deadline).await,
                Phase::Transforming(raw) => self.transform(&mut state, &raw),
                Phase::Publishing(cleaned) => self.publish(&mut state, &flags, &cleaned).await,
                Phase::Finalized(status) => {
                    state.result.finalize(status);
                    break;
                }
            };
        }

        let result = state.result;
        tracing::info!(
            run_id = %result.run_id,
            status = %result.overall_status,
            city_failures = result.city_failures.len(),
            elapsed_ms = result.elapsed().map_or(0, |d| d.as_millis()),
            "pipeline run finished"
        );
        Ok(result)
    }

    /// Resolves skip flags into the first phase to execute.
    fn init(&self, flags: &RunFlags, state: &mut RunState) -> Result<Phase, PipelineError> {
        let prior_processed = if flags.skip_transform {
            let batch = self
                .store
                .latest::<CleanedReading>(StageName::Processed)
                .map_err(|e| PipelineError::from_prior_read(StageName::Processed, e))?;
            tracing::info!(
                prior_run = %batch.run_id,
                records = batch.records.len(),
                "using prior processed batch"
            );
            Some(batch.records)
        } else {
            None
        };

        let prior_raw = if flags.skip_extract && !flags.skip_transform {
            let batch = self
                .store
                .latest::<RawReading>(StageName::Raw)
                .map_err(|e| PipelineError::from_prior_read(StageName::Raw, e))?;
            tracing::info!(
                prior_run = %batch.run_id,
                records = batch.records.len(),
                "using prior raw batch"
            );
            Some(batch.records)
        } else {
            None
        };

        if flags.skip_extract {
            state.result.record(PipelineStage::Extract, StageOutcome::skipped());
        }
        if flags.skip_transform {
            state.result.record(PipelineStage::Transform, StageOutcome::skipped());
        }

        Ok(match (flags.skip_extract, prior_raw, prior_processed) {
            (false, _, processed) => {
                state.prior_processed = processed;
                Phase::Extracting
            }
            (true, Some(raw), _) => Phase::Transforming(raw),
            (true, None, processed) => Phase::Publishing(processed.unwrap_or_default()),
        })
    }

    async fn extract(&self, state: &mut RunState, deadline: Option<Instant>) -> Phase {
        let started = Instant::now();
        let run_id = state.result.run_id.clone();

        let fetches: Vec<_> = self
            .cities
            .iter()
            .map(|city| self.fetch_city(city, deadline))
            .collect();
        let results: Vec<Result<RawReading, CityFailure>> = stream::iter(fetches)
            .buffered(self.concurrency.min(self.cities.len()).max(1))
            .collect()
            .await;

        let mut readings = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(reading) => readings.push(reading),
                Err(failure) => {
                    tracing::warn!(
                        run_id = %run_id,
                        city = %failure.target,
                        attempts = failure.attempts,
                        retryable = failure.retryable,
                        error = %failure.message,
                        "city fetch failed"
                    );
                    state.result.city_failures.push(failure);
                }
            }
        }

        let failed = state.result.city_failures.len();
        let mut outcome = StageOutcome {
            attempted: self.cities.len(),
            succeeded: readings.len(),
            failed,
            duration: started.elapsed(),
            ..StageOutcome::default()
        };

        if readings.is_empty() {
            return state.fail(
                PipelineStage::Extract,
                outcome,
                "no city produced a usable reading".to_owned(),
            );
        }
        if failed > 0 {
            state.degraded = true;
        }

        if let Err(e) = self.store.write(StageName::Raw, &run_id, readings.clone()) {
            outcome.duration = started.elapsed();
            return state.fail(PipelineStage::Extract, outcome, e.to_string());
        }
        outcome.duration = started.elapsed();
        state.result.record(PipelineStage::Extract, outcome);
        match state.prior_processed.take() {
            Some(processed) => Phase::Publishing(processed),
            None => Phase::Transforming(readings),
        }
    }

    /// One city. A reading that arrives after the deadline counts as failed,
    /// with the attempts the source actually made.
    async fn fetch_city(
        &self,
        city: &CityTarget,
        deadline: Option<Instant>,
    ) -> Result<RawReading, CityFailure> {
        let error = match self.source.fetch(city, deadline).await {
            Ok(fetched) if deadline.is_some_and(|d| Instant::now() > d) => FetchError::new(
                city.clone(),
                FetchFailure::DeadlineExceeded,
                fetched.attempts,
            ),
            Ok(fetched) => return Ok(fetched.reading),
            Err(e) => e,
        };
        Err(CityFailure {
            target: city.clone(),
            message: error.cause.to_string(),
            retryable: error.retryable,
            attempts: error.attempts,
        })
    }

    fn transform(&self, state: &mut RunState, raw: &[RawReading]) -> Phase {
        let started = Instant::now();
        let mut outcome = StageOutcome {
            attempted: raw.len(),
            ..StageOutcome::default()
        };

        let (cleaned, report) = match self.cleaner.clean(raw) {
            Ok(cleaned) => cleaned,
            Err(e) => {
                outcome.failed = raw.len();
                outcome.duration = started.elapsed();
                return state.fail(PipelineStage::Transform, outcome, e.to_string());
            }
        };
        state.result.cleaning = Some(report);
        outcome.succeeded = cleaned.len();
        outcome.failed = report.dropped;
        if report.dropped > 0 {
            state.degraded = true;
        }

        if cleaned.is_empty() {
            outcome.duration = started.elapsed();
            return state.fail(
                PipelineStage::Transform,
                outcome,
                "no reading survived cleaning".to_owned(),
            );
        }

        let run_id = state.result.run_id.clone();
        if let Err(e) = self.store.write(StageName::Processed, &run_id, cleaned.clone()) {
            outcome.duration = started.elapsed();
            return state.fail(PipelineStage::Transform, outcome, e.to_string());
        }

        outcome.duration = started.elapsed();
        state.result.record(PipelineStage::Transform, outcome);
        Phase::Publishing(cleaned)
    }

    /// Load and analyze, concurrently. Neither blocks the other; a failure
    /// in either makes the run partial.
    async fn publish(
        &self,
        state: &mut RunState,
        flags: &RunFlags,
        cleaned: &[CleanedReading],
    ) -> Phase {
        let run_id = state.result.run_id.clone();
        let history = if flags.skip_analyze {
            Vec::new()
        } else {
            self.trend_history(&run_id)
        };
        let summary = analyze_with_history(cleaned, &history);

        let load_stage = async {
            if flags.skip_load {
                return StageOutcome::skipped();
            }
            let started = Instant::now();
            let result = load(&self.store, &run_id, cleaned, &summary, &self.database).await;
            let result = result.map(|r: LoadReport| {
                tracing::info!(
                    run_id = %run_id,
                    records = r.records,
                    database_rows = r.database_rows,
                    artifacts = ?r.artifacts,
                    "load complete"
                );
            });
            stage_outcome(cleaned.len(), started.elapsed(), result)
        };

        let analyze_stage = async {
            if flags.skip_analyze {
                return StageOutcome::skipped();
            }
            let started = Instant::now();
            let result = self.persist_analysis(&run_id, cleaned, &summary).await;
            stage_outcome(cleaned.len(), started.elapsed(), result)
        };

        let (load_outcome, analyze_outcome) = tokio::join!(load_stage, analyze_stage);
        for (stage, outcome) in [
            (PipelineStage::Load, load_outcome),
            (PipelineStage::Analyze, analyze_outcome),
        ] {
            if let Some(error) = &outcome.error {
                tracing::warn!(
                    run_id = %run_id,
                    stage = %stage,
                    error = %error,
                    "optional stage failed"
                );
                state.degraded = true;
            }
            state.result.record(stage, outcome);
        }

        Phase::Finalized(if state.degraded {
            RunStatus::Partial
        } else {
            RunStatus::Success
        })
    }

    /// Records of up to `history_batches` earlier processed batches. An
    /// unreadable history only narrows the trends.
    fn trend_history(&self, run_id: &RunId) -> Vec<CleanedReading> {
        if self.history_batches == 0 {
            return Vec::new();
        }
        let limit = self.history_batches + 1;
        match self.store.recent::<CleanedReading>(StageName::Processed, limit) {
            Ok(batches) => batches
                .into_iter()
                .filter(|b| &b.run_id != run_id)
                .take(self.history_batches)
                .flat_map(|b| b.records)
                .collect(),
            Err(e) => {
                tracing::warn!(
                    run_id = %run_id,
                    error = %e,
                    "prior processed batches unreadable; trends cover this run only"
                );
                Vec::new()
            }
        }
    }

    async fn persist_analysis(
        &self,
        run_id: &RunId,
        cleaned: &[CleanedReading],
        summary: &Summary,
    ) -> Result<(), ExportError> {
        let analysis = serde_json::to_vec_pretty(summary)?;
        let charts = serde_json::to_vec_pretty(&ChartData::build(cleaned, summary))?;

        for (name, bytes) in [
            (analysis_artifact_name(run_id), analysis),
            (charts_artifact_name(run_id), charts),
        ] {
            with_storage_retry(&name, || self.store.write_artifact(run_id, &name, &bytes)).await?;
        }
        tracing::info!(
            run_id = %run_id,
            cities = summary.per_city_stats.len(),
            trends = summary.trends.len(),
            warmest = ?summary.warmest_city,
            coldest = ?summary.coldest_city,
            "analysis complete"
        );
        Ok(())
    }
}

fn stage_outcome(
    records: usize,
    duration: Duration,
    result: Result<(), ExportError>,
) -> StageOutcome {
    match result {
        Ok(()) => StageOutcome {
            attempted: records,
            succeeded: records,
            duration,
            ..StageOutcome::default()
        },
        Err(e) => StageOutcome {
            attempted: records,
            failed: records,
            duration,
            error: Some(e.to_string()),
            ..StageOutcome::default()
        },
    }
}
