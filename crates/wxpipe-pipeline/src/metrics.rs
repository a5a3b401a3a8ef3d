//! Run metrics in Prometheus text exposition format.
//!
//! Every value is read from a [`RunResult`]; the registry only adds the two
//! cumulative counters.

use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};

use wxpipe_core::{PipelineStage, RunResult, RunStatus};

#[derive(Debug, Default)]
struct State {
    runs_total: u64,
    run_failures_total: u64,
    last: Option<RunResult>,
}

/// Shared between the scheduler job and the HTTP handler.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    state: Mutex<State>,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: &RunResult) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.runs_total += 1;
        if result.overall_status == RunStatus::Failed {
            state.run_failures_total += 1;
        }
        state.last = Some(result.clone());
    }

    /// Counts a run that could not start. The last result is kept.
    pub fn record_init_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.runs_total += 1;
        state.run_failures_total += 1;
    }

    #[must_use]
    pub fn last_run(&self) -> Option<RunResult> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last
            .clone()
    }

    #[must_use]
    pub fn render(&self) -> String {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();

        family(
            &mut out,
            "wxpipe_runs_total",
            "counter",
            "Pipeline runs started.",
        );
        sample(&mut out, "wxpipe_runs_total", None, state.runs_total);
        family(
            &mut out,
            "wxpipe_run_failures_total",
            "counter",
            "Pipeline runs that finished as failed or could not start.",
        );
        sample(
            &mut out,
            "wxpipe_run_failures_total",
            None,
            state.run_failures_total,
        );

        if let Some(result) = &state.last {
            render_run(&mut out, result);
        }
        out
    }
}

fn render_run(out: &mut String, result: &RunResult) {
    let gauges: [(&str, &str, fn(&wxpipe_core::StageOutcome) -> f64); 4] = [
        ("wxpipe_stage_attempted", "Items attempted by the stage in the last run.", |o| {
            count(o.attempted)
        }),
        ("wxpipe_stage_succeeded", "Items that succeeded in the last run.", |o| {
            count(o.succeeded)
        }),
        ("wxpipe_stage_failed", "Items that failed in the last run.", |o| {
            count(o.failed)
        }),
        ("wxpipe_stage_duration_seconds", "Stage wall-clock time in the last run.", |o| {
            o.duration.as_secs_f64()
        }),
    ];

    for (name, help, value) in gauges {
        family(out, name, "gauge", help);
        for stage in PipelineStage::ALL {
            if let Some(outcome) = result.outcome(stage) {
                sample(out, name, Some(("stage", stage.as_str())), value(outcome));
            }
        }
    }

    family(
        out,
        "wxpipe_run_status",
        "gauge",
        "1 for the overall status of the last run, 0 otherwise.",
    );
    for status in RunStatus::ALL {
        let on = u8::from(status == result.overall_status);
        sample(
            out,
            "wxpipe_run_status",
            Some(("status", status.as_str())),
            on,
        );
    }

    let cleaning = result.cleaning.unwrap_or_default();
    family(
        out,
        "wxpipe_records_dropped",
        "gauge",
        "Readings dropped by cleaning in the last run.",
    );
    sample(out, "wxpipe_records_dropped", None, cleaning.dropped);
    family(
        out,
        "wxpipe_records_flagged",
        "gauge",
        "Readings flagged as outliers in the last run.",
    );
    sample(out, "wxpipe_records_flagged", None, cleaning.flagged);

    if let Some(finished) = result.finished_at {
        family(
            out,
            "wxpipe_last_run_timestamp_seconds",
            "gauge",
            "Unix time the last run finished.",
        );
        sample(
            out,
            "wxpipe_last_run_timestamp_seconds",
            None,
            finished.timestamp(),
        );
    }
}

#[allow(clippy::cast_precision_loss)]
fn count(n: usize) -> f64 {
    n as f64
}

fn family(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn sample(
    out: &mut String,
    name: &str,
    label: Option<(&str, &str)>,
    value: impl std::fmt::Display,
) {
    let _ = match label {
        Some((key, v)) => writeln!(out, "{name}{{{key}=\"{v}\"}} {value}"),
        None => writeln!(out, "{name} {value}"),
    };
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wxpipe_core::{CleaningReport, RunId, StageOutcome};

    use super::*;

    fn partial_run() -> RunResult {
        let mut result = RunResult::new(RunId::parse("r1").unwrap());
        result.record(
            PipelineStage::Extract,
            StageOutcome {
                attempted: 2,
                succeeded: 1,
                failed: 1,
                duration: Duration::from_millis(1_500),
                ..StageOutcome::default()
            },
        );
        result.record(PipelineStage::Load, StageOutcome::skipped());
        result.cleaning = Some(CleaningReport {
            dropped: 0,
            flagged: 1,
        });
        result.finalize(RunStatus::Partial);
        result
    }

    #[test]
    fn render_before_any_run_has_only_counters() {
        let text = MetricsRegistry::new().render();
        assert!(text.contains("wxpipe_runs_total 0\n"));
        assert!(text.contains("wxpipe_run_failures_total 0\n"));
        assert!(!text.contains("wxpipe_stage_attempted"));
    }

    #[test]
    fn render_reflects_last_run_result() {
        let registry = MetricsRegistry::new();
        registry.record(&partial_run());
        let text = registry.render();

        assert!(text.contains("wxpipe_runs_total 1\n"));
        assert!(text.contains("wxpipe_run_failures_total 0\n"));
        assert!(text.contains("wxpipe_stage_attempted{stage=\"extract\"} 2\n"));
        assert!(text.contains("wxpipe_stage_succeeded{stage=\"extract\"} 1\n"));
        assert!(text.contains("wxpipe_stage_failed{stage=\"extract\"} 1\n"));
        assert!(text.contains("wxpipe_stage_duration_seconds{stage=\"extract\"} 1.5\n"));
        assert!(text.contains("wxpipe_stage_attempted{stage=\"load\"} 0\n"));
        assert!(text.contains("wxpipe_run_status{status=\"partial\"} 1\n"));
        assert!(text.contains("wxpipe_run_status{status=\"success\"} 0\n"));
        assert!(text.contains("wxpipe_records_flagged 1\n"));
        assert!(text.contains("# TYPE wxpipe_stage_failed gauge\n"));
    }

    #[test]
    fn failed_runs_and_init_failures_are_counted() {
        let registry = MetricsRegistry::new();
        let mut failed = RunResult::new(RunId::parse("r2").unwrap());
        failed.finalize(RunStatus::Failed);
        registry.record(&failed);
        registry.record_init_failure();

        let text = registry.render();
        assert!(text.contains("wxpipe_runs_total 2\n"));
        assert!(text.contains("wxpipe_run_failures_total 2\n"));
        assert_eq!(
            registry.last_run().map(|r| r.run_id),
            Some(RunId::parse("r2").unwrap())
        );
    }
}
