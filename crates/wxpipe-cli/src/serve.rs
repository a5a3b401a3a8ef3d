//! Long-running mode: scheduled runs plus the Prometheus scrape endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tower_http::trace::TraceLayer;
use wxpipe_core::{PipelineConfig, RunId, RunStatus};
use wxpipe_fetch::WeatherClient;
use wxpipe_pipeline::{MetricsRegistry, Pipeline, RunFlags};
use wxpipe_store::FsStageStore;

const HEALTH_PATH: &str = "/healthz";
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// One pipeline shared by the startup run and every scheduled tick.
pub struct PipelineJob {
    pipeline: Pipeline<WeatherClient, FsStageStore>,
    metrics: Arc<MetricsRegistry>,
    running: Mutex<()>,
}

impl PipelineJob {
    pub fn new(
        pipeline: Pipeline<WeatherClient, FsStageStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            pipeline,
            metrics,
            running: Mutex::new(()),
        }
    }

    /// A tick that fires while the previous run is still going is skipped.
    pub async fn run_scheduled(&self) {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::warn!("previous pipeline run still in progress; skipping tick");
            return;
        };

        match self.pipeline.run(RunFlags::default()).await {
            Ok(result) => {
                tracing::info!(
                    run_id = %result.run_id,
                    status = result.overall_status.as_str(),
                    "scheduled pipeline run finished"
                );
                self.metrics.record(&result);
            }
            Err(e) => {
                tracing::error!(error = %e, "scheduled pipeline run could not start");
                self.metrics.record_init_failure();
            }
        }
    }
}

/// Registers the pipeline job on `schedule` and starts the scheduler.
///
/// The returned scheduler must be kept alive for jobs to fire.
///
/// # Errors
///
/// Returns [`JobSchedulerError`] if the cron expression is invalid or the
/// scheduler fails to start.
pub async fn build_scheduler(
    job: Arc<PipelineJob>,
    schedule: &str,
) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;

    let pipeline_job = Job::new_async(schedule, move |_uuid, _lock| {
        let job = Arc::clone(&job);
        Box::pin(async move {
            tracing::info!("scheduler: starting pipeline run");
            job.run_scheduled().await;
        })
    })?;

    scheduler.add(pipeline_job).await?;
    scheduler.start().await?;

    tracing::info!(schedule, "scheduler started");
    Ok(scheduler)
}

#[derive(Debug, Serialize)]
struct HealthData {
    status: &'static str,
    last_run_id: Option<RunId>,
    last_run_status: Option<RunStatus>,
}

async fn metrics_handler(State(metrics): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        metrics.render(),
    )
}

async fn health_handler(State(metrics): State<Arc<MetricsRegistry>>) -> Json<HealthData> {
    let last = metrics.last_run();
    Json(HealthData {
        status: "ok",
        last_run_id: last.as_ref().map(|r| r.run_id.clone()),
        last_run_status: last.map(|r| r.overall_status),
    })
}

/// Metrics at `metrics_path`, liveness at `/healthz`.
pub fn build_router(metrics: Arc<MetricsRegistry>, metrics_path: &str) -> Router {
    let mut router = Router::new().route(metrics_path, get(metrics_handler));
    if metrics_path != HEALTH_PATH {
        router = router.route(HEALTH_PATH, get(health_handler));
    }
    router.layer(TraceLayer::new_for_http()).with_state(metrics)
}

pub async fn serve(config: PipelineConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(MetricsRegistry::new());
    let pipeline = crate::build_pipeline(&config)?;
    let job = Arc::new(PipelineJob::new(pipeline, Arc::clone(&metrics)));

    let mut scheduler = build_scheduler(Arc::clone(&job), &config.pipeline.schedule).await?;

    tokio::spawn({
        let job = Arc::clone(&job);
        async move {
            tracing::info!("running pipeline once at startup");
            job.run_scheduled().await;
        }
    });

    let app = build_router(metrics, &config.monitoring.path);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.monitoring.prometheus_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, path = %config.monitoring.path, "serving metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("received shutdown signal, starting graceful shutdown");
}
