//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  - Prometheus text format
//!   GET /healthz  - Liveness probe (always 200 if process is running)
//!   GET /readyz   - Readiness probe (200 if the destination share is present)

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use futures::future::BoxFuture;
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::Registry,
};
use std::path::PathBuf;
use std::sync::Arc;

use vidsync_core::types::JobKind;
use vidsync_core::PipelineResult;
use vidsync_queue::{JobContext, JobHandler, JobOutcome};

// ── Job metrics ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct JobMetrics {
    jobs_processed: Family<Vec<(String, String)>, Counter>,
    jobs_failed: Family<Vec<(String, String)>, Counter>,
    job_duration: Family<Vec<(String, String)>, Histogram>,
}

impl JobMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let jobs_processed = Family::default();
        let jobs_failed = Family::default();
        let job_duration = Family::<Vec<(String, String)>, Histogram>::new_with_constructor(|| {
            Histogram::new([1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0])
        });

        registry.register(
            "vidsync_jobs_processed",
            "Jobs whose handler returned successfully",
            jobs_processed.clone(),
        );
        registry.register(
            "vidsync_jobs_failed",
            "Jobs whose handler returned an error",
            jobs_failed.clone(),
        );
        registry.register(
            "vidsync_job_duration_seconds",
            "Handler run time in seconds",
            job_duration.clone(),
        );

        JobMetrics {
            jobs_processed,
            jobs_failed,
            job_duration,
        }
    }

    fn labels(kind: JobKind) -> Vec<(String, String)> {
        vec![("job_type".to_string(), kind.as_str().to_string())]
    }

    fn record(&self, kind: JobKind, ok: bool, elapsed_secs: f64) {
        let labels = Self::labels(kind);
        if ok {
            self.jobs_processed.get_or_create(&labels).inc();
        } else {
            self.jobs_failed.get_or_create(&labels).inc();
        }
        self.job_duration.get_or_create(&labels).observe(elapsed_secs);
    }
}

/// Wraps a handler and records counters and durations for each run.
pub struct Metered {
    inner: Arc<dyn JobHandler>,
    metrics: JobMetrics,
}

impl Metered {
    pub fn wrap(inner: Arc<dyn JobHandler>, metrics: JobMetrics) -> Arc<Self> {
        Arc::new(Metered { inner, metrics })
    }
}

impl JobHandler for Metered {
    fn kind(&self) -> JobKind {
        self.inner.kind()
    }

    fn run(&self, ctx: JobContext) -> BoxFuture<'_, PipelineResult<JobOutcome>> {
        Box::pin(async move {
            let start = std::time::Instant::now();
            let result = self.inner.run(ctx).await;
            self.metrics
                .record(self.kind(), result.is_ok(), start.elapsed().as_secs_f64());
            result
        })
    }
}

// ── HTTP ─────────────────────────────────────────────────────────────────────

/// Shared health state updated by the daemon
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub dest_root: PathBuf,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9100")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: the network share must be reachable to accept syncs.
async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match tokio::fs::metadata(&state.dest_root).await {
        Ok(meta) if meta.is_dir() => (StatusCode::OK, "ready"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "destination share unavailable"),
    }
}
