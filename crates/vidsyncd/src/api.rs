//! Control API and live event stream.
//!
//! Endpoints:
//!   POST /api/sync/{uuid}         - queue a sync for a connected device
//!   POST /api/merge/{uuid}        - queue a merge of a synced folder
//!   POST /api/stabilize/{uuid}    - queue merge-then-stabilize, or a fragment stabilize
//!   POST /api/jobs/{id}/cancel
//!   GET  /api/jobs/{id}
//!   GET  /api/queue[?state=..]
//!   GET  /api/capabilities
//!   GET  /api/logs                - recent log buffer
//!   GET  /api/events              - Server-Sent Events

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::path::{Component, PathBuf};
use std::sync::Arc;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{info, warn};

use vidsync_core::device::{DeviceConfig, DeviceRegistry, DeviceStatus};
use vidsync_core::types::{
    JobKind, JobState, LogLevel, MergePayload, StabilizeMode, StabilizePayload, SyncPayload,
};
use vidsync_core::{Event, Publisher};
use vidsync_pipeline::tools::{run_checked, ToolCommand, ToolRunner};
use vidsync_queue::{CancelOutcome, EnqueueOptions, QueueError, Scheduler};

use crate::publisher::BroadcastPublisher;

/// What this worker can do, as reported to the dashboard.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Capabilities {
    pub gpu_support: bool,
    pub gpu_available: bool,
    pub stabilization_enabled: bool,
    pub merge_enabled: bool,
    pub sync_enabled: bool,
}

impl Capabilities {
    pub fn to_event(self) -> Event {
        Event::WorkerCapabilities {
            gpu_support: self.gpu_support,
            gpu_available: self.gpu_available,
            stabilization_enabled: self.stabilization_enabled,
            merge_enabled: self.merge_enabled,
            sync_enabled: self.sync_enabled,
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub publisher: Arc<BroadcastPublisher>,
    pub runner: Arc<dyn ToolRunner>,
    pub findfs: PathBuf,
    pub devices_file: PathBuf,
    pub dest_root: PathBuf,
    pub capabilities: Capabilities,
}

impl ApiState {
    fn log(&self, level: LogLevel, msg: impl Into<String>) {
        self.publisher.emit(Event::log(level, msg));
    }

    fn device(&self, uuid: &str) -> Result<DeviceConfig, ApiError> {
        let registry = DeviceRegistry::load(&self.devices_file)
            .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))?;
        registry.find(uuid).cloned().ok_or_else(|| {
            self.log(
                LogLevel::Warning,
                format!("Request for unknown device {uuid}"),
            );
            ApiError::new(StatusCode::NOT_FOUND, "Unknown Device")
        })
    }

    /// `<dest_root>/<outputPath>/<folder>`, which must exist.
    fn device_folder(&self, device: &DeviceConfig, folder: Option<&str>) -> Result<PathBuf, ApiError> {
        let folder = folder
            .filter(|f| !f.is_empty())
            .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "Folder path required"))?;
        let folder = folder.trim_start_matches('/');
        if std::path::Path::new(folder)
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "Invalid folder path"));
        }
        let path = self
            .dest_root
            .join(device.out_folder())
            .join(folder);
        if !path.is_dir() {
            return Err(ApiError::new(StatusCode::NOT_FOUND, "Folder not found"));
        }
        Ok(path)
    }

    fn submit(
        &self,
        kind: JobKind,
        device: &DeviceConfig,
        payload: Value,
        label: &str,
    ) -> Result<Json<Value>, ApiError> {
        let job_id = format!("{kind}-{}-{}", device.uuid, chrono::Utc::now().timestamp_millis());
        let job = self
            .scheduler
            .submit(
                kind,
                &device.uuid,
                device.display_name(),
                payload,
                EnqueueOptions {
                    priority: None,
                    job_id: Some(job_id),
                },
            )
            .map_err(ApiError::from)?;
        info!(job_id = %job.id, device = %device.display_name(), "{label} queued");
        self.log(
            LogLevel::Info,
            format!("{label} job queued for {} (Job ID: {})", device.display_name(), job.id),
        );
        Ok(Json(json!({
            "success": true,
            "message": format!("{label} job queued"),
            "jobId": job.id,
        })))
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        let status = match &e {
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::InvalidState { .. } => StatusCode::CONFLICT,
            QueueError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

// ── Routes ───────────────────────────────────────────────────────────────────

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/sync/{uuid}", post(sync_device))
        .route("/api/merge/{uuid}", post(merge_folder))
        .route("/api/stabilize/{uuid}", post(stabilize_folder))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/queue", get(queue_status))
        .route("/api/capabilities", get(capabilities))
        .route("/api/logs", get(recent_logs))
        .route("/api/events", get(events))
        .with_state(state)
}

pub async fn serve(addr: String, state: ApiState, shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("api bind {addr}: {e}"))?;
    info!(addr = %addr, "api: listening");

    let mut shutdown = shutdown;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|e| anyhow::anyhow!("api server: {e}"))
}

async fn sync_device(
    State(state): State<ApiState>,
    Path(uuid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let device = state.device(&uuid)?;
    if device.status == DeviceStatus::Paused {
        state.log(
            LogLevel::Warning,
            format!("Sync refused for paused device {uuid}"),
        );
        return Err(ApiError::new(StatusCode::CONFLICT, "Device is paused"));
    }

    let cmd = ToolCommand::new(&state.findfs).arg(format!("UUID={uuid}"));
    let output = run_checked(state.runner.as_ref(), &cmd).await.map_err(|e| {
        state.log(
            LogLevel::Error,
            format!("Sync failed for device {uuid}: {e}"),
        );
        ApiError::new(StatusCode::NOT_FOUND, "Device not connected")
    })?;
    let dev_path = output.stdout.trim();
    let node = dev_path.rsplit('/').next().unwrap_or(dev_path).to_string();
    if node.is_empty() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "Device not connected"));
    }

    let payload = SyncPayload {
        device_handle: node,
        uuid: uuid.clone(),
        config: device.clone(),
    };
    state.submit(JobKind::Sync, &device, encode(&payload)?, "Sync")
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeRequest {
    pub folder: Option<String>,
    pub delete_after: bool,
}

async fn merge_folder(
    State(state): State<ApiState>,
    Path(uuid): Path<String>,
    Json(req): Json<MergeRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut device = state.device(&uuid)?;
    let target_folder = state.device_folder(&device, req.folder.as_deref())?;
    device.delete_after_merge = req.delete_after;

    let payload = MergePayload {
        uuid,
        config: device.clone(),
        target_folder,
        output_folder: None,
        should_stabilize_after_merge: false,
    };
    state.submit(JobKind::Merge, &device, encode(&payload)?, "Merge")
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StabilizeRequest {
    pub folder: Option<String>,
    pub delete_after_merge: bool,
    pub delete_after_stabilize: bool,
    /// Stabilize raw fragments and re-merge, instead of merging first
    pub fragments: bool,
}

async fn stabilize_folder(
    State(state): State<ApiState>,
    Path(uuid): Path<String>,
    Json(req): Json<StabilizeRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut device = state.device(&uuid)?;
    let target_folder = state.device_folder(&device, req.folder.as_deref())?;
    device.delete_after_merge = req.delete_after_merge;
    device.delete_after_stabilize = req.delete_after_stabilize;

    if req.fragments {
        let payload = StabilizePayload {
            uuid,
            config: device.clone(),
            target_folder,
            mode: StabilizeMode::Fragments,
            inputs: Vec::new(),
        };
        return state.submit(JobKind::Stabilize, &device, encode(&payload)?, "Stabilize");
    }

    let payload = MergePayload {
        uuid,
        config: device.clone(),
        target_folder,
        output_folder: None,
        should_stabilize_after_merge: true,
    };
    state.submit(JobKind::Merge, &device, encode(&payload)?, "Merge then stabilize")
}

fn encode<T: Serialize>(payload: &T) -> Result<Value, ApiError> {
    serde_json::to_value(payload)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let job = state
        .scheduler
        .queue()
        .get(&id)
        .ok_or_else(|| ApiError::from(QueueError::NotFound(id)))?;
    Ok(Json(encode(&job)?))
}

async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.scheduler.queue().cancel(&id)?;
    let message = match outcome {
        CancelOutcome::Removed => "Job removed from queue",
        CancelOutcome::MarkedFailed => "Active job marked as failed",
    };
    warn!(job_id = %id, "{message}");
    state.log(LogLevel::Warning, format!("{message} (Job ID: {id})"));
    Ok(Json(json!({ "success": true, "message": message })))
}

#[derive(Debug, Default, Deserialize)]
pub struct QueueQuery {
    pub state: Option<JobState>,
}

async fn queue_status(
    State(state): State<ApiState>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<Value>, ApiError> {
    let queue = state.scheduler.queue();
    Ok(Json(json!({
        "counts": queue.counts(),
        "jobs": encode(&queue.list(query.state))?,
    })))
}

async fn capabilities(State(state): State<ApiState>) -> Json<Capabilities> {
    Json(state.capabilities)
}

async fn recent_logs(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({ "logs": state.publisher.recent_logs() }))
}

async fn events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = BroadcastStream::new(state.publisher.subscribe()).filter_map(|item| {
        // Lagged subscribers skip what they missed
        let event = item.ok()?;
        SseEvent::default()
            .event(event.event_type())
            .json_data(&event)
            .ok()
            .map(Ok)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
