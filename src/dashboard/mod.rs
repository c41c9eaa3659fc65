use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::error::SchedulerError;
use crate::registry::{
    lifecycle, Device, DeviceHealth, Job, JobId, JobState, Registry, RequestedTarget, WorkerState,
};
use crate::render::SubmissionValidator;
use crate::scheduler::{cancel_job, submit_job};

pub struct DashboardState<R> {
    pub registry: Arc<R>,
    pub validator: Arc<dyn SubmissionValidator>,
    pub default_queue_timeout: Option<Duration>,
}

impl<R> Clone for DashboardState<R> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            validator: self.validator.clone(),
            default_queue_timeout: self.default_queue_timeout,
        }
    }
}

#[derive(Serialize)]
struct WorkerResponse {
    hostname: String,
    state: String,
    job_limit: u32,
    busy_devices: usize,
    last_ping: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct DeviceResponse {
    hostname: String,
    device_type: String,
    worker: String,
    state: String,
    health: String,
    current_job: Option<JobId>,
    tags: Vec<String>,
}

impl From<&Device> for DeviceResponse {
    fn from(device: &Device) -> Self {
        Self {
            hostname: device.hostname.clone(),
            device_type: device.device_type.clone(),
            worker: device.worker.clone(),
            state: device.state().to_string(),
            health: device.health().to_string(),
            current_job: device.current_job(),
            tags: device.tags.iter().cloned().collect(),
        }
    }
}

#[derive(Serialize)]
struct JobResponse {
    id: JobId,
    description: String,
    submitter: String,
    state: String,
    health: String,
    requested: String,
    actual_device: Option<String>,
    priority: u8,
    health_check: bool,
    target_group: Option<String>,
    role: Option<String>,
    failure_comment: Option<String>,
    submit_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        let requested = match &job.requested {
            RequestedTarget::Device(hostname) => hostname.clone(),
            RequestedTarget::DeviceType(name) => name.clone(),
            RequestedTarget::Connection => "connection".to_string(),
        };
        Self {
            id: job.id,
            description: job.description.clone(),
            submitter: job.submitter.clone(),
            state: job.state().to_string(),
            health: job.health().to_string(),
            requested,
            actual_device: job.actual_device.clone(),
            priority: job.priority.value(),
            health_check: job.health_check,
            target_group: job.target_group.clone(),
            role: job.role.clone(),
            failure_comment: job.failure_comment.clone(),
            submit_time: job.submit_time,
            start_time: job.start_time,
            end_time: job.end_time,
        }
    }
}

#[derive(Deserialize)]
struct SubmitJobRequest {
    definition: String,
    #[serde(default = "default_submitter")]
    submitter: String,
}

fn default_submitter() -> String {
    "dashboard".to_string()
}

#[derive(Serialize)]
struct SubmitJobResponse {
    success: bool,
    job_ids: Vec<JobId>,
    error: Option<String>,
}

#[derive(Serialize)]
struct CancelJobResponse {
    canceled: Vec<JobId>,
}

#[derive(Deserialize)]
struct DeviceHealthRequest {
    health: DeviceHealth,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(e: SchedulerError) -> Response {
    let status = match &e {
        SchedulerError::Submission(_) => StatusCode::BAD_REQUEST,
        SchedulerError::JobNotFound(_)
        | SchedulerError::DeviceNotFound(_)
        | SchedulerError::DeviceTypeNotFound(_)
        | SchedulerError::WorkerNotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::Conflict(_) | SchedulerError::IllegalTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse { error: e.to_string() })).into_response()
}

/// JSON API over the registry: listings plus submit, cancel and device
/// health administration.
pub fn router<R: Registry>(state: DashboardState<R>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/workers", get(list_workers_handler::<R>))
        .route("/api/devices", get(list_devices_handler::<R>))
        .route("/api/devices/:hostname/health", post(device_health_handler::<R>))
        .route("/api/devices/:hostname/offline", post(device_offline_handler::<R>))
        .route("/api/devices/:hostname/online", post(device_online_handler::<R>))
        .route("/api/jobs", get(list_jobs_handler::<R>).post(submit_job_handler::<R>))
        .route("/api/jobs/:id", get(job_handler::<R>))
        .route("/api/jobs/:id/cancel", post(cancel_job_handler::<R>))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard<R: Registry>(addr: SocketAddr, state: DashboardState<R>) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn list_workers_handler<R: Registry>(State(state): State<DashboardState<R>>) -> Response {
    let workers = state.registry.read(|tx| {
        tx.workers()
            .into_iter()
            .map(|worker| WorkerResponse {
                hostname: worker.hostname.clone(),
                state: match worker.state {
                    WorkerState::Online => "online".to_string(),
                    WorkerState::Offline => "offline".to_string(),
                },
                job_limit: worker.job_limit,
                busy_devices: tx.busy_devices_on_worker(&worker.hostname),
                last_ping: worker.last_ping,
            })
            .collect::<Vec<_>>()
    });
    match workers {
        Ok(workers) => Json(workers).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_devices_handler<R: Registry>(State(state): State<DashboardState<R>>) -> Response {
    let devices = state
        .registry
        .read(|tx| tx.devices().into_iter().map(DeviceResponse::from).collect::<Vec<_>>());
    match devices {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_jobs_handler<R: Registry>(State(state): State<DashboardState<R>>) -> Response {
    let jobs = state.registry.read(|tx| {
        [
            JobState::Submitted,
            JobState::Scheduling,
            JobState::Scheduled,
            JobState::Running,
            JobState::Canceling,
            JobState::Finished,
        ]
        .into_iter()
        .flat_map(|s| tx.jobs_in_state(s))
        .map(JobResponse::from)
        .collect::<Vec<_>>()
    });
    match jobs {
        Ok(mut jobs) => {
            jobs.sort_by_key(|j| j.id);
            Json(jobs).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn job_handler<R: Registry>(State(state): State<DashboardState<R>>, Path(id): Path<JobId>) -> Response {
    match state.registry.job(id) {
        Ok(job) => Json(JobResponse::from(&job)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn submit_job_handler<R: Registry>(
    State(state): State<DashboardState<R>>,
    Json(payload): Json<SubmitJobRequest>,
) -> Response {
    match submit_job(
        state.registry.as_ref(),
        state.validator.as_ref(),
        &payload.definition,
        &payload.submitter,
        state.default_queue_timeout,
    ) {
        Ok(job_ids) => {
            tracing::info!(?job_ids, submitter = %payload.submitter, "Job submitted");
            (
                StatusCode::OK,
                Json(SubmitJobResponse {
                    success: true,
                    job_ids,
                    error: None,
                }),
            )
                .into_response()
        }
        Err(e @ SchedulerError::Submission(_)) => (
            StatusCode::BAD_REQUEST,
            Json(SubmitJobResponse {
                success: false,
                job_ids: Vec::new(),
                error: Some(e.to_string()),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn cancel_job_handler<R: Registry>(State(state): State<DashboardState<R>>, Path(id): Path<JobId>) -> Response {
    match cancel_job(state.registry.as_ref(), id) {
        Ok(canceled) => {
            tracing::info!(job_id = id, ?canceled, "Job cancel requested");
            Json(CancelJobResponse { canceled }).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn device_health_handler<R: Registry>(
    State(state): State<DashboardState<R>>,
    Path(hostname): Path<String>,
    Json(payload): Json<DeviceHealthRequest>,
) -> Response {
    if !matches!(
        payload.health,
        DeviceHealth::Good | DeviceHealth::Unknown | DeviceHealth::Maintenance | DeviceHealth::Retired
    ) {
        return error_response(SchedulerError::Conflict(format!(
            "health {} cannot be set by an administrator",
            payload.health
        )));
    }
    let result = state.registry.transaction(|tx| {
        lifecycle::set_device_health(tx, &hostname, payload.health)?;
        Ok(tx.device(&hostname)?.clone())
    });
    match result {
        Ok(device) => Json(DeviceResponse::from(&device)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn device_offline_handler<R: Registry>(
    State(state): State<DashboardState<R>>,
    Path(hostname): Path<String>,
) -> Response {
    let result = state.registry.transaction(|tx| {
        let device = tx.device_mut(&hostname)?;
        device.go_offline()?;
        Ok(device.clone())
    });
    match result {
        Ok(device) => {
            tracing::info!(device = %hostname, state = %device.state(), "Device taken offline");
            Json(DeviceResponse::from(&device)).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn device_online_handler<R: Registry>(
    State(state): State<DashboardState<R>>,
    Path(hostname): Path<String>,
) -> Response {
    let result = state.registry.transaction(|tx| {
        let device = tx.device_mut(&hostname)?;
        device.go_online()?;
        Ok(device.clone())
    });
    match result {
        Ok(device) => {
            tracing::info!(device = %hostname, "Device back online");
            Json(DeviceResponse::from(&device)).into_response()
        }
        Err(e) => error_response(e),
    }
}
