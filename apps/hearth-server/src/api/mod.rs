//! Thin controllers over the exposed operations. Handlers validate,
//! delegate to the owning component, and map `OpsError` onto status
//! codes; no business logic lives here.

pub mod events;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::app_state::AppState;
use crate::downloads;
use crate::errors::OpsError;
use crate::jobs::benchmark;
use crate::jobs::download::FILE_RESOURCE_TYPES;
use crate::jobs::update_check::UPDATE_STATUS_KEY;
use crate::queue::{
    EnqueueOptions, KIND_FILE_DOWNLOAD, KIND_MODEL_DOWNLOAD, KIND_UPDATE_CHECK,
    QUEUE_BENCH, QUEUE_FILE_DOWNLOADS, QUEUE_MAINTENANCE, QUEUE_MODEL_DOWNLOADS,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/services", get(services_list))
        .route("/services/{name}/install", post(service_install))
        .route("/downloads", get(downloads_list).post(download_enqueue))
        .route("/models/download", post(model_download_enqueue))
        .route("/jobs/{queue}", get(jobs_list))
        .route("/bench", post(bench_dispatch))
        .route("/bench/{id}", get(bench_job_state))
        .route("/updates/check", post(updates_check))
        .route("/updates", get(updates_status))
        .route("/resources", get(resources_list))
        .route("/resources/{id}", delete(resource_delete))
        .route("/events", get(events::events_sse))
        .route("/events/recent", get(events::events_recent))
        .with_state(state)
}

impl IntoResponse for OpsError {
    fn into_response(self) -> Response {
        let status = match &self {
            OpsError::Validation(_) => StatusCode::BAD_REQUEST,
            OpsError::NotFound(_) => StatusCode::NOT_FOUND,
            OpsError::AlreadyInProgress(_) => StatusCode::CONFLICT,
            OpsError::Preflight(_) | OpsError::Runtime(_) | OpsError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({"success": false, "message": self.to_string()}))).into_response()
    }
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"ok": true}))
}

#[utoipa::path(get, path = "/services", responses((status = 200, description = "Visible services with install state")))]
async fn services_list(State(state): State<AppState>) -> Result<impl IntoResponse, OpsError> {
    let services = state.kernel().list_services_async(false).await?;
    Ok(Json(services))
}

#[utoipa::path(post, path = "/services/{name}/install", responses(
    (status = 200, description = "Install completed"),
    (status = 409, description = "Install already in progress"),
))]
async fn service_install(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, OpsError> {
    let report = state.orchestrator().install_service(&name).await?;
    Ok(Json(json!({"success": true, "message": report.message})))
}

#[derive(Deserialize)]
struct DownloadsQuery {
    filetype: Option<String>,
}

#[utoipa::path(get, path = "/downloads", responses((status = 200, description = "Live download jobs, active first")))]
async fn downloads_list(
    State(state): State<AppState>,
    Query(q): Query<DownloadsQuery>,
) -> Result<impl IntoResponse, OpsError> {
    let views = downloads::list_download_jobs(&state.work_queue(), q.filetype.as_deref()).await?;
    Ok(Json(views))
}

#[derive(Deserialize, ToSchema)]
struct FileDownloadRequest {
    url: String,
    #[serde(default)]
    file_name: Option<String>,
    resource_type: String,
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

#[utoipa::path(post, path = "/downloads", responses((status = 200, description = "Download queued, or existing job referenced")))]
async fn download_enqueue(
    State(state): State<AppState>,
    Json(req): Json<FileDownloadRequest>,
) -> Result<impl IntoResponse, OpsError> {
    if !FILE_RESOURCE_TYPES.contains(&req.resource_type.as_str()) {
        return Err(OpsError::Validation(format!(
            "resource_type must be one of {FILE_RESOURCE_TYPES:?}"
        )));
    }
    if !req.url.starts_with("http://") && !req.url.starts_with("https://") {
        return Err(OpsError::Validation(format!("unsupported url {}", req.url)));
    }
    let payload = json!({
        "url": req.url,
        "file_name": req.file_name,
        "resource_type": req.resource_type,
        "collection": req.collection,
        "version": req.version,
    });
    let config = state.config();
    let outcome = state
        .work_queue()
        .enqueue(
            QUEUE_FILE_DOWNLOADS,
            KIND_FILE_DOWNLOAD,
            &payload,
            EnqueueOptions::retrying(config.download_max_attempts, config.download_backoff_ms)
                .with_dedup(&req.url),
        )
        .await?;
    Ok(Json(json!({
        "job_id": outcome.job.id,
        "created": outcome.created,
        "message": outcome.message,
    })))
}

#[derive(Deserialize, ToSchema)]
struct ModelDownloadRequest {
    model: String,
    #[serde(default)]
    version: Option<String>,
}

#[utoipa::path(post, path = "/models/download", responses((status = 200, description = "Model pull queued, or existing job referenced")))]
async fn model_download_enqueue(
    State(state): State<AppState>,
    Json(req): Json<ModelDownloadRequest>,
) -> Result<impl IntoResponse, OpsError> {
    if req.model.trim().is_empty() {
        return Err(OpsError::Validation("model name is empty".into()));
    }
    let config = state.config();
    let outcome = state
        .work_queue()
        .enqueue(
            QUEUE_MODEL_DOWNLOADS,
            KIND_MODEL_DOWNLOAD,
            &json!({"model": req.model, "version": req.version}),
            EnqueueOptions::retrying(config.download_max_attempts, config.download_backoff_ms)
                .with_dedup(&req.model),
        )
        .await?;
    Ok(Json(json!({
        "job_id": outcome.job.id,
        "created": outcome.created,
        "message": outcome.message,
    })))
}

#[derive(Deserialize)]
struct JobsQuery {
    /// Comma-separated job states; defaults to the live states.
    state: Option<String>,
}

#[utoipa::path(get, path = "/jobs/{queue}", responses(
    (status = 200, description = "Jobs on one queue, insertion order"),
    (status = 404, description = "No such queue"),
))]
async fn jobs_list(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(q): Query<JobsQuery>,
) -> Result<impl IntoResponse, OpsError> {
    if !crate::queue::ALL_QUEUES.contains(&queue.as_str()) {
        return Err(OpsError::NotFound(format!("queue {queue}")));
    }
    let jobs = match q.state.as_deref() {
        Some(states) => {
            let states: Vec<&str> = states
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            state.work_queue().list_jobs(&queue, &states).await?
        }
        None => state.work_queue().list_live_jobs(&queue).await?,
    };
    Ok(Json(jobs))
}

#[derive(Deserialize, ToSchema)]
struct BenchRequest {
    bench_kind: String,
    #[serde(default)]
    bench_id: Option<String>,
}

#[utoipa::path(post, path = "/bench", responses((status = 200, description = "Benchmark dispatched, or existing run referenced")))]
async fn bench_dispatch(
    State(state): State<AppState>,
    Json(req): Json<BenchRequest>,
) -> Result<impl IntoResponse, OpsError> {
    let bench_id = req
        .bench_id
        .unwrap_or_else(|| format!("bench-{}", uuid::Uuid::new_v4()));
    let outcome = benchmark::dispatch(&state.work_queue(), &req.bench_kind, &bench_id).await?;
    Ok(Json(json!({
        "job": outcome.job,
        "created": outcome.created,
        "message": outcome.message,
    })))
}

#[utoipa::path(get, path = "/bench/{id}", responses(
    (status = 200, description = "Benchmark job state"),
    (status = 404, description = "No such benchmark job"),
))]
async fn bench_job_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OpsError> {
    let job = state
        .work_queue()
        .get_job(&id)
        .await?
        .filter(|job| job.queue == QUEUE_BENCH)
        .ok_or_else(|| OpsError::NotFound(format!("benchmark job {id}")))?;
    Ok(Json(job))
}

#[utoipa::path(post, path = "/updates/check", responses((status = 200, description = "Update check queued, or existing job referenced")))]
async fn updates_check(State(state): State<AppState>) -> Result<impl IntoResponse, OpsError> {
    let outcome = state
        .work_queue()
        .enqueue(
            QUEUE_MAINTENANCE,
            KIND_UPDATE_CHECK,
            &json!({}),
            EnqueueOptions::retrying(3, 30_000).with_dedup("update-check"),
        )
        .await?;
    Ok(Json(json!({
        "job_id": outcome.job.id,
        "created": outcome.created,
        "message": outcome.message,
    })))
}

#[utoipa::path(get, path = "/updates", responses((status = 200, description = "Last update-check verdict")))]
async fn updates_status(State(state): State<AppState>) -> Result<impl IntoResponse, OpsError> {
    let verdict = state
        .kernel()
        .get_value_async(UPDATE_STATUS_KEY)
        .await?
        .unwrap_or_else(|| json!({"available": false, "checked_at": null}));
    Ok(Json(verdict))
}

#[derive(Deserialize)]
struct ResourcesQuery {
    #[serde(rename = "type")]
    resource_type: Option<String>,
}

#[utoipa::path(get, path = "/resources", responses((status = 200, description = "Installed resources")))]
async fn resources_list(
    State(state): State<AppState>,
    Query(q): Query<ResourcesQuery>,
) -> Result<impl IntoResponse, OpsError> {
    let resources = state
        .kernel()
        .list_resources_async(q.resource_type.as_deref())
        .await?;
    Ok(Json(resources))
}

#[utoipa::path(delete, path = "/resources/{id}", responses(
    (status = 200, description = "Resource deleted"),
    (status = 404, description = "No such resource"),
))]
async fn resource_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, OpsError> {
    let kernel = state.kernel();
    let resource = kernel
        .get_resource_async(&id)
        .await?
        .ok_or_else(|| OpsError::NotFound(format!("resource {id}")))?;
    if !kernel.delete_resource_async(&id).await? {
        return Err(OpsError::NotFound(format!("resource {id}")));
    }
    // The row is authoritative; a missing file on disk is not an error.
    let _ = tokio::fs::remove_file(&resource.file_path).await;
    state.bus().publish(
        hearth_topics::TOPIC_RESOURCES_CHANGED,
        &json!({"id": id, "resource_type": resource.resource_type, "op": "deleted"}),
    );
    Ok(Json(json!({"success": true, "message": format!("resource {id} deleted")})))
}
