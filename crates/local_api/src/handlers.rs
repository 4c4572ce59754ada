//! Route handlers. Read-mostly: status endpoints copy a snapshot out of the
//! owning component and serialize it; trigger endpoints run one cycle and
//! answer 409 when one is already in flight.

use axum::{
    extract::{
        Query,
        State,
    },
    response::{
        IntoResponse,
        Response,
    },
    Json,
};
use collector::CollectError;
use common::types::UnixMillis;
use downstream_sync::SyncError;
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use uploader::UploadTriggerError;

use crate::AgentState;

const READINGS_LIMIT: usize = 1_000;
const DEFAULT_READINGS_HOURS: u32 = 24;
const SYNC_LOG_LIMIT: usize = 100;
const DEFAULT_SYNC_LOG_LIMIT: usize = 50;

/// Internal failures map to a JSON 500; everything interesting is in the
/// status endpoints and sync_log, not in the HTTP error body.
pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!("Request failed: {:#}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{:#}", self.0) })),
        )
            .into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": UnixMillis::now().as_rfc3339(),
    }))
}

pub async fn get_tenant(State(st): State<AgentState>) -> Response {
    match st.cache.tenant() {
        Some(tenant) => Json(tenant).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "initializing" })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct TenantSyncRequest {
    pub tenant_id: i64,
}

pub async fn trigger_tenant_sync(
    State(st): State<AgentState>,
    Json(request): Json<TenantSyncRequest>,
) -> Result<Response, ApiError> {
    if request.tenant_id != st.tenant_id {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!(
                    "this agent serves tenant {}, not {}",
                    st.tenant_id, request.tenant_id
                ),
            })),
        )
            .into_response());
    }
    match st.meter_sync.run_sync().await {
        Err(SyncError::AlreadyRunning) => Ok(already_running("meter sync")),
        Ok(result) if result.success => {
            let tenant_data = st.store.get_tenant().await?;
            Ok(Json(json!({
                "success": true,
                "sync_result": result,
                "tenant_data": tenant_data,
            }))
            .into_response())
        },
        Ok(result) => Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": result.error })),
        )
            .into_response()),
    }
}

pub async fn list_meters(State(st): State<AgentState>) -> Result<Response, ApiError> {
    let meters = st.store.list_meters(true).await?;
    Ok(Json(meters).into_response())
}

#[derive(Deserialize)]
pub struct ReadingsQuery {
    pub hours: Option<u32>,
}

pub async fn recent_readings(
    State(st): State<AgentState>,
    Query(query): Query<ReadingsQuery>,
) -> Result<Response, ApiError> {
    let hours = query.hours.unwrap_or(DEFAULT_READINGS_HOURS);
    let readings = st.store.recent_readings(hours, READINGS_LIMIT).await?;
    Ok(Json(readings).into_response())
}

pub async fn sync_status(State(st): State<AgentState>) -> Result<Response, ApiError> {
    let queue_size = st.store.count_unsynchronized().await?;
    let sync_errors: Vec<_> = st
        .store
        .recent_sync_logs(SYNC_LOG_LIMIT)
        .await?
        .into_iter()
        .filter(|log| !log.success)
        .collect();
    let upload_status = st.uploader.status();
    Ok(Json(json!({
        "is_connected": st.connectivity.is_connected(),
        "last_sync_at": upload_status.last_run_at,
        "queue_size": queue_size,
        "sync_errors": sync_errors,
    }))
    .into_response())
}

/// Manual upload trigger behind the connectivity gate: offline answers 503
/// without touching the queue.
pub async fn trigger_upload_gated(State(st): State<AgentState>) -> Result<Response, ApiError> {
    if !st.connectivity.is_connected() {
        return Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "client system is offline" })),
        )
            .into_response());
    }
    trigger_upload(State(st)).await
}

pub async fn trigger_upload(State(st): State<AgentState>) -> Result<Response, ApiError> {
    match st.uploader.run_cycle().await {
        Err(UploadTriggerError::AlreadyRunning) => Ok(already_running("upload")),
        Ok(result) => Ok(Json(result).into_response()),
    }
}

pub async fn meter_sync_status(State(st): State<AgentState>) -> Response {
    Json(st.meter_sync.status()).into_response()
}

pub async fn trigger_meter_sync(State(st): State<AgentState>) -> Result<Response, ApiError> {
    match st.meter_sync.run_sync().await {
        Err(SyncError::AlreadyRunning) => Ok(already_running("meter sync")),
        Ok(result) => Ok(Json(result).into_response()),
    }
}

pub async fn collector_status(State(st): State<AgentState>) -> Response {
    Json(st.collector.status()).into_response()
}

pub async fn trigger_collection(State(st): State<AgentState>) -> Result<Response, ApiError> {
    match st.collector.run_cycle().await {
        Err(CollectError::AlreadyRunning) => Ok(already_running("collection")),
        Ok(result) => Ok(Json(result).into_response()),
    }
}

pub async fn upload_status(State(st): State<AgentState>) -> Response {
    Json(st.uploader.status()).into_response()
}

#[derive(Deserialize)]
pub struct UploadLogQuery {
    pub limit: Option<usize>,
}

pub async fn upload_log(
    State(st): State<AgentState>,
    Query(query): Query<UploadLogQuery>,
) -> Result<Response, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_SYNC_LOG_LIMIT).min(SYNC_LOG_LIMIT);
    let logs = st.store.recent_sync_logs(limit).await?;
    Ok(Json(logs).into_response())
}

fn already_running(what: &str) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({ "error": format!("{what} already running") })),
    )
        .into_response()
}
