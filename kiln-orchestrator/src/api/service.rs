//! Service API Handlers
//!
//! HTTP endpoints for the service lifecycle.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use kiln_core::domain::service::{Service, ServiceStatus};
use kiln_core::dto::service::{CreateService, JobView, ServiceFilter, StopService};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;

/// Defaults for `GET /api/services/{id}/wait`, in seconds
const DEFAULT_WAIT_TIMEOUT: u64 = 600;
const DEFAULT_WAIT_INTERVAL: u64 = 5;

// =============================================================================
// Service Lifecycle Endpoints
// =============================================================================

/// POST /api/services
/// Create a service and submit its job
pub async fn start_service(
    State(state): State<AppState>,
    Json(req): Json<CreateService>,
) -> ApiResult<(StatusCode, Json<Service>)> {
    tracing::info!(
        "Starting service {} ({}) on profile {}",
        req.name,
        req.model,
        req.profile
    );

    let service = state.services.start(req).await?;
    Ok((StatusCode::CREATED, Json(service)))
}

/// GET /api/services/{id}
/// Refresh and return a service
pub async fn get_service(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Service>> {
    tracing::debug!("Getting service: {}", id);

    let service = state.services.get(id).await?;
    Ok(Json(service))
}

/// GET /api/services
/// List services matching the query filter, refreshing each
///
/// Query parameters (all optional): `image`, `model`, `status`, `name`,
/// `profile`
pub async fn list_services(
    State(state): State<AppState>,
    Query(filter): Query<ServiceFilter>,
) -> ApiResult<Json<Vec<Service>>> {
    tracing::debug!("Listing services: {:?}", filter);

    let services = state.services.list(&filter).await?;
    Ok(Json(services))
}

/// GET /api/services/{id}/job
/// Job details of a service
pub async fn get_service_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobView>> {
    tracing::debug!("Getting job for service: {}", id);

    let job = state.services.get_job(id).await?;
    Ok(Json(job))
}

/// POST /api/services/{id}/stop
/// Stop a service
pub async fn stop_service(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StopService>,
) -> ApiResult<Json<Service>> {
    tracing::info!("Stopping service: {} ({:?})", id, req);

    let service = state.services.stop(id, req).await?;
    Ok(Json(service))
}

/// DELETE /api/services/{id}
/// Delete a stopped, timed out or failed service
pub async fn delete_service(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting service: {}", id);

    state.services.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Waiting
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    /// Seconds to wait before giving up
    pub timeout: Option<u64>,
    /// Seconds between refreshes
    pub interval: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WaitResponse {
    pub id: Uuid,
    pub status: ServiceStatus,
}

/// GET /api/services/{id}/wait
/// Block until the service is healthy or terminal, or the timeout elapses
pub async fn wait_service(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<WaitQuery>,
) -> ApiResult<Json<WaitResponse>> {
    let timeout = Duration::from_secs(params.timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT));
    let interval = Duration::from_secs(params.interval.unwrap_or(DEFAULT_WAIT_INTERVAL).max(1));

    tracing::debug!("Waiting for service {} (timeout: {:?})", id, timeout);

    let status = state.services.wait(id, timeout, interval).await?;
    Ok(Json(WaitResponse { id, status }))
}
