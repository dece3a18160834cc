use super::ListParams;
use crate::{auth::AuthenticatedUser, error::ApiResult, error::ErrorBody, state::AppState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use tracing::info;
use vm_orchestrator::{Page, Run, SubmitVmRequest, VmRequest};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/requests", get(list_requests).post(submit_request))
        .route("/api/v1/requests/{id}", get(get_request))
        .route("/api/v1/requests/{id}/approve", post(approve_request))
        .route("/api/v1/requests/{id}/reject", post(reject_request))
        .route("/api/v1/requests/{id}/retry", post(retry_request))
        .route("/api/v1/requests/{id}/runs", get(request_runs))
}

/// Submit a standalone VM request. The requestor is the caller.
#[utoipa::path(
    post,
    path = "/api/v1/requests",
    tag = "requests",
    request_body = SubmitVmRequest,
    responses(
        (status = 201, description = "Request created, pending approval", body = VmRequest),
        (status = 400, description = "Validation failed", body = ErrorBody),
        (status = 401, description = "No identity")
    )
)]
pub async fn submit_request(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(mut body): Json<SubmitVmRequest>,
) -> ApiResult<(StatusCode, Json<VmRequest>)> {
    body.requestor = user.username;
    let request = state.service.submit_request(body).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

#[utoipa::path(
    get,
    path = "/api/v1/requests",
    tag = "requests",
    params(ListParams),
    responses(
        (status = 200, description = "Newest first", body = Page<VmRequest>),
        (status = 400, description = "Unknown status", body = ErrorBody)
    )
)]
pub async fn list_requests(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Page<VmRequest>>> {
    let page = state
        .service
        .list_requests(params.status()?, params.page(), params.size())
        .await?;
    Ok(Json(page))
}

#[utoipa::path(
    get,
    path = "/api/v1/requests/{id}",
    tag = "requests",
    params(("id" = String, Path, description = "Request id")),
    responses(
        (status = 200, description = "The request", body = VmRequest),
        (status = 404, description = "Unknown request", body = ErrorBody)
    )
)]
pub async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<VmRequest>> {
    Ok(Json(state.service.get_request(&id).await?))
}

/// Approve a pending request and start provisioning in the background.
#[utoipa::path(
    post,
    path = "/api/v1/requests/{id}/approve",
    tag = "requests",
    params(("id" = String, Path, description = "Request id")),
    responses(
        (status = 202, description = "Approved, provisioning scheduled", body = VmRequest),
        (status = 404, description = "Unknown request", body = ErrorBody),
        (status = 409, description = "Not pending, part of a deployment, or already running", body = ErrorBody)
    )
)]
pub async fn approve_request(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<VmRequest>)> {
    let request = state.service.approve_request(&id).await?;
    info!(request_id = %id, approver = %user.username, "Approval recorded");
    Ok((StatusCode::ACCEPTED, Json(request)))
}

#[utoipa::path(
    post,
    path = "/api/v1/requests/{id}/reject",
    tag = "requests",
    params(("id" = String, Path, description = "Request id")),
    responses(
        (status = 200, description = "Rejected", body = VmRequest),
        (status = 404, description = "Unknown request", body = ErrorBody),
        (status = 409, description = "Transition not allowed or already running", body = ErrorBody)
    )
)]
pub async fn reject_request(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<VmRequest>> {
    let request = state.service.reject_request(&id).await?;
    info!(request_id = %id, approver = %user.username, "Rejection recorded");
    Ok(Json(request))
}

/// Retry a request whose provisioning failed.
#[utoipa::path(
    post,
    path = "/api/v1/requests/{id}/retry",
    tag = "requests",
    params(("id" = String, Path, description = "Request id")),
    responses(
        (status = 202, description = "Retry scheduled", body = VmRequest),
        (status = 404, description = "Unknown request", body = ErrorBody),
        (status = 409, description = "Transition not allowed or already running", body = ErrorBody)
    )
)]
pub async fn retry_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<VmRequest>)> {
    let request = state.service.retry_request(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(request)))
}

/// Every provisioning attempt of a request, oldest first.
#[utoipa::path(
    get,
    path = "/api/v1/requests/{id}/runs",
    tag = "requests",
    params(("id" = String, Path, description = "Request id")),
    responses(
        (status = 200, description = "Runs oldest first", body = Vec<Run>),
        (status = 404, description = "Unknown request", body = ErrorBody)
    )
)]
pub async fn request_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Run>>> {
    Ok(Json(state.service.request_runs(&id).await?))
}
