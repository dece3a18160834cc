use super::ListParams;
use crate::{auth::AuthenticatedUser, error::ApiResult, error::ErrorBody, state::AppState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use tracing::info;
use vm_orchestrator::{Deployment, DeploymentDetail, Page, Run, SubmitDeployment};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/deployments",
            get(list_deployments).post(submit_deployment),
        )
        .route("/api/v1/deployments/{id}", get(get_deployment))
        .route("/api/v1/deployments/{id}/approve", post(approve_deployment))
        .route("/api/v1/deployments/{id}/reject", post(reject_deployment))
        .route("/api/v1/deployments/{id}/retry", post(retry_deployment))
        .route("/api/v1/deployments/{id}/runs", get(deployment_runs))
}

/// Submit a deployment of 1 to 20 VMs. The requestor is the caller.
#[utoipa::path(
    post,
    path = "/api/v1/deployments",
    tag = "deployments",
    request_body = SubmitDeployment,
    responses(
        (status = 201, description = "Deployment and children created", body = DeploymentDetail),
        (status = 400, description = "Validation failed", body = ErrorBody),
        (status = 401, description = "No identity")
    )
)]
pub async fn submit_deployment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(mut body): Json<SubmitDeployment>,
) -> ApiResult<(StatusCode, Json<DeploymentDetail>)> {
    body.requestor = user.username;
    let detail = state.service.submit_deployment(body).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

#[utoipa::path(
    get,
    path = "/api/v1/deployments",
    tag = "deployments",
    params(ListParams),
    responses(
        (status = 200, description = "Newest first", body = Page<Deployment>),
        (status = 400, description = "Unknown status", body = ErrorBody)
    )
)]
pub async fn list_deployments(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Page<Deployment>>> {
    let page = state
        .service
        .list_deployments(params.status()?, params.page(), params.size())
        .await?;
    Ok(Json(page))
}

/// A deployment with its VMs in submission order.
#[utoipa::path(
    get,
    path = "/api/v1/deployments/{id}",
    tag = "deployments",
    params(("id" = String, Path, description = "Deployment id")),
    responses(
        (status = 200, description = "The deployment", body = DeploymentDetail),
        (status = 404, description = "Unknown deployment", body = ErrorBody)
    )
)]
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeploymentDetail>> {
    Ok(Json(state.service.get_deployment(&id).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/deployments/{id}/approve",
    tag = "deployments",
    params(("id" = String, Path, description = "Deployment id")),
    responses(
        (status = 202, description = "Approved, provisioning scheduled", body = DeploymentDetail),
        (status = 404, description = "Unknown deployment", body = ErrorBody),
        (status = 409, description = "Not pending or already running", body = ErrorBody)
    )
)]
pub async fn approve_deployment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<DeploymentDetail>)> {
    let detail = state.service.approve_deployment(&id).await?;
    info!(deployment_id = %id, approver = %user.username, "Approval recorded");
    Ok((StatusCode::ACCEPTED, Json(detail)))
}

#[utoipa::path(
    post,
    path = "/api/v1/deployments/{id}/reject",
    tag = "deployments",
    params(("id" = String, Path, description = "Deployment id")),
    responses(
        (status = 200, description = "Rejected with all children", body = DeploymentDetail),
        (status = 404, description = "Unknown deployment", body = ErrorBody),
        (status = 409, description = "Not pending or already running", body = ErrorBody)
    )
)]
pub async fn reject_deployment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeploymentDetail>> {
    let detail = state.service.reject_deployment(&id).await?;
    info!(deployment_id = %id, approver = %user.username, "Rejection recorded");
    Ok(Json(detail))
}

/// Re-run only the failed VMs of a partially completed or failed deployment.
#[utoipa::path(
    post,
    path = "/api/v1/deployments/{id}/retry",
    tag = "deployments",
    params(("id" = String, Path, description = "Deployment id")),
    responses(
        (status = 202, description = "Retry scheduled", body = DeploymentDetail),
        (status = 404, description = "Unknown deployment", body = ErrorBody),
        (status = 409, description = "Nothing failed or already running", body = ErrorBody)
    )
)]
pub async fn retry_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<DeploymentDetail>)> {
    let detail = state.service.retry_deployment(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(detail)))
}

#[utoipa::path(
    get,
    path = "/api/v1/deployments/{id}/runs",
    tag = "deployments",
    params(("id" = String, Path, description = "Deployment id")),
    responses(
        (status = 200, description = "Runs oldest first", body = Vec<Run>),
        (status = 404, description = "Unknown deployment", body = ErrorBody)
    )
)]
pub async fn deployment_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Run>>> {
    Ok(Json(state.service.deployment_runs(&id).await?))
}
