use crate::error::ErrorBody;
use utoipa::OpenApi;
use vm_orchestrator::{
    Deployment, DeploymentDetail, DeploymentStatus, FailureKind, RequestStatus, Run, RunStatus,
    RunSubject, RunTrigger, SizeChoice, SubmitDeployment, SubmitDeploymentVm, SubmitVmRequest,
    VmRequest,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::health_check,
        crate::routes::health::readiness_check,
        crate::routes::requests::submit_request,
        crate::routes::requests::list_requests,
        crate::routes::requests::get_request,
        crate::routes::requests::approve_request,
        crate::routes::requests::reject_request,
        crate::routes::requests::retry_request,
        crate::routes::requests::request_runs,
        crate::routes::deployments::submit_deployment,
        crate::routes::deployments::list_deployments,
        crate::routes::deployments::get_deployment,
        crate::routes::deployments::approve_deployment,
        crate::routes::deployments::reject_deployment,
        crate::routes::deployments::retry_deployment,
        crate::routes::deployments::deployment_runs,
    ),
    components(
        schemas(
            VmRequest,
            RequestStatus,
            FailureKind,
            Deployment,
            DeploymentDetail,
            DeploymentStatus,
            Run,
            RunStatus,
            RunSubject,
            RunTrigger,
            SubmitVmRequest,
            SubmitDeployment,
            SubmitDeploymentVm,
            SizeChoice,
            ErrorBody
        )
    ),
    tags(
        (name = "requests", description = "Standalone VM requests"),
        (name = "deployments", description = "Multi-VM deployments"),
        (name = "health", description = "Probes")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_lists_every_route() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&str> = doc.paths.paths.keys().map(String::as_str).collect();

        for expected in [
            "/health",
            "/health/ready",
            "/api/v1/requests",
            "/api/v1/requests/{id}/retry",
            "/api/v1/deployments/{id}",
            "/api/v1/deployments/{id}/runs",
        ] {
            assert!(paths.contains(&expected), "missing {expected}");
        }
    }
}
