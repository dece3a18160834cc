//! Operations exposed to the API layer.
//!
//! Approve, reject and retry validate the transition synchronously and return
//! the updated record; provisioning itself runs in the background on the
//! scheduler. Callers poll the read models for progress.

use crate::catalog::Catalog;
use crate::coordinator::Coordinator;
use crate::deployment::{Deployment, DeploymentDetail, DeploymentStatus};
use crate::error::{OrchestratorError, Result};
use crate::pipeline::{Pipeline, ReadinessPolicy};
use crate::request::{RequestStatus, VmRequest};
use crate::run::{Run, RunSubject, RunTrigger};
use crate::runner::RequestRunner;
use crate::scheduler::{Claim, Scheduler, WorkKey, DEFAULT_WORKERS};
use crate::store::{DeploymentFilters, RequestFilters, Store};
use crate::submit::{SubmitDeployment, SubmitVmRequest, Validator};
use crate::ticket;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use utoipa::ToSchema;
use vm_gateway::{GatewayProvider, TicketDecision, TicketingGateway};

const RUN_INTERRUPTED: &str = "interrupted by a restart";

#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    /// Worker pool size for environments without `max_concurrent`.
    pub default_workers: usize,
    pub readiness: ReadinessPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_workers: DEFAULT_WORKERS,
            readiness: ReadinessPolicy::default(),
        }
    }
}

/// Work re-dispatched by [`ProvisioningService::reconcile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ReconcileReport {
    pub requests: usize,
    pub deployments: usize,
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub size: u32,
}

#[derive(Clone)]
pub struct ProvisioningService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    store: Store,
    catalog: Arc<Catalog>,
    gateways: Arc<dyn GatewayProvider>,
    scheduler: Scheduler,
    runner: Arc<RequestRunner>,
    coordinator: Arc<Coordinator>,
}

impl ProvisioningService {
    pub fn new(
        pool: SqlitePool,
        catalog: Catalog,
        gateways: Arc<dyn GatewayProvider>,
        config: ServiceConfig,
    ) -> Self {
        let store = Store::new(pool);
        let catalog = Arc::new(catalog);
        let scheduler = Scheduler::new(Arc::clone(&gateways), config.default_workers);
        let pipeline = Pipeline::new(
            store.clone(),
            Arc::clone(&gateways),
            Arc::clone(&catalog),
            config.readiness,
        );
        let runner = Arc::new(RequestRunner::new(store.clone(), pipeline));
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            Arc::clone(&gateways),
            scheduler.clone(),
            Arc::clone(&runner),
        ));

        Self {
            inner: Arc::new(ServiceInner {
                store,
                catalog,
                gateways,
                scheduler,
                runner,
                coordinator,
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    // ---------------------------------------------------------------
    // Submission
    // ---------------------------------------------------------------

    pub async fn submit_request(&self, submit: SubmitVmRequest) -> Result<VmRequest> {
        let new = Validator::new(&self.inner.catalog, self.inner.gateways.as_ref()).request(submit)?;
        let request = self.inner.store.insert_request(&new).await?;
        info!(request_id = %request.id, name = %request.name, requestor = %request.requestor, "VM request submitted");

        if let Some(ticketing) = self.ticketing() {
            match ticketing
                .create_or_update_ticket(&ticket::request_ticket(&request, None))
                .await
            {
                Ok(issued) => {
                    self.inner
                        .store
                        .set_request_ticket(&request.id, &issued.key, &issued.url)
                        .await?;
                    return self.inner.store.get_request(&request.id).await;
                }
                Err(e) => warn!(request_id = %request.id, error = %e, "Failed to open ticket"),
            }
        }
        Ok(request)
    }

    pub async fn submit_deployment(&self, submit: SubmitDeployment) -> Result<DeploymentDetail> {
        let new =
            Validator::new(&self.inner.catalog, self.inner.gateways.as_ref()).deployment(submit)?;
        let detail = self.inner.store.insert_deployment(&new).await?;
        let id = detail.deployment.id.clone();
        info!(deployment_id = %id, name = %detail.deployment.name, vms = detail.vms.len(), "Deployment submitted");

        if let Some(ticketing) = self.ticketing() {
            match ticketing
                .create_or_update_ticket(&ticket::deployment_ticket(&detail.deployment, &detail.vms))
                .await
            {
                Ok(issued) => {
                    self.inner
                        .store
                        .set_deployment_ticket(&id, &issued.key, &issued.url)
                        .await?;
                    return self.inner.store.get_deployment_detail(&id).await;
                }
                Err(e) => warn!(deployment_id = %id, error = %e, "Failed to open ticket"),
            }
        }
        Ok(detail)
    }

    // ---------------------------------------------------------------
    // Requests
    // ---------------------------------------------------------------

    pub async fn approve_request(&self, id: &str) -> Result<VmRequest> {
        self.standalone(id).await?;
        let claim = self.inner.scheduler.claim(WorkKey::Request(id.to_string()))?;
        self.inner.store.approve_request(id).await?;

        let request = self.inner.store.get_request(id).await?;
        info!(request_id = %id, "VM request approved");
        self.sync_decision(request.ticket_key.clone(), TicketDecision::Approved);
        self.dispatch_request(claim, &request, RunTrigger::Approval);
        Ok(request)
    }

    pub async fn reject_request(&self, id: &str) -> Result<VmRequest> {
        self.standalone(id).await?;
        let _claim = self.inner.scheduler.claim(WorkKey::Request(id.to_string()))?;
        self.inner.store.reject_request(id).await?;

        let request = self.inner.store.get_request(id).await?;
        info!(request_id = %id, "VM request rejected");
        self.sync_decision(request.ticket_key.clone(), TicketDecision::Rejected);
        Ok(request)
    }

    /// Re-run a failed standalone request under a new attempt.
    pub async fn retry_request(&self, id: &str) -> Result<VmRequest> {
        self.standalone(id).await?;
        let claim = self.inner.scheduler.claim(WorkKey::Request(id.to_string()))?;
        self.inner.store.restart_request(id).await?;

        let request = self.inner.store.get_request(id).await?;
        info!(request_id = %id, attempt = request.attempt, "VM request retry");
        self.dispatch_request(claim, &request, RunTrigger::Retry);
        Ok(request)
    }

    pub async fn get_request(&self, id: &str) -> Result<VmRequest> {
        self.inner.store.get_request(id).await
    }

    pub async fn list_requests(
        &self,
        status: Option<RequestStatus>,
        page: u32,
        size: u32,
    ) -> Result<Page<VmRequest>> {
        let (page, size) = page_bounds(page, size);
        let filters = RequestFilters {
            status,
            limit: Some(i64::from(size)),
            offset: (i64::from(page) - 1) * i64::from(size),
            ..Default::default()
        };
        Ok(Page {
            items: self.inner.store.list_requests(&filters).await?,
            total: self.inner.store.count_requests(&filters).await?,
            page,
            size,
        })
    }

    pub async fn request_runs(&self, id: &str) -> Result<Vec<Run>> {
        self.inner.store.get_request(id).await?;
        self.inner.store.list_runs(RunSubject::Request, id).await
    }

    // ---------------------------------------------------------------
    // Deployments
    // ---------------------------------------------------------------

    pub async fn approve_deployment(&self, id: &str) -> Result<DeploymentDetail> {
        let claim = self
            .inner
            .scheduler
            .claim(WorkKey::Deployment(id.to_string()))?;
        self.inner.store.approve_deployment(id).await?;

        let detail = self.inner.store.get_deployment_detail(id).await?;
        info!(deployment_id = %id, vms = detail.vms.len(), "Deployment approved");
        self.sync_decision(detail.deployment.ticket_key.clone(), TicketDecision::Approved);
        self.dispatch_deployment(claim, &detail.deployment, RunTrigger::Approval);
        Ok(detail)
    }

    pub async fn reject_deployment(&self, id: &str) -> Result<DeploymentDetail> {
        let _claim = self
            .inner
            .scheduler
            .claim(WorkKey::Deployment(id.to_string()))?;
        self.inner.store.reject_deployment(id).await?;

        let detail = self.inner.store.get_deployment_detail(id).await?;
        info!(deployment_id = %id, "Deployment rejected");
        self.sync_decision(detail.deployment.ticket_key.clone(), TicketDecision::Rejected);
        Ok(detail)
    }

    /// Re-run the failed children of a partially completed or failed
    /// deployment. Completed children are left as they are.
    pub async fn retry_deployment(&self, id: &str) -> Result<DeploymentDetail> {
        let claim = self
            .inner
            .scheduler
            .claim(WorkKey::Deployment(id.to_string()))?;
        self.inner.store.restart_deployment(id).await?;

        let detail = self.inner.store.get_deployment_detail(id).await?;
        let failed = detail
            .vms
            .iter()
            .filter(|vm| vm.status == RequestStatus::ProvisioningFailed)
            .count();
        info!(deployment_id = %id, failed, attempt = detail.deployment.attempt, "Deployment retry");

        if let (Some(ticketing), Some(key)) = (self.ticketing(), detail.deployment.ticket_key.clone()) {
            self.inner
                .scheduler
                .spawn_background(ticket::post_comment(ticketing, key, ticket::retry_comment(failed)));
        }
        self.dispatch_deployment(claim, &detail.deployment, RunTrigger::Retry);
        Ok(detail)
    }

    pub async fn get_deployment(&self, id: &str) -> Result<DeploymentDetail> {
        self.inner.store.get_deployment_detail(id).await
    }

    pub async fn list_deployments(
        &self,
        status: Option<DeploymentStatus>,
        page: u32,
        size: u32,
    ) -> Result<Page<Deployment>> {
        let (page, size) = page_bounds(page, size);
        let filters = DeploymentFilters {
            status,
            limit: Some(i64::from(size)),
            offset: (i64::from(page) - 1) * i64::from(size),
            ..Default::default()
        };
        Ok(Page {
            items: self.inner.store.list_deployments(&filters).await?,
            total: self.inner.store.count_deployments(&filters).await?,
            page,
            size,
        })
    }

    pub async fn deployment_runs(&self, id: &str) -> Result<Vec<Run>> {
        self.inner.store.get_deployment(id).await?;
        self.inner.store.list_runs(RunSubject::Deployment, id).await
    }

    // ---------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------

    /// Re-dispatch work interrupted by a restart: standalone requests and
    /// deployments that are `approved` or `provisioning`.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let requests = self
            .inner
            .store
            .standalone_requests_in(&[RequestStatus::Approved, RequestStatus::Provisioning])
            .await?;
        for request in requests {
            match self.inner.scheduler.claim(WorkKey::Request(request.id.clone())) {
                Ok(claim) => {
                    self.close_interrupted(RunSubject::Request, &request.id).await?;
                    self.dispatch_request(claim, &request, RunTrigger::Resume);
                    report.requests += 1;
                }
                Err(_) => continue,
            }
        }

        let deployments = self
            .inner
            .store
            .deployments_in(&[DeploymentStatus::Approved, DeploymentStatus::Provisioning])
            .await?;
        for deployment in deployments {
            match self
                .inner
                .scheduler
                .claim(WorkKey::Deployment(deployment.id.clone()))
            {
                Ok(claim) => {
                    self.close_interrupted(RunSubject::Deployment, &deployment.id)
                        .await?;
                    for child in self.inner.store.children(&deployment.id).await? {
                        self.close_interrupted(RunSubject::Request, &child.id).await?;
                    }
                    self.dispatch_deployment(claim, &deployment, RunTrigger::Resume);
                    report.deployments += 1;
                }
                Err(_) => continue,
            }
        }

        info!(
            requests = report.requests,
            deployments = report.deployments,
            "Reconciled interrupted work"
        );
        Ok(report)
    }

    /// Close the runs a previous process left open for a claimed subject.
    async fn close_interrupted(&self, subject: RunSubject, id: &str) -> Result<()> {
        let closed = self
            .inner
            .store
            .close_interrupted_runs(subject, id, RUN_INTERRUPTED)
            .await?;
        if closed > 0 {
            warn!(subject_id = %id, closed, "Closed runs interrupted by a restart");
        }
        Ok(())
    }

    /// Resolves once every dispatched run has finished.
    pub async fn wait_idle(&self) {
        self.inner.scheduler.wait_idle().await;
    }

    fn dispatch_request(&self, claim: Claim, request: &VmRequest, trigger: RunTrigger) {
        let scheduler = self.inner.scheduler.clone();
        let runner = Arc::clone(&self.inner.runner);
        let id = request.id.clone();
        let environment = request.environment.clone();
        let span = info_span!("dispatch", request_id = %id, environment = %environment);

        self.inner.scheduler.spawn(
            claim,
            async move {
                let _permit = match scheduler.permit(&environment).await {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!(error = %e, "No worker slot");
                        return;
                    }
                };
                if let Err(e) = runner.run(&id, trigger, None).await {
                    error!(error = %e, "Request run failed");
                }
            }
            .instrument(span),
        );
    }

    fn dispatch_deployment(&self, claim: Claim, deployment: &Deployment, trigger: RunTrigger) {
        let coordinator = Arc::clone(&self.inner.coordinator);
        let id = deployment.id.clone();
        let span = info_span!(
            "dispatch",
            deployment_id = %id,
            environment = %deployment.environment
        );

        self.inner.scheduler.spawn(
            claim,
            async move {
                if let Err(e) = coordinator.run(&id, trigger).await {
                    error!(error = %e, "Deployment run failed");
                }
            }
            .instrument(span),
        );
    }

    /// Individual actions are only available on standalone requests.
    async fn standalone(&self, id: &str) -> Result<()> {
        let request = self.inner.store.get_request(id).await?;
        match request.deployment_id {
            Some(deployment_id) => Err(OrchestratorError::InvalidState(format!(
                "request {id} belongs to deployment {deployment_id}; act on the deployment instead"
            ))),
            None => Ok(()),
        }
    }

    fn ticketing(&self) -> Option<Arc<dyn TicketingGateway>> {
        match self.inner.gateways.ticketing() {
            Ok(ticketing) => ticketing,
            Err(e) => {
                warn!(error = %e, "Ticketing settings unreadable");
                None
            }
        }
    }

    fn sync_decision(&self, key: Option<String>, decision: TicketDecision) {
        if let (Some(ticketing), Some(key)) = (self.ticketing(), key) {
            self.inner
                .scheduler
                .spawn_background(ticket::sync_decision(ticketing, key, decision));
        }
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

fn page_bounds(page: u32, size: u32) -> (u32, u32) {
    let size = if size == 0 { DEFAULT_PAGE_SIZE } else { size.min(MAX_PAGE_SIZE) };
    (page.max(1), size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_bounds() {
        assert_eq!(page_bounds(0, 0), (1, DEFAULT_PAGE_SIZE));
        assert_eq!(page_bounds(3, 500), (3, MAX_PAGE_SIZE));
        assert_eq!(page_bounds(2, 10), (2, 10));
    }
}
