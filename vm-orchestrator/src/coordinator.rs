//! Deployment runs: fan-out over children and status derivation.

use crate::deployment::{ChildTally, Deployment, DeploymentStatus};
use crate::error::{OrchestratorError, Result};
use crate::request::{RequestStatus, VmRequest};
use crate::run::{RunStatus, RunSubject, RunTrigger};
use crate::runner::RequestRunner;
use crate::scheduler::{Scheduler, WorkKey};
use crate::store::Store;
use crate::ticket::{self, ParentTicket};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use vm_gateway::GatewayProvider;

const WORKER_LOST: &str = "worker stopped unexpectedly";

pub struct Coordinator {
    store: Store,
    gateways: Arc<dyn GatewayProvider>,
    scheduler: Scheduler,
    runner: Arc<RequestRunner>,
}

impl Coordinator {
    pub fn new(
        store: Store,
        gateways: Arc<dyn GatewayProvider>,
        scheduler: Scheduler,
        runner: Arc<RequestRunner>,
    ) -> Self {
        Self {
            store,
            gateways,
            scheduler,
            runner,
        }
    }

    /// Run the children of a deployment that the trigger selects and write
    /// the derived status once all of them have settled.
    ///
    /// * approval: children that are `approved`
    /// * retry: children that are `provisioning_failed`
    /// * resume: children that are `approved` or `provisioning`
    ///
    /// Completed children are never touched.
    pub async fn run(&self, deployment_id: &str, trigger: RunTrigger) -> Result<DeploymentStatus> {
        let deployment = self.store.get_deployment(deployment_id).await?;
        let deployment = match deployment.status {
            DeploymentStatus::Approved => {
                self.store.start_deployment(deployment_id).await?;
                self.store.get_deployment(deployment_id).await?
            }
            DeploymentStatus::Provisioning => deployment,
            other => {
                return Err(OrchestratorError::InvalidState(format!(
                    "deployment {deployment_id} cannot run from status {other}"
                )))
            }
        };

        let span = info_span!(
            "deployment_run",
            deployment_id = %deployment.id,
            environment = %deployment.environment,
            attempt = deployment.attempt,
            %trigger,
        );
        self.execute(deployment, trigger).instrument(span).await
    }

    async fn execute(&self, deployment: Deployment, trigger: RunTrigger) -> Result<DeploymentStatus> {
        let run_id = self
            .store
            .start_run(RunSubject::Deployment, &deployment.id, trigger, deployment.attempt)
            .await?;

        let children = self.store.children(&deployment.id).await?;
        let parent = Arc::new(self.open_ticket(&deployment, &children).await?);

        let targets: Vec<VmRequest> = children
            .into_iter()
            .filter(|child| selects(trigger, child.status))
            .collect();
        info!(
            name = %deployment.name,
            vms = targets.len(),
            "Deployment run started"
        );

        let mut tasks = JoinSet::new();
        for child in &targets {
            tasks.spawn(
                self.child_task(child.clone(), trigger, Arc::clone(&parent))
                    .instrument(tracing::Span::current()),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((child_id, Ok(status))) => debug!(request_id = %child_id, %status, "VM settled"),
                Ok((child_id, Err(e))) => {
                    warn!(request_id = %child_id, error = %e, "VM run ended with an error")
                }
                Err(e) => error!(error = %e, "VM worker panicked"),
            }

            let tally = self.tally(&deployment.id).await?;
            debug!(
                completed = tally.completed,
                failed = tally.failed,
                in_flight = tally.in_flight,
                "Deployment progress"
            );
        }

        self.fail_abandoned(&targets).await?;
        if let (None, Some(issued)) = (&deployment.ticket_key, parent.issued()) {
            self.store
                .set_deployment_ticket(&deployment.id, &issued.key, &issued.url)
                .await?;
        }
        self.settle(&deployment, &run_id).await
    }

    fn child_task(
        &self,
        child: VmRequest,
        trigger: RunTrigger,
        parent: Arc<ParentTicket>,
    ) -> impl std::future::Future<Output = (String, Result<RequestStatus>)> + Send + 'static {
        let store = self.store.clone();
        let scheduler = self.scheduler.clone();
        let runner = Arc::clone(&self.runner);

        async move {
            let result = async {
                let _claim = scheduler.claim(WorkKey::Request(child.id.clone()))?;
                let _permit = scheduler.permit(&child.environment).await?;
                if child.status == RequestStatus::ProvisioningFailed {
                    store.restart_request(&child.id).await?;
                }
                runner.run(&child.id, trigger, Some(parent.as_ref())).await
            }
            .await;
            (child.id, result)
        }
    }

    /// Children that a worker left in `provisioning` are failed so the
    /// deployment can settle.
    async fn fail_abandoned(&self, targets: &[VmRequest]) -> Result<()> {
        for target in targets {
            let child = self.store.get_request(&target.id).await?;
            if child.status == RequestStatus::Provisioning {
                warn!(request_id = %child.id, "Failing VM abandoned by its worker");
                self.store
                    .fail_request(&child.id, child.attempt, None, WORKER_LOST)
                    .await?;
            }
        }
        Ok(())
    }

    async fn tally(&self, deployment_id: &str) -> Result<ChildTally> {
        let children = self.store.children(deployment_id).await?;
        Ok(ChildTally::of(children.iter().map(|c| &c.status)))
    }

    async fn settle(&self, deployment: &Deployment, run_id: &str) -> Result<DeploymentStatus> {
        let tally = self.tally(&deployment.id).await?;
        let status = tally.status();

        if status == DeploymentStatus::Provisioning {
            // Left for the next resume.
            let message = format!("{} VM(s) did not start", tally.in_flight);
            error!(in_flight = tally.in_flight, "Deployment run ended with unsettled VMs");
            self.store
                .finish_run(run_id, RunStatus::Failed, Some(&message))
                .await?;
            return Ok(status);
        }

        let summary = tally.error_summary();
        self.store
            .finish_deployment(&deployment.id, status, summary.as_deref())
            .await?;

        let run_status = if status == DeploymentStatus::Completed {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        self.store
            .finish_run(run_id, run_status, summary.as_deref())
            .await?;

        info!(
            %status,
            completed = tally.completed,
            failed = tally.failed,
            "Deployment run finished"
        );
        Ok(status)
    }

    /// Upsert the deployment ticket. A failure is kept as the deployment's
    /// warning; the first child to finish upserts it instead.
    async fn open_ticket(&self, deployment: &Deployment, children: &[VmRequest]) -> Result<ParentTicket> {
        let request = ticket::deployment_ticket(deployment, children);

        let ticketing = match self.gateways.ticketing() {
            Ok(Some(ticketing)) => ticketing,
            Ok(None) => {
                return Ok(ParentTicket::new(request, None))
            }
            Err(e) => {
                self.store
                    .set_deployment_warning(&deployment.id, Some(&format!("TicketingUnavailable: {e}")))
                    .await?;
                return Ok(ParentTicket::new(request, None));
            }
        };

        match ticketing.create_or_update_ticket(&request).await {
            Ok(issued) => {
                self.store
                    .set_deployment_ticket(&deployment.id, &issued.key, &issued.url)
                    .await?;
                Ok(ParentTicket::new(request, Some(issued)))
            }
            Err(e) => {
                warn!(error = %e, "Failed to update deployment ticket");
                self.store
                    .set_deployment_warning(&deployment.id, Some(&format!("TicketingUnavailable: {e}")))
                    .await?;
                Ok(ParentTicket::new(request, None))
            }
        }
    }
}

fn selects(trigger: RunTrigger, status: RequestStatus) -> bool {
    match trigger {
        RunTrigger::Approval => status == RequestStatus::Approved,
        RunTrigger::Retry => status == RequestStatus::ProvisioningFailed,
        RunTrigger::Resume => matches!(
            status,
            RequestStatus::Approved | RequestStatus::Provisioning
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_children_are_never_selected() {
        for trigger in [RunTrigger::Approval, RunTrigger::Retry, RunTrigger::Resume] {
            assert!(!selects(trigger, RequestStatus::Completed));
            assert!(!selects(trigger, RequestStatus::Rejected));
        }
    }

    #[test]
    fn test_retry_selects_only_failed_children() {
        assert!(selects(RunTrigger::Retry, RequestStatus::ProvisioningFailed));
        assert!(!selects(RunTrigger::Retry, RequestStatus::Approved));
        assert!(!selects(RunTrigger::Approval, RequestStatus::ProvisioningFailed));
        assert!(selects(RunTrigger::Resume, RequestStatus::Provisioning));
    }
}
