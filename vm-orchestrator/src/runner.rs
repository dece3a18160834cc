//! Executes one run of a VM request and records its terminal status.

use crate::error::{OrchestratorError, Result};
use crate::pipeline::{Pipeline, PipelineOutcome};
use crate::request::{RequestStatus, VmRequest};
use crate::run::{RunStatus, RunSubject, RunTrigger};
use crate::store::Store;
use crate::ticket::ParentTicket;
use tracing::{error, info, info_span, Instrument};

pub struct RequestRunner {
    store: Store,
    pipeline: Pipeline,
}

impl RequestRunner {
    pub fn new(store: Store, pipeline: Pipeline) -> Self {
        Self { store, pipeline }
    }

    /// Drive `request_id` to a terminal status.
    ///
    /// The request must be `approved` (it is moved to `provisioning`) or
    /// already `provisioning` (retried or resumed). The caller holds the
    /// request's claim and a worker permit. The terminal write only applies
    /// while the request is still on the attempt this run started with.
    pub async fn run(
        &self,
        request_id: &str,
        trigger: RunTrigger,
        parent: Option<&ParentTicket>,
    ) -> Result<RequestStatus> {
        let request = self.store.get_request(request_id).await?;
        let request = match request.status {
            RequestStatus::Approved => {
                self.store.start_request(request_id).await?;
                self.store.get_request(request_id).await?
            }
            RequestStatus::Provisioning => request,
            other => {
                return Err(OrchestratorError::InvalidState(format!(
                    "request {request_id} cannot run from status {other}"
                )))
            }
        };

        let span = info_span!(
            "request_run",
            request_id = %request.id,
            deployment_id = request.deployment_id.as_deref().unwrap_or(""),
            environment = %request.environment,
            attempt = request.attempt,
            %trigger,
        );

        async {
            let run_id = self
                .store
                .start_run(RunSubject::Request, &request.id, trigger, request.attempt)
                .await?;
            info!(name = %request.name, "Provisioning started");

            let outcome = self.pipeline.run(&request, &run_id, parent).await;
            self.settle(&request, &run_id, outcome).await
        }
        .instrument(span)
        .await
    }

    async fn settle(
        &self,
        request: &VmRequest,
        run_id: &str,
        outcome: Result<PipelineOutcome>,
    ) -> Result<RequestStatus> {
        match outcome {
            Ok(PipelineOutcome::Completed { warning }) => {
                self.store
                    .complete_request(&request.id, request.attempt, warning.as_deref())
                    .await?;
                self.store
                    .finish_run(run_id, RunStatus::Succeeded, warning.as_deref())
                    .await?;
                info!(warning = warning.as_deref(), "Provisioning completed");
                Ok(RequestStatus::Completed)
            }
            Ok(PipelineOutcome::Failed(failure)) => {
                let message = failure.to_string();
                self.store
                    .fail_request(&request.id, request.attempt, Some(failure.kind), &message)
                    .await?;
                self.store
                    .finish_run(run_id, RunStatus::Failed, Some(&message))
                    .await?;
                info!(error = %message, "Provisioning failed");
                Ok(RequestStatus::ProvisioningFailed)
            }
            Err(e) => {
                error!(error = %e, "Provisioning aborted");
                let message = format!("internal error: {e}");
                self.store
                    .fail_request(&request.id, request.attempt, None, &message)
                    .await?;
                self.store
                    .finish_run(run_id, RunStatus::Failed, Some(&message))
                    .await?;
                Ok(RequestStatus::ProvisioningFailed)
            }
        }
    }
}
