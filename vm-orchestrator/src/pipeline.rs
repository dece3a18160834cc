//! Provisioning pipeline for one VM request.
//!
//! Steps run in order and each one checkpoints its result on the request
//! before the next starts:
//!
//! 1. address allocation (only with a subnet)
//! 2. VM build
//! 3. readiness wait
//! 4. ticket upsert
//!
//! A failed step short-circuits the rest and comes back as
//! [`PipelineOutcome::Failed`]. Only store errors are returned as `Err`.
//!
//! Re-running the pipeline for the same request is safe: step 1 releases a
//! previously recorded address before allocating, steps 1 and 2 are skipped
//! when a VM is already recorded for the current attempt, step 3 always
//! re-polls and step 4 is an upsert keyed by the request.

use crate::catalog::Catalog;
use crate::error::{OrchestratorError, Result};
use crate::request::{FailureKind, StepFailure, VmRequest};
use crate::store::Store;
use crate::ticket::{self, ParentTicket, Provisioned};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vm_gateway::{
    AddressAllocator, CloneSpec, CloudInit, EnvironmentGateway, GatewayProvider, TicketRef,
    VmHandle,
};

/// How long and how often to poll a new VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
        }
    }
}

impl ReadinessPolicy {
    /// Interval after `current`: doubled, capped at `max_interval`.
    pub fn next_interval(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_interval)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The VM is up. A warning carries a non-fatal ticketing failure.
    Completed { warning: Option<String> },
    Failed(StepFailure),
}

enum StepError {
    Failed(StepFailure),
    Store(OrchestratorError),
}

impl From<StepFailure> for StepError {
    fn from(failure: StepFailure) -> Self {
        Self::Failed(failure)
    }
}

impl From<OrchestratorError> for StepError {
    fn from(err: OrchestratorError) -> Self {
        Self::Store(err)
    }
}

type StepResult<T> = std::result::Result<T, StepError>;

pub struct Pipeline {
    store: Store,
    gateways: Arc<dyn GatewayProvider>,
    catalog: Arc<Catalog>,
    readiness: ReadinessPolicy,
}

impl Pipeline {
    pub fn new(
        store: Store,
        gateways: Arc<dyn GatewayProvider>,
        catalog: Arc<Catalog>,
        readiness: ReadinessPolicy,
    ) -> Self {
        Self {
            store,
            gateways,
            catalog,
            readiness,
        }
    }

    /// Run all steps for `request`, which must be `provisioning`.
    ///
    /// `parent` is set for deployment children; their ticket step reports to
    /// the deployment's ticket instead of opening one of their own.
    pub async fn run(
        &self,
        request: &VmRequest,
        run_id: &str,
        parent: Option<&ParentTicket>,
    ) -> Result<PipelineOutcome> {
        match self.steps(request, run_id, parent).await {
            Ok(warning) => Ok(PipelineOutcome::Completed { warning }),
            Err(StepError::Failed(failure)) => {
                warn!(kind = %failure.kind, error = %failure.message, "Pipeline step failed");
                Ok(PipelineOutcome::Failed(failure))
            }
            Err(StepError::Store(e)) => Err(e),
        }
    }

    async fn steps(
        &self,
        request: &VmRequest,
        run_id: &str,
        parent: Option<&ParentTicket>,
    ) -> StepResult<Option<String>> {
        let environment = self
            .gateways
            .environment(&request.environment)
            .map_err(|e| StepFailure::build(&e))?;

        let mut ip_address = request.ip_address.clone();
        let vm = match recorded_vm(request) {
            Some(vm) => {
                info!(vm_id = %vm.vm_id, host = %vm.host, "VM already recorded for this attempt, re-polling");
                self.store.set_run_vm(run_id, &vm.vm_id).await?;
                vm
            }
            None => {
                ip_address = self.allocate_address(request).await?;
                self.build(request, run_id, environment.as_ref(), &mut ip_address)
                    .await?
            }
        };

        self.wait_ready(environment.as_ref(), &vm).await?;

        if ip_address.is_none() {
            match environment.get_address(&vm).await {
                Ok(Some(reported)) => {
                    self.store
                        .record_address(&request.id, request.attempt, Some(&reported))
                        .await?;
                    ip_address = Some(reported);
                }
                Ok(None) => debug!("Guest did not report an address"),
                Err(e) => warn!(error = %e, "Failed to read guest address"),
            }
        }

        let done = Provisioned {
            vm: &vm,
            ip_address: ip_address.as_deref(),
        };
        Ok(self.open_ticket(request, done, parent).await?)
    }

    /// Step 1. Returns the address now held for the request.
    async fn allocate_address(&self, request: &VmRequest) -> StepResult<Option<String>> {
        let Some(subnet_id) = request.subnet_id else {
            if request.ip_address.is_some() {
                self.store
                    .record_address(&request.id, request.attempt, None)
                    .await?;
            }
            return Ok(None);
        };

        let allocator = self.allocator(subnet_id)?;

        if let Some(previous) = &request.ip_address {
            allocator.release(subnet_id, previous).await.map_err(|e| {
                StepFailure::new(
                    FailureKind::AllocatorUnavailable,
                    format!("could not release {previous}: {e}"),
                )
            })?;
            self.store
                .record_address(&request.id, request.attempt, None)
                .await?;
            debug!(ip = %previous, subnet_id, "Released previous address");
        }

        let ip = allocator
            .allocate(subnet_id, &request.name)
            .await
            .map_err(|e| StepFailure::allocation(&e))?;
        self.store
            .record_address(&request.id, request.attempt, Some(&ip))
            .await?;
        info!(ip = %ip, subnet_id, "Address allocated");

        Ok(Some(ip))
    }

    fn allocator(&self, subnet_id: i64) -> StepResult<Arc<dyn AddressAllocator>> {
        let allocator = self
            .gateways
            .allocator()
            .map_err(|e| StepFailure::allocation(&e))?;
        allocator.ok_or_else(|| {
            StepFailure::new(
                FailureKind::AllocatorUnavailable,
                format!("subnet {subnet_id} requested but no address allocator is configured"),
            )
            .into()
        })
    }

    /// Step 2. Records the VM as soon as the hypervisor returns it.
    async fn build(
        &self,
        request: &VmRequest,
        run_id: &str,
        environment: &dyn EnvironmentGateway,
        ip_address: &mut Option<String>,
    ) -> StepResult<VmHandle> {
        let template = match self
            .catalog
            .template_for(&request.os_template, &request.environment)
        {
            Some(template) => template,
            None => {
                self.give_back(request, ip_address).await?;
                return Err(StepFailure::new(
                    FailureKind::TemplateNotFound,
                    format!(
                        "template {} is not available in environment {}",
                        request.os_template, request.environment
                    ),
                )
                .into());
            }
        };

        let spec = CloneSpec {
            name: request.name.clone(),
            template,
            sizing: request.sizing(),
            cloud_init: ip_address.as_deref().map(CloudInit::new),
        };

        let vm = match environment.clone_template(&spec).await {
            Ok(vm) => vm,
            Err(e) => {
                self.give_back(request, ip_address).await?;
                return Err(StepFailure::build(&e).into());
            }
        };

        self.store
            .record_vm(&request.id, request.attempt, &vm)
            .await?;
        self.store.set_run_vm(run_id, &vm.vm_id).await?;
        info!(vm_id = %vm.vm_id, host = %vm.host, "VM created");

        Ok(vm)
    }

    /// Release an address allocated by this attempt after a failed build.
    async fn give_back(&self, request: &VmRequest, ip_address: &mut Option<String>) -> Result<()> {
        let (Some(subnet_id), Some(ip)) = (request.subnet_id, ip_address.take()) else {
            return Ok(());
        };

        match self.gateways.allocator() {
            Ok(Some(allocator)) => match allocator.release(subnet_id, &ip).await {
                Ok(()) => {
                    self.store
                        .record_address(&request.id, request.attempt, None)
                        .await?;
                    debug!(ip = %ip, "Released address after failed build");
                }
                Err(e) => {
                    // Still recorded, so the next attempt releases it.
                    warn!(ip = %ip, error = %e, "Failed to release address after failed build");
                }
            },
            Ok(None) => {}
            Err(e) => warn!(ip = %ip, error = %e, "Failed to release address after failed build"),
        }
        Ok(())
    }

    /// Step 3. Polls with exponential backoff until ready or timed out. The
    /// VM is left in place on timeout.
    async fn wait_ready(&self, environment: &dyn EnvironmentGateway, vm: &VmHandle) -> StepResult<()> {
        let deadline = Instant::now() + self.readiness.timeout;
        let mut interval = self.readiness.initial_interval;

        loop {
            match environment.is_ready(vm).await {
                Ok(true) => {
                    info!(vm_id = %vm.vm_id, "VM is ready");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => warn!(vm_id = %vm.vm_id, error = %e, "Readiness poll failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StepFailure::new(
                    FailureKind::ReadinessTimeout,
                    format!(
                        "VM {} on {} was not ready after {}s",
                        vm.vm_id,
                        vm.host,
                        self.readiness.timeout.as_secs()
                    ),
                )
                .into());
            }

            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = self.readiness.next_interval(interval);
        }
    }

    /// Step 4. Never fails the run; a ticketing failure becomes the warning.
    async fn open_ticket(
        &self,
        request: &VmRequest,
        done: Provisioned<'_>,
        parent: Option<&ParentTicket>,
    ) -> Result<Option<String>> {
        let ticketing = match self.gateways.ticketing() {
            Ok(Some(ticketing)) => ticketing,
            Ok(None) => return Ok(None),
            Err(e) => return Ok(Some(ticket_warning(&e))),
        };

        let issued: vm_gateway::Result<TicketRef> = match parent {
            None => {
                ticketing
                    .create_or_update_ticket(&ticket::request_ticket(request, Some(done)))
                    .await
            }
            Some(parent) => match parent.resolve(ticketing.as_ref()).await {
                Ok(issued) => ticketing
                    .add_comment(&issued.key, &ticket::provisioned_comment(request, done))
                    .await
                    .map(|()| issued),
                Err(e) => Err(e),
            },
        };

        match issued {
            Ok(issued) => {
                self.store
                    .record_ticket(&request.id, request.attempt, &issued.key, &issued.url)
                    .await?;
                debug!(ticket = %issued.key, "Ticket updated");
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "Ticket step failed, VM is kept");
                Ok(Some(ticket_warning(&e)))
            }
        }
    }
}

fn recorded_vm(request: &VmRequest) -> Option<VmHandle> {
    match (&request.vm_id, &request.vm_host) {
        (Some(vm_id), Some(host)) => Some(VmHandle {
            vm_id: vm_id.clone(),
            host: host.clone(),
        }),
        _ => None,
    }
}

fn ticket_warning(err: &vm_gateway::GatewayError) -> String {
    StepFailure::new(FailureKind::TicketingUnavailable, err.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = ReadinessPolicy::default();
        let mut interval = policy.initial_interval;
        let mut seen = vec![interval.as_secs()];
        for _ in 0..6 {
            interval = policy.next_interval(interval);
            seen.push(interval.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_default_timeout_is_ten_minutes() {
        assert_eq!(ReadinessPolicy::default().timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_ticket_warning_names_kind() {
        let warning = ticket_warning(&vm_gateway::GatewayError::TicketingUnavailable(
            "503".into(),
        ));
        assert!(warning.starts_with("TicketingUnavailable: "));
    }
}
