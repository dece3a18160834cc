//! Ticket contents and approval sync.

use crate::deployment::Deployment;
use crate::request::VmRequest;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use vm_gateway::{
    SubjectKind, TicketDecision, TicketRef, TicketRequest, TicketingGateway, VmHandle,
};

/// Ticket of the deployment a child belongs to, shared by the children of
/// one deployment run.
///
/// When the run could not open it up front, the first child that reaches
/// its ticket step upserts it and the others reuse that result, so
/// concurrent children never race to create the issue.
#[derive(Debug)]
pub struct ParentTicket {
    request: TicketRequest,
    issued: OnceCell<TicketRef>,
}

impl ParentTicket {
    pub fn new(request: TicketRequest, issued: Option<TicketRef>) -> Self {
        Self {
            request,
            issued: OnceCell::new_with(issued),
        }
    }

    /// The deployment ticket, upserting it on first use. A failed upsert
    /// leaves it unresolved for the next child.
    pub async fn resolve(&self, ticketing: &dyn TicketingGateway) -> vm_gateway::Result<TicketRef> {
        self.issued
            .get_or_try_init(|| ticketing.create_or_update_ticket(&self.request))
            .await
            .cloned()
    }

    pub fn issued(&self) -> Option<&TicketRef> {
        self.issued.get()
    }
}

/// Where a provisioned VM ended up.
#[derive(Debug, Clone, Copy)]
pub struct Provisioned<'a> {
    pub vm: &'a VmHandle,
    pub ip_address: Option<&'a str>,
}

pub fn request_ticket(request: &VmRequest, provisioned: Option<Provisioned<'_>>) -> TicketRequest {
    let mut description = String::new();
    let _ = writeln!(description, "Requested by: {}", request.requestor);
    let _ = writeln!(description, "Workload: {}", request.workload_type);
    let _ = writeln!(description, "Environment: {}", request.environment);
    let _ = writeln!(description, "OS template: {}", request.os_template);
    let _ = writeln!(description, "Size: {}", size_label(request));
    if let Some(text) = &request.description {
        let _ = writeln!(description, "\n{}", text);
    }
    if let Some(done) = provisioned {
        let _ = writeln!(description, "\n{}", provisioned_line(&request.name, done));
    }

    TicketRequest {
        subject_kind: SubjectKind::Request,
        subject_id: request.id.clone(),
        existing_key: request.ticket_key.clone(),
        summary: format!("VM Request: {}", request.name),
        description,
    }
}

pub fn deployment_ticket(deployment: &Deployment, vms: &[VmRequest]) -> TicketRequest {
    let mut description = String::new();
    let _ = writeln!(description, "Requested by: {}", deployment.requestor);
    let _ = writeln!(description, "Workload: {}", deployment.workload_type);
    let _ = writeln!(description, "Environment: {}", deployment.environment);
    if let Some(text) = &deployment.description {
        let _ = writeln!(description, "\n{}", text);
    }
    let _ = writeln!(description, "\nVMs ({}):", vms.len());
    for vm in vms {
        let _ = writeln!(
            description,
            "- {} ({}, {})",
            vm.name,
            vm.os_template,
            size_label(vm)
        );
    }

    TicketRequest {
        subject_kind: SubjectKind::Deployment,
        subject_id: deployment.id.clone(),
        existing_key: deployment.ticket_key.clone(),
        summary: format!("Deployment: {}", deployment.name),
        description,
    }
}

/// Comment added to a deployment ticket when one of its VMs is up.
pub fn provisioned_comment(request: &VmRequest, done: Provisioned<'_>) -> String {
    provisioned_line(&request.name, done)
}

pub fn decision_comment(decision: TicketDecision) -> &'static str {
    match decision {
        TicketDecision::Approved => "Request approved. Provisioning has been scheduled.",
        TicketDecision::Rejected => "Request rejected.",
    }
}

pub fn retry_comment(failed: usize) -> String {
    format!("Retrying provisioning for {failed} failed VM(s)")
}

fn provisioned_line(name: &str, done: Provisioned<'_>) -> String {
    format!(
        "VM {} provisioned: id {} on {}, address {}",
        name,
        done.vm.vm_id,
        done.vm.host,
        done.ip_address.unwrap_or("unassigned")
    )
}

fn size_label(request: &VmRequest) -> String {
    let sizing = format!(
        "{} vCPU, {} MB RAM, {} GB disk",
        request.cpu_cores, request.ram_mb, request.disk_gb
    );
    match &request.size_tier {
        Some(tier) => format!("{tier}: {sizing}"),
        None => sizing,
    }
}

/// Mirror an approval decision onto the ticket and leave a comment.
/// Failures are logged and otherwise ignored.
pub async fn sync_decision(
    ticketing: Arc<dyn TicketingGateway>,
    key: String,
    decision: TicketDecision,
) {
    match ticketing.record_decision(&key, decision).await {
        Ok(true) => debug!(ticket = %key, ?decision, "Ticket transitioned"),
        Ok(false) => debug!(ticket = %key, ?decision, "No matching ticket transition"),
        Err(e) => warn!(ticket = %key, error = %e, "Failed to transition ticket"),
    }
    if let Err(e) = ticketing.add_comment(&key, decision_comment(decision)).await {
        warn!(ticket = %key, error = %e, "Failed to comment on ticket");
    }
}

/// Best-effort comment in the background.
pub async fn post_comment(ticketing: Arc<dyn TicketingGateway>, key: String, body: String) {
    if let Err(e) = ticketing.add_comment(&key, &body).await {
        warn!(ticket = %key, error = %e, "Failed to comment on ticket");
    }
}
