//! VM request model and its state machine.
//!
//! ```text
//! pending_approval ──► approved ──► provisioning ──► completed
//!        │                              │ ▲
//!        ▼                              ▼ │ retry
//!     rejected                  provisioning_failed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;
use vm_gateway::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RequestStatus {
    PendingApproval,
    Approved,
    Rejected,
    Provisioning,
    ProvisioningFailed,
    Completed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Provisioning => "provisioning",
            Self::ProvisioningFailed => "provisioning_failed",
            Self::Completed => "completed",
        }
    }

    /// Edges of the request state machine.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (Approved, Provisioning)
                | (Provisioning, Completed)
                | (Provisioning, ProvisioningFailed)
                | (ProvisioningFailed, Provisioning)
        )
    }

    /// No further transition without an explicit retry.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Completed | Self::ProvisioningFailed
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending_approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "provisioning" => Ok(Self::Provisioning),
            "provisioning_failed" => Ok(Self::ProvisioningFailed),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown request status: {other}")),
        }
    }
}

/// Why a pipeline run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
pub enum FailureKind {
    AllocationFailed,
    AllocatorUnavailable,
    EnvironmentUnavailable,
    TemplateNotFound,
    ReadinessTimeout,
    TicketingUnavailable,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllocationFailed => "AllocationFailed",
            Self::AllocatorUnavailable => "AllocatorUnavailable",
            Self::EnvironmentUnavailable => "EnvironmentUnavailable",
            Self::TemplateNotFound => "TemplateNotFound",
            Self::ReadinessTimeout => "ReadinessTimeout",
            Self::TicketingUnavailable => "TicketingUnavailable",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed pipeline step. Recorded on the request, never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Failure of the address allocation step.
    pub fn allocation(err: &GatewayError) -> Self {
        let kind = match err {
            GatewayError::NoAddressAvailable(_) => FailureKind::AllocationFailed,
            _ => FailureKind::AllocatorUnavailable,
        };
        Self::new(kind, err.to_string())
    }

    /// Failure of the VM build step.
    pub fn build(err: &GatewayError) -> Self {
        let kind = match err {
            GatewayError::TemplateNotFound(_) => FailureKind::TemplateNotFound,
            _ => FailureKind::EnvironmentUnavailable,
        };
        Self::new(kind, err.to_string())
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One desired virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct VmRequest {
    pub id: String,
    pub deployment_id: Option<String>,
    /// Order within the parent deployment, 0 for standalone requests.
    pub position: i64,
    pub name: String,
    pub description: Option<String>,
    pub requestor: String,
    pub workload_type: String,
    pub os_template: String,
    pub size_tier: Option<String>,
    pub cpu_cores: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
    pub environment: String,
    pub subnet_id: Option<i64>,
    pub status: RequestStatus,
    /// Incremented by every retry. Pipeline writes are fenced on it.
    pub attempt: i64,

    pub vm_id: Option<String>,
    pub vm_host: Option<String>,
    pub ip_address: Option<String>,
    pub ticket_key: Option<String>,
    pub ticket_url: Option<String>,

    pub error_kind: Option<FailureKind>,
    pub error_message: Option<String>,
    pub warning_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl VmRequest {
    pub fn is_standalone(&self) -> bool {
        self.deployment_id.is_none()
    }

    pub fn sizing(&self) -> vm_gateway::Sizing {
        vm_gateway::Sizing {
            cpu_cores: self.cpu_cores,
            ram_mb: self.ram_mb,
            disk_gb: self.disk_gb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use super::RequestStatus::*;

    const ALL: [RequestStatus; 6] = [
        PendingApproval,
        Approved,
        Rejected,
        Provisioning,
        ProvisioningFailed,
        Completed,
    ];

    #[test]
    fn test_transition_table() {
        let allowed: HashSet<(RequestStatus, RequestStatus)> = ALL
            .iter()
            .flat_map(|from| ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();

        let expected: HashSet<_> = [
            (PendingApproval, Approved),
            (PendingApproval, Rejected),
            (Approved, Provisioning),
            (Provisioning, Completed),
            (Provisioning, ProvisioningFailed),
            (ProvisioningFailed, Provisioning),
        ]
        .into_iter()
        .collect();

        assert_eq!(allowed, expected);
    }

    #[test]
    fn test_no_edge_skips_provisioning() {
        for from in ALL {
            assert!(!from.can_transition_to(Completed) || from == Provisioning);
            assert!(!from.can_transition_to(ProvisioningFailed) || from == Provisioning);
        }
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        for to in ALL {
            assert!(!Rejected.can_transition_to(to));
            assert!(!Completed.can_transition_to(to));
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<RequestStatus>().unwrap(), status);
        }
        assert!("done".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn test_step_failure_classification() {
        let f = StepFailure::allocation(&GatewayError::NoAddressAvailable("subnet 7".into()));
        assert_eq!(f.kind, FailureKind::AllocationFailed);
        let f = StepFailure::allocation(&GatewayError::AllocatorUnavailable("timeout".into()));
        assert_eq!(f.kind, FailureKind::AllocatorUnavailable);
        let f = StepFailure::build(&GatewayError::TemplateNotFound("9000".into()));
        assert_eq!(f.kind, FailureKind::TemplateNotFound);
        let f = StepFailure::build(&GatewayError::Settings("bad yaml".into()));
        assert_eq!(f.kind, FailureKind::EnvironmentUnavailable);
        assert!(f.to_string().starts_with("EnvironmentUnavailable: "));
    }
}
