//! Deployment model and aggregate status derivation.

use crate::request::{RequestStatus, VmRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DeploymentStatus {
    PendingApproval,
    Approved,
    Rejected,
    Provisioning,
    Completed,
    PartiallyCompleted,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Provisioning => "provisioning",
            Self::Completed => "completed",
            Self::PartiallyCompleted => "partially_completed",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (Approved, Provisioning)
                | (Provisioning, Completed)
                | (Provisioning, PartiallyCompleted)
                | (Provisioning, Failed)
                | (PartiallyCompleted, Provisioning)
                | (Failed, Provisioning)
        )
    }

    pub fn is_retriable(self) -> bool {
        matches!(self, Self::PartiallyCompleted | Self::Failed)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending_approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "provisioning" => Ok(Self::Provisioning),
            "completed" => Ok(Self::Completed),
            "partially_completed" => Ok(Self::PartiallyCompleted),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown deployment status: {other}")),
        }
    }
}

/// Counts of child statuses that feed the derivation rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildTally {
    pub completed: usize,
    pub failed: usize,
    pub in_flight: usize,
}

impl ChildTally {
    pub fn of<'a>(children: impl IntoIterator<Item = &'a RequestStatus>) -> Self {
        children
            .into_iter()
            .fold(Self::default(), |mut tally, status| {
                match status {
                    RequestStatus::Completed => tally.completed += 1,
                    RequestStatus::ProvisioningFailed => tally.failed += 1,
                    RequestStatus::Rejected => {}
                    RequestStatus::PendingApproval
                    | RequestStatus::Approved
                    | RequestStatus::Provisioning => tally.in_flight += 1,
                }
                tally
            })
    }

    pub fn total(&self) -> usize {
        self.completed + self.failed + self.in_flight
    }

    /// Derived deployment status.
    ///
    /// Anything still in flight keeps the deployment `provisioning`. Once
    /// every child has settled: all completed is `completed`, all failed is
    /// `failed`, a mix is `partially_completed`. Rejected children are not
    /// counted.
    pub fn status(&self) -> DeploymentStatus {
        if self.in_flight > 0 {
            DeploymentStatus::Provisioning
        } else if self.failed == 0 {
            DeploymentStatus::Completed
        } else if self.completed == 0 {
            DeploymentStatus::Failed
        } else {
            DeploymentStatus::PartiallyCompleted
        }
    }

    /// Error summary recorded on a settled deployment with failed children.
    pub fn error_summary(&self) -> Option<String> {
        (self.failed > 0).then(|| format!("{}/{} VMs failed", self.failed, self.total()))
    }
}

/// Derived status of a deployment with the given children.
pub fn derive_status(children: &[VmRequest]) -> DeploymentStatus {
    ChildTally::of(children.iter().map(|c| &c.status)).status()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub requestor: String,
    pub workload_type: String,
    pub environment: String,
    pub status: DeploymentStatus,
    pub attempt: i64,
    pub ticket_key: Option<String>,
    pub ticket_url: Option<String>,
    pub error_message: Option<String>,
    pub warning_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A deployment together with its children in creation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeploymentDetail {
    #[serde(flatten)]
    pub deployment: Deployment,
    pub vms: Vec<VmRequest>,
}
