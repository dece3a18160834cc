//! Ticketing contract.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a ticket is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Request,
    Deployment,
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Deployment => write!(f, "deployment"),
        }
    }
}

/// Input for an idempotent create-or-update.
#[derive(Debug, Clone)]
pub struct TicketRequest {
    pub subject_kind: SubjectKind,
    pub subject_id: String,
    /// Key already known for this subject, if any.
    pub existing_key: Option<String>,
    pub summary: String,
    pub description: String,
}

impl TicketRequest {
    /// External key the ticket is labelled with. Two upserts for the same
    /// subject resolve to the same issue through it.
    pub fn external_key(&self) -> String {
        external_key(self.subject_kind, &self.subject_id)
    }
}

pub fn external_key(kind: SubjectKind, subject_id: &str) -> String {
    format!("vm-{}-{}", kind, subject_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRef {
    pub key: String,
    pub url: String,
}

/// Approval decisions mirrored onto the external issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketDecision {
    Approved,
    Rejected,
}

#[async_trait]
pub trait TicketingGateway: Send + Sync {
    /// Create the ticket for a subject, or update the existing one.
    ///
    /// Fails with `TicketingUnavailable`.
    async fn create_or_update_ticket(&self, request: &TicketRequest) -> Result<TicketRef>;

    /// Add a plain-text comment to an existing ticket.
    async fn add_comment(&self, key: &str, body: &str) -> Result<()>;

    /// Move the ticket through the workflow transition configured for
    /// `decision`. Returns `false` when the transition is not available.
    async fn record_decision(&self, key: &str, decision: TicketDecision) -> Result<bool>;
}
