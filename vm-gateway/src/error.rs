//! Error types for gateway operations.
//!
//! Every gateway family reports failures through [`GatewayError`], so the
//! orchestrator can classify a failed step without knowing which hypervisor,
//! ticketing system or IPAM product sat behind the call.

use thiserror::Error;

/// Errors that can occur while talking to an external system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Ticketing unavailable: {0}")]
    TicketingUnavailable(String),

    #[error("No address available: {0}")]
    NoAddressAvailable(String),

    #[error("Address allocator unavailable: {0}")]
    AllocatorUnavailable(String),

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Settings error: {0}")]
    Settings(String),
}

impl GatewayError {
    /// Short, stable name of the variant, used in logs and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EnvironmentUnavailable(_) => "EnvironmentUnavailable",
            Self::TemplateNotFound(_) => "TemplateNotFound",
            Self::TicketingUnavailable(_) => "TicketingUnavailable",
            Self::NoAddressAvailable(_) => "NoAddressAvailable",
            Self::AllocatorUnavailable(_) => "AllocatorUnavailable",
            Self::NotConfigured(_) => "NotConfigured",
            Self::Settings(_) => "Settings",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(
            GatewayError::TemplateNotFound("ubuntu".into()).kind(),
            "TemplateNotFound"
        );
        assert_eq!(
            GatewayError::NoAddressAvailable("subnet 7".into()).kind(),
            "NoAddressAvailable"
        );
    }

    #[test]
    fn test_display_includes_detail() {
        let err = GatewayError::EnvironmentUnavailable("pve-lab: connection refused".into());
        assert_eq!(
            err.to_string(),
            "Environment unavailable: pve-lab: connection refused"
        );
    }
}
