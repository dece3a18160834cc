//! Hypervisor environment contract.
//!
//! An environment is one hypervisor cluster or account. Proxmox VE and vSphere
//! both sit behind [`EnvironmentGateway`]; the pipeline never branches on the
//! family.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hypervisor family an environment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    Proxmox,
    Vsphere,
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proxmox => write!(f, "proxmox"),
            Self::Vsphere => write!(f, "vsphere"),
        }
    }
}

/// Compute resources for a new VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sizing {
    pub cpu_cores: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
}

/// Hypervisor-side reference to an OS template.
///
/// `id` is a VMID for Proxmox and a template VM name for vSphere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub id: String,
    #[serde(default)]
    pub source_host: Option<String>,
    #[serde(default)]
    pub cloud_init: bool,
}

/// Static address handed to the guest through cloud-init or guest
/// customisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudInit {
    pub ip_address: String,
    pub prefix_len: u8,
    pub gateway: Option<String>,
}

impl CloudInit {
    pub fn new(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            prefix_len: 24,
            gateway: None,
        }
    }

    /// `10.0.0.5/24` style notation; an address that already carries a
    /// prefix is returned untouched.
    pub fn cidr(&self) -> String {
        if self.ip_address.contains('/') {
            self.ip_address.clone()
        } else {
            format!("{}/{}", self.ip_address, self.prefix_len)
        }
    }
}

/// Everything a gateway needs to build one VM.
#[derive(Debug, Clone)]
pub struct CloneSpec {
    pub name: String,
    pub template: TemplateRef,
    pub sizing: Sizing,
    pub cloud_init: Option<CloudInit>,
}

/// Identifies a VM inside its environment once the clone call returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHandle {
    pub vm_id: String,
    pub host: String,
}

/// Uniform interface to one hypervisor environment.
#[async_trait]
pub trait EnvironmentGateway: Send + Sync {
    /// Family of the environment behind this gateway.
    fn kind(&self) -> EnvironmentKind;

    /// Clone `spec.template` into a new VM and power it on.
    ///
    /// Returns as soon as the hypervisor accepted the VM; the caller polls
    /// [`is_ready`](Self::is_ready) afterwards. Fails with
    /// `EnvironmentUnavailable` or `TemplateNotFound`.
    async fn clone_template(&self, spec: &CloneSpec) -> Result<VmHandle>;

    /// Whether the VM reports a running state.
    async fn is_ready(&self, vm: &VmHandle) -> Result<bool>;

    /// Address reported by the guest, for VMs without a pre-allocated one.
    async fn get_address(&self, vm: &VmHandle) -> Result<Option<String>>;

    /// Stop and remove a VM. Used for rollback.
    async fn delete_vm(&self, vm: &VmHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_appends_default_prefix() {
        assert_eq!(CloudInit::new("10.20.0.15").cidr(), "10.20.0.15/24");
    }

    #[test]
    fn test_cidr_keeps_explicit_prefix() {
        assert_eq!(CloudInit::new("10.20.0.15/26").cidr(), "10.20.0.15/26");
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let kind: EnvironmentKind = serde_json::from_str("\"vsphere\"").unwrap();
        assert_eq!(kind, EnvironmentKind::Vsphere);
        assert_eq!(kind.to_string(), "vsphere");
    }
}
