//! Resolves environment names to gateways.
//!
//! Clients are built from freshly loaded settings on every call, so a
//! credentials change takes effect on the next pipeline run without a
//! restart.

use crate::address::AddressAllocator;
use crate::environment::{EnvironmentGateway, EnvironmentKind};
use crate::error::{GatewayError, Result};
use crate::jira::JiraGateway;
use crate::phpipam::PhpIpamAllocator;
use crate::proxmox::ProxmoxGateway;
use crate::settings::{EnvironmentSettings, SettingsSource};
use crate::ticketing::TicketingGateway;
use crate::vsphere::VsphereGateway;
use serde::Serialize;
use std::sync::Arc;

/// Non-secret view of one configured environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentInfo {
    pub name: String,
    pub display_name: Option<String>,
    pub kind: EnvironmentKind,
    pub enabled: bool,
    pub max_concurrent: Option<usize>,
}

impl From<&EnvironmentSettings> for EnvironmentInfo {
    fn from(env: &EnvironmentSettings) -> Self {
        Self {
            name: env.name.clone(),
            display_name: env.display_name.clone(),
            kind: env.kind,
            enabled: env.enabled,
            max_concurrent: env.max_concurrent,
        }
    }
}

/// Source of gateways for the orchestrator.
pub trait GatewayProvider: Send + Sync {
    /// All configured environments.
    fn environments(&self) -> Result<Vec<EnvironmentInfo>>;

    /// One environment by name, `None` when it is not configured.
    fn environment_info(&self, name: &str) -> Result<Option<EnvironmentInfo>> {
        Ok(self.environments()?.into_iter().find(|e| e.name == name))
    }

    /// Gateway for an enabled environment.
    fn environment(&self, name: &str) -> Result<Arc<dyn EnvironmentGateway>>;

    /// Ticketing gateway, `None` when ticketing is not configured.
    fn ticketing(&self) -> Result<Option<Arc<dyn TicketingGateway>>>;

    /// Address allocator, `None` when no IPAM is configured.
    fn allocator(&self) -> Result<Option<Arc<dyn AddressAllocator>>>;
}

/// [`GatewayProvider`] backed by a [`SettingsSource`].
pub struct SettingsGateways<S> {
    source: S,
}

impl<S: SettingsSource> SettingsGateways<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: SettingsSource> GatewayProvider for SettingsGateways<S> {
    fn environments(&self) -> Result<Vec<EnvironmentInfo>> {
        let settings = self.source.load()?;
        Ok(settings.environments.iter().map(EnvironmentInfo::from).collect())
    }

    fn environment(&self, name: &str) -> Result<Arc<dyn EnvironmentGateway>> {
        let settings = self.source.load()?;
        let env = settings.environment(name).ok_or_else(|| {
            GatewayError::EnvironmentUnavailable(format!("environment {name} is not configured"))
        })?;
        if !env.enabled {
            return Err(GatewayError::EnvironmentUnavailable(format!(
                "environment {name} is disabled"
            )));
        }

        match env.kind {
            EnvironmentKind::Proxmox => {
                let creds = env.proxmox.as_ref().ok_or_else(|| {
                    GatewayError::EnvironmentUnavailable(format!(
                        "environment {name} has no Proxmox credentials"
                    ))
                })?;
                Ok(Arc::new(ProxmoxGateway::new(creds)?))
            }
            EnvironmentKind::Vsphere => {
                let creds = env.vsphere.as_ref().ok_or_else(|| {
                    GatewayError::EnvironmentUnavailable(format!(
                        "environment {name} has no vSphere credentials"
                    ))
                })?;
                Ok(Arc::new(VsphereGateway::new(creds)?))
            }
        }
    }

    fn ticketing(&self) -> Result<Option<Arc<dyn TicketingGateway>>> {
        let settings = self.source.load()?;
        match settings.ticketing {
            Some(jira) if !jira.api_token.is_empty() => Ok(Some(Arc::new(JiraGateway::new(&jira)?))),
            _ => Ok(None),
        }
    }

    fn allocator(&self) -> Result<Option<Arc<dyn AddressAllocator>>> {
        let settings = self.source.load()?;
        match settings.ipam {
            Some(ipam) if !ipam.token.is_empty() => Ok(Some(Arc::new(PhpIpamAllocator::new(&ipam)?))),
            _ => Ok(None),
        }
    }
}
