//! Read-only gateway settings.
//!
//! Credentials come from a YAML document that is re-read every time a
//! gateway is built. Nothing here caches a secret; a pipeline run holds its
//! gateways (and therefore its credentials) only for the duration of the run.

use crate::environment::EnvironmentKind;
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A credential value that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(****)")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default)]
    pub environments: Vec<EnvironmentSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticketing: Option<JiraSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamSettings>,
}

impl GatewaySettings {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml_ng::from_str(content)
            .map_err(|e| GatewayError::Settings(format!("invalid gateway settings: {e}")))
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentSettings> {
        self.environments.iter().find(|e| e.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSettings {
    pub name: String,

    #[serde(default)]
    pub display_name: Option<String>,

    pub kind: EnvironmentKind,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Worker cap for this environment; the scheduler default applies when unset.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    #[serde(default)]
    pub proxmox: Option<ProxmoxCredentials>,

    #[serde(default)]
    pub vsphere: Option<VsphereCredentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxmoxCredentials {
    pub host: String,
    #[serde(default = "default_proxmox_port")]
    pub port: u16,
    pub user: String,
    pub token_name: String,
    pub token_value: Secret,
    #[serde(default)]
    pub verify_ssl: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VsphereCredentials {
    pub host: String,
    #[serde(default = "default_https_port")]
    pub port: u16,
    pub user: String,
    pub password: Secret,
    #[serde(default)]
    pub verify_ssl: bool,
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JiraSettings {
    pub base_url: String,
    pub email: String,
    pub api_token: Secret,
    #[serde(default = "default_project_key")]
    pub project_key: String,
    #[serde(default = "default_issue_type")]
    pub issue_type: String,
    #[serde(default = "default_approve_transition")]
    pub approve_transition: String,
    #[serde(default = "default_reject_transition")]
    pub reject_transition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpamSettings {
    pub url: String,
    pub app_id: String,
    pub token: Secret,
    #[serde(default)]
    pub verify_ssl: bool,
}

fn default_true() -> bool {
    true
}

fn default_proxmox_port() -> u16 {
    8006
}

fn default_https_port() -> u16 {
    443
}

fn default_project_key() -> String {
    "INFRA".to_string()
}

fn default_issue_type() -> String {
    "Service Request".to_string()
}

fn default_approve_transition() -> String {
    "Approved".to_string()
}

fn default_reject_transition() -> String {
    "Declined".to_string()
}

/// Read-only source of gateway settings.
pub trait SettingsSource: Send + Sync {
    fn load(&self) -> Result<GatewaySettings>;
}

/// Settings backed by a YAML file, read on every [`load`](SettingsSource::load).
///
/// A missing file yields empty settings: no environments, no ticketing, no IPAM.
#[derive(Debug, Clone)]
pub struct YamlSettingsFile {
    path: PathBuf,
}

impl YamlSettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsSource for YamlSettingsFile {
    fn load(&self) -> Result<GatewaySettings> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "Gateway settings file missing, using empty settings");
            return Ok(GatewaySettings::default());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            GatewayError::Settings(format!("cannot read {}: {e}", self.path.display()))
        })?;
        GatewaySettings::from_yaml_str(&content)
    }
}

/// Fixed in-memory settings.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings(pub GatewaySettings);

impl SettingsSource for StaticSettings {
    fn load(&self) -> Result<GatewaySettings> {
        Ok(self.0.clone())
    }
}
