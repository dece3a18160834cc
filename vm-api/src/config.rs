use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use vm_orchestrator::{ReadinessPolicy, ServiceConfig};

/// Service configuration, read from `VM_API_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Gateway settings YAML, re-read on every pipeline run.
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,

    /// Catalog YAML. The built-in catalog is used when unset.
    #[serde(default = "default_catalog_path")]
    pub catalog_path: Option<PathBuf>,

    #[serde(default = "default_workers")]
    pub default_workers: usize,

    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    #[serde(default = "default_ready_poll_initial")]
    pub ready_poll_initial_secs: u64,

    #[serde(default = "default_ready_poll_max")]
    pub ready_poll_max_secs: u64,

    #[serde(default = "default_reconcile_on_start")]
    pub reconcile_on_start: bool,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vm")
        .join("provisioner")
}

fn default_bind_addr() -> String {
    std::env::var("VM_API_BIND").unwrap_or_else(|_| "0.0.0.0:3121".to_string())
}

fn default_db_path() -> PathBuf {
    std::env::var("VM_API_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir().join("provisioner.db"))
}

fn default_settings_path() -> PathBuf {
    std::env::var("VM_API_SETTINGS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir().join("settings.yaml"))
}

fn default_catalog_path() -> Option<PathBuf> {
    std::env::var("VM_API_CATALOG_PATH")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}

fn default_workers() -> usize {
    env_parse("VM_API_DEFAULT_WORKERS").unwrap_or(vm_orchestrator::scheduler::DEFAULT_WORKERS)
}

fn default_ready_timeout() -> u64 {
    env_parse("VM_API_READY_TIMEOUT_SECS").unwrap_or(600)
}

fn default_ready_poll_initial() -> u64 {
    env_parse("VM_API_READY_POLL_INITIAL_SECS").unwrap_or(2)
}

fn default_ready_poll_max() -> u64 {
    env_parse("VM_API_READY_POLL_MAX_SECS").unwrap_or(30)
}

fn default_reconcile_on_start() -> bool {
    env_parse("VM_API_RECONCILE_ON_START").unwrap_or(true)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            settings_path: default_settings_path(),
            catalog_path: default_catalog_path(),
            default_workers: default_workers(),
            ready_timeout_secs: default_ready_timeout(),
            ready_poll_initial_secs: default_ready_poll_initial(),
            ready_poll_max_secs: default_ready_poll_max(),
            reconcile_on_start: default_reconcile_on_start(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            default_workers: self.default_workers.max(1),
            readiness: ReadinessPolicy {
                timeout: Duration::from_secs(self.ready_timeout_secs),
                initial_interval: Duration::from_secs(self.ready_poll_initial_secs.max(1)),
                max_interval: Duration::from_secs(
                    self.ready_poll_max_secs.max(self.ready_poll_initial_secs).max(1),
                ),
            },
        }
    }
}
