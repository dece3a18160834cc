//! Size tiers, OS templates and workload types offered to requesters.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;
use utoipa::ToSchema;
use vm_gateway::{Sizing, TemplateRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SizeTier {
    pub cpu_cores: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
}

impl From<SizeTier> for Sizing {
    fn from(tier: SizeTier) -> Self {
        Sizing {
            cpu_cores: tier.cpu_cores,
            ram_mb: tier.ram_mb,
            disk_gb: tier.disk_gb,
        }
    }
}

/// An OS template and where it lives in each environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateEntry {
    pub display_name: String,

    /// Template used when the environment has no override.
    #[serde(flatten)]
    pub default: TemplateRef,

    /// Per-environment template references, keyed by environment name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environments: BTreeMap<String, TemplateRef>,
}

impl TemplateEntry {
    fn linux(display_name: &str, id: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            default: TemplateRef {
                id: id.to_string(),
                source_host: None,
                cloud_init: true,
            },
            environments: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default = "default_sizes")]
    pub sizes: BTreeMap<String, SizeTier>,

    #[serde(default = "default_templates")]
    pub templates: BTreeMap<String, TemplateEntry>,

    #[serde(default = "default_workload_types")]
    pub workload_types: Vec<String>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            sizes: default_sizes(),
            templates: default_templates(),
            workload_types: default_workload_types(),
        }
    }
}

impl Catalog {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    /// Load a catalog file; sections missing from the file keep their
    /// built-in defaults.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading catalog");
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn size(&self, tier: &str) -> Option<SizeTier> {
        self.sizes.get(tier).copied()
    }

    pub fn has_template(&self, key: &str) -> bool {
        self.templates.contains_key(key)
    }

    /// Template reference for `key` in `environment`.
    pub fn template_for(&self, key: &str, environment: &str) -> Option<TemplateRef> {
        let entry = self.templates.get(key)?;
        Some(
            entry
                .environments
                .get(environment)
                .cloned()
                .unwrap_or_else(|| entry.default.clone()),
        )
    }

    pub fn has_workload_type(&self, workload_type: &str) -> bool {
        self.workload_types.iter().any(|w| w == workload_type)
    }
}

fn default_sizes() -> BTreeMap<String, SizeTier> {
    [
        ("XS", 1, 1024, 20),
        ("S", 2, 2048, 40),
        ("M", 4, 4096, 80),
        ("L", 8, 8192, 160),
        ("XL", 16, 16384, 320),
    ]
    .into_iter()
    .map(|(name, cpu_cores, ram_mb, disk_gb)| {
        (
            name.to_string(),
            SizeTier {
                cpu_cores,
                ram_mb,
                disk_gb,
            },
        )
    })
    .collect()
}

fn default_templates() -> BTreeMap<String, TemplateEntry> {
    let mut templates = BTreeMap::new();
    templates.insert(
        "ubuntu-22.04".to_string(),
        TemplateEntry::linux("Ubuntu 22.04 LTS", "9000"),
    );
    templates.insert(
        "ubuntu-24.04".to_string(),
        TemplateEntry::linux("Ubuntu 24.04 LTS", "9001"),
    );
    templates.insert(
        "rocky-9".to_string(),
        TemplateEntry::linux("Rocky Linux 9", "9002"),
    );
    templates.insert(
        "debian-12".to_string(),
        TemplateEntry::linux("Debian 12", "9003"),
    );
    templates.insert(
        "windows-2022".to_string(),
        TemplateEntry {
            display_name: "Windows Server 2022".to_string(),
            default: TemplateRef {
                id: "9100".to_string(),
                source_host: None,
                cloud_init: false,
            },
            environments: BTreeMap::new(),
        },
    );
    templates
}

fn default_workload_types() -> Vec<String> {
    ["web", "database", "application", "cache", "worker", "monitoring", "other"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tiers() {
        let catalog = Catalog::default();
        assert_eq!(
            catalog.size("M"),
            Some(SizeTier {
                cpu_cores: 4,
                ram_mb: 4096,
                disk_gb: 80
            })
        );
        assert_eq!(catalog.size("XL").unwrap().disk_gb, 320);
        assert!(catalog.size("XXL").is_none());
    }

    #[test]
    fn test_environment_override_wins() {
        let catalog = Catalog::from_yaml_str(
            r#"
templates:
  ubuntu-22.04:
    display_name: Ubuntu 22.04
    id: "9000"
    cloud_init: true
    environments:
      vc-prod:
        id: tpl-ubuntu-2204
        cloud_init: true
"#,
        )
        .unwrap();

        assert_eq!(catalog.template_for("ubuntu-22.04", "pve-lab").unwrap().id, "9000");
        assert_eq!(
            catalog.template_for("ubuntu-22.04", "vc-prod").unwrap().id,
            "tpl-ubuntu-2204"
        );
        assert!(catalog.template_for("rocky-9", "pve-lab").is_none());
    }

    #[test]
    fn test_missing_sections_keep_defaults() {
        let catalog = Catalog::from_yaml_str("workload_types: [web]\n").unwrap();
        assert_eq!(catalog.sizes.len(), 5);
        assert!(catalog.has_template("debian-12"));
        assert!(catalog.has_workload_type("web"));
        assert!(!catalog.has_workload_type("database"));
    }
}
