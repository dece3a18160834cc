//! Submission payloads and their validation.
//!
//! Validation runs before anything is persisted; a rejected submission never
//! reaches `pending_approval`.

use crate::catalog::Catalog;
use crate::error::{OrchestratorError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use utoipa::ToSchema;
use vm_gateway::{GatewayProvider, Sizing};

pub const MAX_VM_NAME_LEN: usize = 63;
pub const MAX_DEPLOYMENT_NAME_LEN: usize = 200;
pub const MAX_DEPLOYMENT_VMS: usize = 20;

pub const CPU_RANGE: std::ops::RangeInclusive<u32> = 1..=128;
pub const RAM_MB_RANGE: std::ops::RangeInclusive<u32> = 512..=524_288;
pub const DISK_GB_RANGE: std::ops::RangeInclusive<u32> = 8..=4096;

/// Named tier or explicit sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum SizeChoice {
    Tier(String),
    Custom {
        cpu_cores: u32,
        ram_mb: u32,
        disk_gb: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubmitVmRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Filled in from the authenticated identity by the API layer.
    #[serde(default)]
    pub requestor: String,
    pub workload_type: String,
    pub os_template: String,
    pub size: SizeChoice,
    pub environment: String,
    #[serde(default)]
    pub subnet_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubmitDeploymentVm {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub os_template: String,
    pub size: SizeChoice,
    #[serde(default)]
    pub subnet_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubmitDeployment {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub requestor: String,
    pub workload_type: String,
    pub environment: String,
    pub vms: Vec<SubmitDeploymentVm>,
}

/// A validated VM, ready to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVmRequest {
    pub name: String,
    pub description: Option<String>,
    pub requestor: String,
    pub workload_type: String,
    pub os_template: String,
    pub size_tier: Option<String>,
    pub sizing: Sizing,
    pub environment: String,
    pub subnet_id: Option<i64>,
}

/// A validated deployment, ready to insert together with its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeployment {
    pub name: String,
    pub description: Option<String>,
    pub requestor: String,
    pub workload_type: String,
    pub environment: String,
    pub vms: Vec<NewVmRequest>,
}

fn invalid(message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::Validation(message.into())
}

pub fn validate_vm_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_VM_NAME_LEN {
        return Err(invalid(format!(
            "VM name must be 1-{MAX_VM_NAME_LEN} characters, got {}",
            name.len()
        )));
    }
    let name_regex = Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9-]*$")
        .map_err(|e| invalid(format!("Invalid regex pattern: {}", e)))?;
    if !name_regex.is_match(name) {
        return Err(invalid(format!(
            "VM name '{name}' must start with a letter or digit and contain only letters, digits and hyphens"
        )));
    }
    Ok(())
}

/// Checks submissions against the catalog and the configured environments.
pub struct Validator<'a> {
    catalog: &'a Catalog,
    gateways: &'a dyn GatewayProvider,
}

impl<'a> Validator<'a> {
    pub fn new(catalog: &'a Catalog, gateways: &'a dyn GatewayProvider) -> Self {
        Self { catalog, gateways }
    }

    pub fn request(&self, submit: SubmitVmRequest) -> Result<NewVmRequest> {
        validate_vm_name(&submit.name)?;
        self.requestor(&submit.requestor)?;
        self.workload_type(&submit.workload_type)?;
        self.environment(&submit.environment)?;
        self.template(&submit.os_template)?;
        let (size_tier, sizing) = self.size(&submit.size)?;

        Ok(NewVmRequest {
            name: submit.name,
            description: submit.description,
            requestor: submit.requestor,
            workload_type: submit.workload_type,
            os_template: submit.os_template,
            size_tier,
            sizing,
            environment: submit.environment,
            subnet_id: submit.subnet_id,
        })
    }

    pub fn deployment(&self, submit: SubmitDeployment) -> Result<NewDeployment> {
        let name_len = submit.name.trim().chars().count();
        if name_len == 0 || name_len > MAX_DEPLOYMENT_NAME_LEN {
            return Err(invalid(format!(
                "deployment name must be 1-{MAX_DEPLOYMENT_NAME_LEN} characters"
            )));
        }
        if submit.vms.is_empty() || submit.vms.len() > MAX_DEPLOYMENT_VMS {
            return Err(invalid(format!(
                "a deployment needs 1-{MAX_DEPLOYMENT_VMS} VMs, got {}",
                submit.vms.len()
            )));
        }
        self.requestor(&submit.requestor)?;
        self.workload_type(&submit.workload_type)?;
        self.environment(&submit.environment)?;

        let mut seen = HashSet::new();
        let mut vms = Vec::with_capacity(submit.vms.len());
        for vm in submit.vms {
            validate_vm_name(&vm.name)?;
            if !seen.insert(vm.name.to_lowercase()) {
                return Err(invalid(format!(
                    "VM name '{}' appears more than once in the deployment",
                    vm.name
                )));
            }
            self.template(&vm.os_template)?;
            let (size_tier, sizing) = self.size(&vm.size)?;

            vms.push(NewVmRequest {
                name: vm.name,
                description: vm.description,
                requestor: submit.requestor.clone(),
                workload_type: submit.workload_type.clone(),
                os_template: vm.os_template,
                size_tier,
                sizing,
                environment: submit.environment.clone(),
                subnet_id: vm.subnet_id,
            });
        }

        Ok(NewDeployment {
            name: submit.name.trim().to_string(),
            description: submit.description,
            requestor: submit.requestor,
            workload_type: submit.workload_type,
            environment: submit.environment,
            vms,
        })
    }

    fn requestor(&self, requestor: &str) -> Result<()> {
        if requestor.trim().is_empty() {
            return Err(invalid("requestor is required"));
        }
        Ok(())
    }

    fn workload_type(&self, workload_type: &str) -> Result<()> {
        if !self.catalog.has_workload_type(workload_type) {
            return Err(invalid(format!("unknown workload type '{workload_type}'")));
        }
        Ok(())
    }

    fn template(&self, key: &str) -> Result<()> {
        if !self.catalog.has_template(key) {
            return Err(invalid(format!("unknown OS template '{key}'")));
        }
        Ok(())
    }

    fn environment(&self, name: &str) -> Result<()> {
        match self.gateways.environment_info(name)? {
            None => Err(invalid(format!("unknown environment '{name}'"))),
            Some(env) if !env.enabled => Err(invalid(format!("environment '{name}' is disabled"))),
            Some(_) => Ok(()),
        }
    }

    fn size(&self, choice: &SizeChoice) -> Result<(Option<String>, Sizing)> {
        match choice {
            SizeChoice::Tier(tier) => {
                let size = self
                    .catalog
                    .size(tier)
                    .ok_or_else(|| invalid(format!("unknown size tier '{tier}'")))?;
                Ok((Some(tier.clone()), size.into()))
            }
            SizeChoice::Custom {
                cpu_cores,
                ram_mb,
                disk_gb,
            } => {
                check_range("cpu_cores", *cpu_cores, &CPU_RANGE)?;
                check_range("ram_mb", *ram_mb, &RAM_MB_RANGE)?;
                check_range("disk_gb", *disk_gb, &DISK_GB_RANGE)?;
                Ok((
                    None,
                    Sizing {
                        cpu_cores: *cpu_cores,
                        ram_mb: *ram_mb,
                        disk_gb: *disk_gb,
                    },
                ))
            }
        }
    }
}

fn check_range(field: &str, value: u32, range: &std::ops::RangeInclusive<u32>) -> Result<()> {
    if !range.contains(&value) {
        return Err(invalid(format!(
            "{field} must be between {} and {}, got {value}",
            range.start(),
            range.end()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_gateway::fake::FakeGateways;

    fn gateways() -> FakeGateways {
        FakeGateways::new()
            .with_environment("pve-lab", None)
            .with_disabled_environment("pve-old")
    }

    fn request(name: &str) -> SubmitVmRequest {
        SubmitVmRequest {
            name: name.to_string(),
            description: None,
            requestor: "alice".into(),
            workload_type: "web".into(),
            os_template: "ubuntu-22.04".into(),
            size: SizeChoice::Tier("M".into()),
            environment: "pve-lab".into(),
            subnet_id: Some(7),
        }
    }

    fn vm(name: &str) -> SubmitDeploymentVm {
        SubmitDeploymentVm {
            name: name.to_string(),
            description: None,
            os_template: "ubuntu-22.04".into(),
            size: SizeChoice::Tier("S".into()),
            subnet_id: None,
        }
    }

    fn deployment(vms: Vec<SubmitDeploymentVm>) -> SubmitDeployment {
        SubmitDeployment {
            name: "web tier".into(),
            description: None,
            requestor: "alice".into(),
            workload_type: "web".into(),
            environment: "pve-lab".into(),
            vms,
        }
    }

    #[test]
    fn test_vm_names() {
        assert!(validate_vm_name("web-01").is_ok());
        assert!(validate_vm_name("9lives").is_ok());
        assert!(validate_vm_name(&"a".repeat(63)).is_ok());
        assert!(validate_vm_name(&"a".repeat(64)).is_err());
        assert!(validate_vm_name("").is_err());
        assert!(validate_vm_name("-web").is_err());
        assert!(validate_vm_name("web_01").is_err());
        assert!(validate_vm_name("web.example").is_err());
    }

    #[test]
    fn test_tier_resolves_sizing() {
        let catalog = Catalog::default();
        let gw = gateways();
        let new = Validator::new(&catalog, &gw).request(request("web-01")).unwrap();
        assert_eq!(new.size_tier.as_deref(), Some("M"));
        assert_eq!(new.sizing.cpu_cores, 4);
        assert_eq!(new.sizing.ram_mb, 4096);
    }

    #[test]
    fn test_custom_sizing_bounds() {
        let catalog = Catalog::default();
        let gw = gateways();
        let validator = Validator::new(&catalog, &gw);

        let mut req = request("db-01");
        req.size = SizeChoice::Custom {
            cpu_cores: 128,
            ram_mb: 512,
            disk_gb: 4096,
        };
        assert!(validator.request(req.clone()).is_ok());

        req.size = SizeChoice::Custom {
            cpu_cores: 0,
            ram_mb: 2048,
            disk_gb: 40,
        };
        assert!(matches!(
            validator.request(req.clone()),
            Err(OrchestratorError::Validation(_))
        ));

        req.size = SizeChoice::Custom {
            cpu_cores: 2,
            ram_mb: 2048,
            disk_gb: 5000,
        };
        assert!(validator.request(req).is_err());
    }

    #[test]
    fn test_environment_must_exist_and_be_enabled() {
        let catalog = Catalog::default();
        let gw = gateways();
        let validator = Validator::new(&catalog, &gw);

        let mut req = request("web-01");
        req.environment = "nowhere".into();
        assert!(validator.request(req.clone()).is_err());

        req.environment = "pve-old".into();
        let err = validator.request(req).unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn test_unknown_catalog_entries() {
        let catalog = Catalog::default();
        let gw = gateways();
        let validator = Validator::new(&catalog, &gw);

        let mut req = request("web-01");
        req.os_template = "plan9".into();
        assert!(validator.request(req).is_err());

        let mut req = request("web-01");
        req.workload_type = "mining".into();
        assert!(validator.request(req).is_err());

        let mut req = request("web-01");
        req.size = SizeChoice::Tier("XXL".into());
        assert!(validator.request(req).is_err());
    }

    #[test]
    fn test_deployment_limits_and_unique_names() {
        let catalog = Catalog::default();
        let gw = gateways();
        let validator = Validator::new(&catalog, &gw);

        assert!(validator.deployment(deployment(vec![])).is_err());

        let twenty_one = (0..21).map(|i| vm(&format!("node-{i}"))).collect();
        assert!(validator.deployment(deployment(twenty_one)).is_err());

        let twenty = (0..20).map(|i| vm(&format!("node-{i}"))).collect();
        let new = validator.deployment(deployment(twenty)).unwrap();
        assert_eq!(new.vms.len(), 20);
        assert!(new.vms.iter().all(|v| v.requestor == "alice" && v.environment == "pve-lab"));

        let dupes = vec![vm("web-01"), vm("WEB-01")];
        let err = validator.deployment(deployment(dupes)).unwrap_err();
        assert!(err.to_string().contains("more than once"));

        let mut blank = deployment(vec![vm("web-01")]);
        blank.name = "   ".into();
        assert!(validator.deployment(blank).is_err());
    }

    #[test]
    fn test_size_choice_accepts_tier_or_custom_json() {
        let tier: SizeChoice = serde_json::from_str(r#""L""#).unwrap();
        assert_eq!(tier, SizeChoice::Tier("L".into()));

        let custom: SizeChoice =
            serde_json::from_str(r#"{"cpu_cores":2,"ram_mb":2048,"disk_gb":40}"#).unwrap();
        assert!(matches!(custom, SizeChoice::Custom { cpu_cores: 2, .. }));
    }
}
