//! Gateway resolution from a settings file on disk.

use std::fs;
use vm_gateway::{EnvironmentKind, GatewayProvider, SettingsGateways, YamlSettingsFile};

const LAB: &str = r#"
environments:
  - name: pve-lab
    display_name: Lab cluster
    kind: proxmox
    max_concurrent: 2
    proxmox: { host: pve.lab, user: root@pam, token_name: prov, token_value: secret }
"#;

#[test]
fn test_missing_file_means_nothing_configured() {
    let dir = tempfile::tempdir().unwrap();
    let gateways = SettingsGateways::new(YamlSettingsFile::new(dir.path().join("absent.yaml")));

    assert!(gateways.environments().unwrap().is_empty());
    assert!(gateways.ticketing().unwrap().is_none());
    assert!(gateways.allocator().unwrap().is_none());
    assert!(gateways.environment("pve-lab").is_err());
}

#[test]
fn test_edits_apply_on_next_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    fs::write(&path, LAB).unwrap();
    let gateways = SettingsGateways::new(YamlSettingsFile::new(&path));

    let info = gateways.environment_info("pve-lab").unwrap().unwrap();
    assert_eq!(info.kind, EnvironmentKind::Proxmox);
    assert_eq!(info.max_concurrent, Some(2));
    assert_eq!(info.display_name.as_deref(), Some("Lab cluster"));
    assert!(gateways.environment("pve-lab").is_ok());

    fs::write(&path, LAB.replace("max_concurrent: 2", "enabled: false")).unwrap();

    let info = gateways.environment_info("pve-lab").unwrap().unwrap();
    assert!(!info.enabled);
    assert_eq!(info.max_concurrent, None);
    let err = gateways.environment("pve-lab").err().unwrap();
    assert_eq!(err.kind(), "EnvironmentUnavailable");
}

#[test]
fn test_malformed_file_is_a_settings_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    fs::write(&path, "environments: [ { name: 3 ").unwrap();
    let gateways = SettingsGateways::new(YamlSettingsFile::new(&path));

    let err = gateways.environments().unwrap_err();
    assert_eq!(err.kind(), "Settings");
}
