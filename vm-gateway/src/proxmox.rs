//! Proxmox VE environment gateway (REST `api2/json`, API-token auth).

use crate::environment::{CloneSpec, EnvironmentGateway, EnvironmentKind, VmHandle};
use crate::error::{GatewayError, Result};
use crate::http::{self, HttpFailure};
use crate::settings::ProxmoxCredentials;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const CLONE_TASK_TIMEOUT: Duration = Duration::from_secs(600);
const START_TASK_TIMEOUT: Duration = Duration::from_secs(120);
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(5);
const BOOT_DISK_KEYS: [&str; 3] = ["scsi0", "virtio0", "ide0"];

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct NodeInfo {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub mem: Option<u64>,
    #[serde(default)]
    pub maxmem: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

/// Pick the online node with the lowest memory usage ratio.
pub(crate) fn select_node(nodes: &[NodeInfo]) -> Option<String> {
    nodes
        .iter()
        .filter(|n| n.status.as_deref() == Some("online"))
        .min_by(|a, b| usage(a).total_cmp(&usage(b)))
        .map(|n| n.node.clone())
}

fn usage(node: &NodeInfo) -> f64 {
    let used = node.mem.unwrap_or(0) as f64;
    let total = node.maxmem.unwrap_or(1).max(1) as f64;
    used / total
}

/// First non-loopback IPv4 address in a guest-agent interface listing.
pub(crate) fn first_guest_ipv4(payload: &Value) -> Option<String> {
    payload
        .get("result")?
        .as_array()?
        .iter()
        .filter(|iface| iface.get("name").and_then(Value::as_str) != Some("lo"))
        .filter_map(|iface| iface.get("ip-addresses").and_then(Value::as_array))
        .flatten()
        .filter(|addr| addr.get("ip-address-type").and_then(Value::as_str) == Some("ipv4"))
        .filter_map(|addr| addr.get("ip-address").and_then(Value::as_str))
        .find(|ip| !ip.starts_with("127."))
        .map(str::to_string)
}

fn classify(context: &str, failure: HttpFailure) -> GatewayError {
    GatewayError::EnvironmentUnavailable(format!("{context}: {failure}"))
}

/// Like [`classify`], but a missing source VM means the template is gone.
fn classify_clone(template: &str, failure: HttpFailure) -> GatewayError {
    if failure.mentions("does not exist") || failure.is_not_found() {
        GatewayError::TemplateNotFound(format!("template {template}: {failure}"))
    } else {
        classify(&format!("clone template {template}"), failure)
    }
}

pub struct ProxmoxGateway {
    client: Client,
    base_url: String,
    auth_header: String,
}

impl ProxmoxGateway {
    pub fn new(creds: &ProxmoxCredentials) -> Result<Self> {
        let client = http::build_client(Duration::from_secs(120), creds.verify_ssl)
            .map_err(|e| GatewayError::EnvironmentUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: format!("https://{}:{}/api2/json", creds.host, creds.port),
            auth_header: format!(
                "PVEAPIToken={}!{}={}",
                creds.user,
                creds.token_name,
                creds.token_value.expose()
            ),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> std::result::Result<T, HttpFailure> {
        let resp = self
            .client
            .get(self.url(path))
            .header("Authorization", &self.auth_header)
            .send()
            .await?;
        let envelope: Envelope<T> = http::json(resp).await?;
        Ok(envelope.data)
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> std::result::Result<Value, HttpFailure> {
        let resp = self
            .client
            .post(self.url(path))
            .header("Authorization", &self.auth_header)
            .form(form)
            .send()
            .await?;
        let envelope: Envelope<Value> = http::json(resp).await?;
        Ok(envelope.data)
    }

    async fn put_form(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> std::result::Result<(), HttpFailure> {
        let resp = self
            .client
            .put(self.url(path))
            .header("Authorization", &self.auth_header)
            .form(form)
            .send()
            .await?;
        http::check(resp).await?;
        Ok(())
    }

    async fn next_vmid(&self) -> Result<u64> {
        let raw: Value = self
            .get("/cluster/nextid")
            .await
            .map_err(|e| classify("next VMID", e))?;
        match &raw {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
        .ok_or_else(|| {
            GatewayError::EnvironmentUnavailable(format!("unexpected nextid payload: {raw}"))
        })
    }

    async fn wait_for_task(&self, node: &str, upid: &str, timeout: Duration) -> Result<()> {
        let path = format!("/nodes/{node}/tasks/{}/status", urlencode(upid));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let status: TaskStatus = self
                .get(&path)
                .await
                .map_err(|e| classify("task status", e))?;

            if status.status == "stopped" {
                return match status.exitstatus.as_deref() {
                    Some("OK") => Ok(()),
                    other => Err(GatewayError::EnvironmentUnavailable(format!(
                        "task {upid} failed: {}",
                        other.unwrap_or("unknown exit status")
                    ))),
                };
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::EnvironmentUnavailable(format!(
                    "task {upid} did not complete within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    /// Resize, configure and start a freshly cloned VM.
    async fn finish_build(&self, vm: &VmHandle, spec: &CloneSpec) -> Result<()> {
        let qemu = format!("/nodes/{}/qemu/{}", vm.host, vm.vm_id);

        self.put_form(
            &format!("{qemu}/config"),
            &[
                ("cores", spec.sizing.cpu_cores.to_string()),
                ("memory", spec.sizing.ram_mb.to_string()),
            ],
        )
        .await
        .map_err(|e| classify("apply sizing", e))?;

        let config: Value = self
            .get(&format!("{qemu}/config"))
            .await
            .map_err(|e| classify("read config", e))?;
        if let Some(disk) = BOOT_DISK_KEYS.iter().find(|k| config.get(**k).is_some()) {
            self.put_form(
                &format!("{qemu}/resize"),
                &[("disk", disk.to_string()), ("size", format!("{}G", spec.sizing.disk_gb))],
            )
            .await
            .map_err(|e| classify("resize disk", e))?;
        } else {
            warn!(vmid = %vm.vm_id, "No boot disk found, skipping disk resize");
        }

        if let (true, Some(ci)) = (spec.template.cloud_init, &spec.cloud_init) {
            let mut ipconfig = format!("ip={}", ci.cidr());
            if let Some(gw) = &ci.gateway {
                ipconfig.push_str(&format!(",gw={gw}"));
            }
            self.put_form(&format!("{qemu}/config"), &[("ipconfig0", ipconfig)])
                .await
                .map_err(|e| classify("configure cloud-init", e))?;
        }

        let upid = self
            .post_form(&format!("{qemu}/status/start"), &[])
            .await
            .map_err(|e| classify("start VM", e))?;
        if let Some(upid) = upid.as_str() {
            self.wait_for_task(&vm.host, upid, START_TASK_TIMEOUT).await?;
        }
        Ok(())
    }
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[async_trait]
impl EnvironmentGateway for ProxmoxGateway {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Proxmox
    }

    #[instrument(skip_all, fields(vm_name = %spec.name, template = %spec.template.id))]
    async fn clone_template(&self, spec: &CloneSpec) -> Result<VmHandle> {
        let nodes: Vec<NodeInfo> = self
            .get("/nodes")
            .await
            .map_err(|e| classify("list nodes", e))?;
        let target = select_node(&nodes).ok_or_else(|| {
            GatewayError::EnvironmentUnavailable("no online Proxmox nodes".to_string())
        })?;
        let source = spec.template.source_host.clone().unwrap_or_else(|| target.clone());

        let vmid = self.next_vmid().await?;
        info!(vmid, node = %target, "Cloning template");

        let mut form = vec![
            ("newid", vmid.to_string()),
            ("name", spec.name.clone()),
            ("full", "1".to_string()),
        ];
        if target != source {
            form.push(("target", target.clone()));
        }
        let upid = self
            .post_form(&format!("/nodes/{source}/qemu/{}/clone", spec.template.id), &form)
            .await
            .map_err(|e| classify_clone(&spec.template.id, e))?;
        let upid = upid.as_str().ok_or_else(|| {
            GatewayError::EnvironmentUnavailable(format!("clone returned no task id: {upid}"))
        })?;
        self.wait_for_task(&source, upid, CLONE_TASK_TIMEOUT).await?;

        let vm = VmHandle {
            vm_id: vmid.to_string(),
            host: target,
        };

        if let Err(err) = self.finish_build(&vm, spec).await {
            warn!(vmid = %vm.vm_id, error = %err, "Build failed after clone, removing partial VM");
            if let Err(cleanup) = self.delete_vm(&vm).await {
                warn!(vmid = %vm.vm_id, error = %cleanup, "Failed to remove partial VM");
            }
            return Err(err);
        }

        Ok(vm)
    }

    async fn is_ready(&self, vm: &VmHandle) -> Result<bool> {
        let status: Value = self
            .get(&format!("/nodes/{}/qemu/{}/status/current", vm.host, vm.vm_id))
            .await
            .map_err(|e| classify("VM status", e))?;
        Ok(status.get("status").and_then(Value::as_str) == Some("running"))
    }

    async fn get_address(&self, vm: &VmHandle) -> Result<Option<String>> {
        let path = format!(
            "/nodes/{}/qemu/{}/agent/network-get-interfaces",
            vm.host, vm.vm_id
        );
        match self.get::<Value>(&path).await {
            Ok(payload) => Ok(first_guest_ipv4(&payload)),
            Err(failure) => {
                // The guest agent is optional; a VM without it simply has no reported address.
                debug!(vmid = %vm.vm_id, error = %failure, "Guest agent did not report interfaces");
                Ok(None)
            }
        }
    }

    async fn delete_vm(&self, vm: &VmHandle) -> Result<()> {
        let qemu = format!("/nodes/{}/qemu/{}", vm.host, vm.vm_id);
        if let Ok(upid) = self.post_form(&format!("{qemu}/status/stop"), &[]).await {
            if let Some(upid) = upid.as_str() {
                self.wait_for_task(&vm.host, upid, START_TASK_TIMEOUT).await.ok();
            }
        }

        let resp = self
            .client
            .delete(self.url(&format!("{qemu}?purge=1&destroy-unreferenced-disks=1")))
            .header("Authorization", &self.auth_header)
            .send()
            .await
            .map_err(|e| classify("delete VM", e.into()))?;
        http::check(resp).await.map_err(|e| classify("delete VM", e))?;
        info!(vmid = %vm.vm_id, node = %vm.host, "Deleted VM");
        Ok(())
    }
}
