//! vSphere environment gateway (vCenter REST `api`, session auth).

use crate::environment::{CloneSpec, EnvironmentGateway, EnvironmentKind, VmHandle};
use crate::error::{GatewayError, Result};
use crate::http::{self, HttpFailure};
use crate::settings::VsphereCredentials;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const SESSION_HEADER: &str = "vmware-api-session-id";

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
}

#[derive(Debug, Deserialize)]
struct HostSummary {
    host: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClusterSummary {
    cluster: String,
}

fn unavailable(context: &str, failure: HttpFailure) -> GatewayError {
    GatewayError::EnvironmentUnavailable(format!("{context}: {failure}"))
}

/// Guest customisation payload for a static IPv4 address.
pub(crate) fn customization_spec(hostname: &str, ip: &str, prefix: u8, gateway: Option<&str>) -> Value {
    let mut ipv4 = json!({
        "type": "STATIC",
        "ip_address": ip,
        "prefix": prefix,
    });
    if let Some(gw) = gateway {
        ipv4["gateways"] = json!([gw]);
    }

    json!({
        "spec": {
            "configuration_spec": {
                "linux_config": {
                    "hostname": { "type": "FIXED", "fixed_name": hostname },
                    "domain": "localdomain"
                }
            },
            "interfaces": [ { "adapter": { "ipv4": ipv4 } } ],
            "global_DNS_settings": {}
        }
    })
}

pub struct VsphereGateway {
    client: Client,
    base_url: String,
    user: String,
    password: String,
    cluster: Option<String>,
    session: Mutex<Option<String>>,
}

impl VsphereGateway {
    pub fn new(creds: &VsphereCredentials) -> Result<Self> {
        let client = http::build_client(Duration::from_secs(120), creds.verify_ssl)
            .map_err(|e| GatewayError::EnvironmentUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: format!("https://{}:{}/api", creds.host, creds.port),
            user: creds.user.clone(),
            password: creds.password.expose().to_string(),
            cluster: creds.cluster.clone(),
            session: Mutex::new(None),
        })
    }

    async fn session_token(&self) -> Result<String> {
        let mut guard = self.session.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }

        let resp = self
            .client
            .post(format!("{}/session", self.base_url))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| unavailable("create session", e.into()))?;
        let token: String = http::json(resp)
            .await
            .map_err(|e| unavailable("create session", e))?;
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self.session_token().await?;
        Ok(self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header(SESSION_HEADER, token))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> std::result::Result<T, GatewayFailure> {
        let resp = self.request(Method::GET, path).await?.send().await?;
        Ok(http::json(resp).await?)
    }

    async fn send(&self, builder: RequestBuilder) -> std::result::Result<reqwest::Response, GatewayFailure> {
        let resp = builder.send().await?;
        Ok(http::check(resp).await?)
    }

    async fn find_template(&self, name: &str) -> Result<String> {
        let path = format!("/vcenter/vm?names={}", encode(name));
        let vms: Vec<VmSummary> = self
            .get(&path)
            .await
            .map_err(|e| e.into_gateway("lookup template"))?;
        vms.into_iter()
            .next()
            .map(|v| v.vm)
            .ok_or_else(|| GatewayError::TemplateNotFound(format!("no vSphere VM named {name}")))
    }

    async fn pick_host(&self) -> Result<HostSummary> {
        let mut path = "/vcenter/host?connection_states=CONNECTED".to_string();
        if let Some(cluster) = &self.cluster {
            let clusters: Vec<ClusterSummary> = self
                .get(&format!("/vcenter/cluster?names={}", encode(cluster)))
                .await
                .map_err(|e| e.into_gateway("lookup cluster"))?;
            let cluster = clusters.into_iter().next().ok_or_else(|| {
                GatewayError::EnvironmentUnavailable(format!("cluster {cluster} not found"))
            })?;
            path.push_str(&format!("&clusters={}", cluster.cluster));
        }

        let hosts: Vec<HostSummary> = self
            .get(&path)
            .await
            .map_err(|e| e.into_gateway("list hosts"))?;
        hosts.into_iter().next().ok_or_else(|| {
            GatewayError::EnvironmentUnavailable("no connected ESXi hosts".to_string())
        })
    }

    async fn finish_build(&self, vm_id: &str, spec: &CloneSpec) -> Result<()> {
        if let (true, Some(ci)) = (spec.template.cloud_init, &spec.cloud_init) {
            let body = customization_spec(
                &spec.name,
                ci.ip_address.split('/').next().unwrap_or(&ci.ip_address),
                ci.prefix_len,
                ci.gateway.as_deref(),
            );
            let builder = self
                .request(Method::PUT, &format!("/vcenter/vm/{vm_id}/guest/customization"))
                .await?
                .json(&body);
            self.send(builder)
                .await
                .map_err(|e| e.into_gateway("guest customization"))?;
        }

        let builder = self
            .request(Method::POST, &format!("/vcenter/vm/{vm_id}/power?action=start"))
            .await?;
        self.send(builder)
            .await
            .map_err(|e| e.into_gateway("power on"))?;
        Ok(())
    }
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Either an already-classified error (session setup) or a raw HTTP failure.
enum GatewayFailure {
    Gateway(GatewayError),
    Http(HttpFailure),
}

impl GatewayFailure {
    fn into_gateway(self, context: &str) -> GatewayError {
        match self {
            Self::Gateway(err) => err,
            Self::Http(failure) => unavailable(context, failure),
        }
    }
}

impl From<GatewayError> for GatewayFailure {
    fn from(err: GatewayError) -> Self {
        Self::Gateway(err)
    }
}

impl From<HttpFailure> for GatewayFailure {
    fn from(failure: HttpFailure) -> Self {
        Self::Http(failure)
    }
}

impl From<reqwest::Error> for GatewayFailure {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.into())
    }
}

#[async_trait]
impl EnvironmentGateway for VsphereGateway {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Vsphere
    }

    #[instrument(skip_all, fields(vm_name = %spec.name, template = %spec.template.id))]
    async fn clone_template(&self, spec: &CloneSpec) -> Result<VmHandle> {
        let source = self.find_template(&spec.template.id).await?;
        let host = self.pick_host().await?;

        let body = json!({
            "source": source,
            "name": spec.name,
            "placement": { "host": host.host },
            "power_on": false,
            "hardware_customization": {
                "cpu_update": { "num_cpus": spec.sizing.cpu_cores },
                "memory_update": { "memory": spec.sizing.ram_mb }
            }
        });
        let builder = self
            .request(Method::POST, "/vcenter/vm?action=clone")
            .await?
            .json(&body);
        let resp = self
            .send(builder)
            .await
            .map_err(|e| e.into_gateway("clone"))?;
        let vm_id: String = resp
            .json()
            .await
            .map_err(|e| unavailable("clone", e.into()))?;
        // Disk capacity follows the template; the REST API cannot grow it on clone.
        debug!(vm_id = %vm_id, disk_gb = spec.sizing.disk_gb, "Disk size left at template default");

        let vm = VmHandle {
            vm_id,
            host: host.name.unwrap_or(host.host),
        };
        info!(vm_id = %vm.vm_id, host = %vm.host, "Cloned vSphere template");

        if let Err(err) = self.finish_build(&vm.vm_id, spec).await {
            warn!(vm_id = %vm.vm_id, error = %err, "Build failed after clone, removing partial VM");
            if let Err(cleanup) = self.delete_vm(&vm).await {
                warn!(vm_id = %vm.vm_id, error = %cleanup, "Failed to remove partial VM");
            }
            return Err(err);
        }
        Ok(vm)
    }

    async fn is_ready(&self, vm: &VmHandle) -> Result<bool> {
        let power: Value = self
            .get(&format!("/vcenter/vm/{}/power", vm.vm_id))
            .await
            .map_err(|e| e.into_gateway("power state"))?;
        if power.get("state").and_then(Value::as_str) != Some("POWERED_ON") {
            return Ok(false);
        }

        let tools: Value = self
            .get(&format!("/vcenter/vm/{}/tools", vm.vm_id))
            .await
            .map_err(|e| e.into_gateway("tools state"))?;
        Ok(tools.get("run_state").and_then(Value::as_str) == Some("RUNNING"))
    }

    async fn get_address(&self, vm: &VmHandle) -> Result<Option<String>> {
        match self
            .get::<Value>(&format!("/vcenter/vm/{}/guest/identity", vm.vm_id))
            .await
        {
            Ok(identity) => Ok(identity
                .get("ip_address")
                .and_then(Value::as_str)
                .map(str::to_string)),
            Err(GatewayFailure::Http(failure)) => {
                debug!(vm_id = %vm.vm_id, error = %failure, "Guest identity unavailable");
                Ok(None)
            }
            Err(GatewayFailure::Gateway(err)) => Err(err),
        }
    }

    async fn delete_vm(&self, vm: &VmHandle) -> Result<()> {
        let stop = self
            .request(Method::POST, &format!("/vcenter/vm/{}/power?action=stop", vm.vm_id))
            .await?;
        if let Err(GatewayFailure::Http(failure)) = self.send(stop).await {
            debug!(vm_id = %vm.vm_id, error = %failure, "Power off before delete failed");
        }

        let delete = self
            .request(Method::DELETE, &format!("/vcenter/vm/{}", vm.vm_id))
            .await?;
        self.send(delete)
            .await
            .map_err(|e| e.into_gateway("delete VM"))?;
        info!(vm_id = %vm.vm_id, "Deleted vSphere VM");
        Ok(())
    }
}
