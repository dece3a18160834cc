//! Common test utilities and helpers for vm-api tests

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    Router,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot`
use vm_api::{create_app, AppState};
use vm_gateway::fake::FakeGateways;
use vm_orchestrator::test_utils::{test_gateways, test_service};
use vm_orchestrator::ProvisioningService;

pub const USER: &str = "alice";

/// App wired to fake gateways with one environment, `pve-lab`.
pub struct TestApp {
    pub router: Router,
    pub service: ProvisioningService,
    pub gateways: Arc<FakeGateways>,
}

impl TestApp {
    pub async fn new() -> Self {
        let gateways = test_gateways(None);
        let service = test_service(gateways.clone()).await;
        let router = create_app(AppState::new(service.clone()));
        Self {
            router,
            service,
            gateways,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .uri(uri)
            .header("x-user", USER)
            .body(Body::empty())
            .unwrap();
        split(self.send(request).await).await
    }

    pub async fn post(&self, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-user", USER);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).unwrap())
            }
            None => Body::empty(),
        };
        split(self.send(builder.body(body).unwrap()).await).await
    }
}

/// Status and JSON body of a response. Non-JSON bodies become `Value::Null`.
pub async fn split(response: Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

pub fn parse<T: DeserializeOwned>(value: Value) -> T {
    serde_json::from_value(value).expect("Failed to parse response body")
}

pub fn vm_body(name: &str) -> Value {
    serde_json::json!({
        "name": name,
        "workload_type": "web",
        "os_template": "ubuntu-22.04",
        "size": "M",
        "environment": "pve-lab"
    })
}

pub fn deployment_body(name: &str, vms: &[&str]) -> Value {
    let vms: Vec<Value> = vms
        .iter()
        .map(|vm| {
            serde_json::json!({
                "name": vm,
                "os_template": "ubuntu-22.04",
                "size": { "cpu_cores": 2, "ram_mb": 4096, "disk_gb": 50 }
            })
        })
        .collect();
    serde_json::json!({
        "name": name,
        "workload_type": "web",
        "environment": "pve-lab",
        "vms": vms
    })
}
