//! Fixtures shared by unit and integration tests.

use crate::catalog::Catalog;
use crate::pipeline::ReadinessPolicy;
use crate::service::{ProvisioningService, ServiceConfig};
use crate::submit::{SizeChoice, SubmitDeployment, SubmitDeploymentVm, SubmitVmRequest};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use vm_gateway::fake::FakeGateways;

pub const TEST_ENV: &str = "pve-lab";

/// Helper to create an in-memory test database with migrations applied
///
/// The pool keeps exactly one connection alive; every new connection to
/// `sqlite::memory:` would otherwise see an empty database.
pub async fn create_test_db() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("Failed to parse database URL")
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Short readiness bounds so timeout scenarios finish quickly.
pub fn fast_readiness() -> ReadinessPolicy {
    ReadinessPolicy {
        timeout: Duration::from_millis(150),
        initial_interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(20),
    }
}

/// Fake gateways with one enabled environment, [`TEST_ENV`].
pub fn test_gateways(max_concurrent: Option<usize>) -> Arc<FakeGateways> {
    Arc::new(FakeGateways::new().with_environment(TEST_ENV, max_concurrent))
}

pub async fn test_service(gateways: Arc<FakeGateways>) -> ProvisioningService {
    let pool = create_test_db().await;
    ProvisioningService::new(
        pool,
        Catalog::default(),
        gateways,
        ServiceConfig {
            default_workers: 4,
            readiness: fast_readiness(),
        },
    )
}

pub fn vm_request(name: &str) -> SubmitVmRequest {
    SubmitVmRequest {
        name: name.to_string(),
        description: None,
        requestor: "alice".to_string(),
        workload_type: "web".to_string(),
        os_template: "ubuntu-22.04".to_string(),
        size: SizeChoice::Tier("M".to_string()),
        environment: TEST_ENV.to_string(),
        subnet_id: None,
    }
}

pub fn deployment(name: &str, vm_names: &[&str]) -> SubmitDeployment {
    SubmitDeployment {
        name: name.to_string(),
        description: None,
        requestor: "alice".to_string(),
        workload_type: "web".to_string(),
        environment: TEST_ENV.to_string(),
        vms: vm_names
            .iter()
            .map(|vm| SubmitDeploymentVm {
                name: vm.to_string(),
                description: None,
                os_template: "ubuntu-22.04".to_string(),
                size: SizeChoice::Tier("S".to_string()),
                subnet_id: None,
            })
            .collect(),
    }
}
