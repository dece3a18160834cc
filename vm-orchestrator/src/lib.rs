//! VM provisioning orchestration
//!
//! This crate contains the lifecycle of VM requests and multi-VM deployments:
//! submission and validation, approval, the provisioning pipeline that drives
//! the environment, ticketing and address gateways, the deployment
//! coordinator and the per-environment scheduler. It is consumed by the
//! vm-api HTTP service through [`ProvisioningService`].

pub mod catalog;
pub mod coordinator;
pub mod db;
pub mod deployment;
pub mod error;
pub mod pipeline;
pub mod request;
pub mod run;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod submit;
pub mod ticket;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use catalog::{Catalog, SizeTier, TemplateEntry};
pub use deployment::{derive_status, ChildTally, Deployment, DeploymentDetail, DeploymentStatus};
pub use error::{OrchestratorError, Result};
pub use pipeline::{PipelineOutcome, ReadinessPolicy};
pub use request::{FailureKind, RequestStatus, StepFailure, VmRequest};
pub use run::{Run, RunStatus, RunSubject, RunTrigger};
pub use scheduler::{Scheduler, WorkKey};
pub use service::{Page, ProvisioningService, ReconcileReport, ServiceConfig};
pub use store::{DeploymentFilters, RequestFilters, Store};
pub use submit::{SizeChoice, SubmitDeployment, SubmitDeploymentVm, SubmitVmRequest};
