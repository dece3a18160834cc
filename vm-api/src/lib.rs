//! HTTP service for VM requests and multi-VM deployments.
//!
//! Routes are thin wrappers over [`vm_orchestrator::ProvisioningService`];
//! provisioning runs in the background and clients poll the read endpoints.

pub mod api_docs;
pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_app;
pub use state::AppState;
