//! Gateways to the external systems a VM build touches.
//!
//! Three families sit behind async traits: hypervisor environments
//! ([`EnvironmentGateway`], implemented for Proxmox VE and vSphere), ticketing
//! ([`TicketingGateway`], Jira Cloud) and address allocation
//! ([`AddressAllocator`], phpIPAM). [`GatewayProvider`] resolves them from
//! read-only settings.

pub mod address;
pub mod environment;
pub mod error;
mod http;
pub mod jira;
pub mod phpipam;
pub mod proxmox;
pub mod registry;
pub mod settings;
pub mod ticketing;
pub mod vsphere;

#[cfg(any(test, feature = "test-helpers"))]
pub mod fake;

pub use address::AddressAllocator;
pub use environment::{
    CloneSpec, CloudInit, EnvironmentGateway, EnvironmentKind, Sizing, TemplateRef, VmHandle,
};
pub use error::{GatewayError, Result};
pub use registry::{EnvironmentInfo, GatewayProvider, SettingsGateways};
pub use settings::{
    EnvironmentSettings, GatewaySettings, Secret, SettingsSource, StaticSettings, YamlSettingsFile,
};
pub use ticketing::{SubjectKind, TicketDecision, TicketRef, TicketRequest, TicketingGateway};
