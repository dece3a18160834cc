//! phpIPAM address allocator (static app token).

use crate::address::AddressAllocator;
use crate::error::{GatewayError, Result};
use crate::http::{self, HttpFailure};
use crate::settings::IpamSettings;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, instrument};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

/// A 404 or a "no free" message means the subnet is exhausted; anything else
/// means phpIPAM could not be asked.
pub(crate) fn classify_allocate(subnet_id: i64, failure: HttpFailure) -> GatewayError {
    if failure.is_not_found() || failure.mentions("no free") {
        GatewayError::NoAddressAvailable(format!("subnet {subnet_id}: {}", failure.message))
    } else {
        GatewayError::AllocatorUnavailable(format!("allocate in subnet {subnet_id}: {failure}"))
    }
}

pub struct PhpIpamAllocator {
    client: Client,
    api_url: String,
    token: String,
}

impl PhpIpamAllocator {
    pub fn new(settings: &IpamSettings) -> Result<Self> {
        let client = http::build_client(Duration::from_secs(30), settings.verify_ssl)
            .map_err(|e| GatewayError::AllocatorUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            api_url: format!(
                "{}/api/{}",
                settings.url.trim_end_matches('/'),
                settings.app_id
            ),
            token: settings.token.expose().to_string(),
        })
    }
}

#[async_trait]
impl AddressAllocator for PhpIpamAllocator {
    #[instrument(skip(self))]
    async fn allocate(&self, subnet_id: i64, hostname: &str) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/addresses/first_free/{subnet_id}/", self.api_url))
            .header("token", &self.token)
            .json(&json!({
                "hostname": hostname,
                "description": format!("Provisioned VM {hostname}"),
            }))
            .send()
            .await
            .map_err(|e| classify_allocate(subnet_id, e.into()))?;

        let envelope: Envelope = http::json(resp)
            .await
            .map_err(|e| classify_allocate(subnet_id, e))?;
        if !envelope.success {
            let message = envelope.message.unwrap_or_default();
            return Err(classify_allocate(
                subnet_id,
                HttpFailure { status: None, message },
            ));
        }

        let ip = envelope.data.ok_or_else(|| {
            GatewayError::AllocatorUnavailable(format!(
                "phpIPAM returned no address for subnet {subnet_id}"
            ))
        })?;
        info!(ip = %ip, "Allocated address");
        Ok(ip)
    }

    #[instrument(skip(self))]
    async fn release(&self, subnet_id: i64, ip: &str) -> Result<()> {
        let resp = self
            .client
            .delete(format!("{}/addresses/{ip}/{subnet_id}/", self.api_url))
            .header("token", &self.token)
            .send()
            .await
            .map_err(|e| {
                GatewayError::AllocatorUnavailable(format!("release {ip}: {}", HttpFailure::from(e)))
            })?;

        match http::check(resp).await {
            Ok(_) => {
                info!("Released address");
                Ok(())
            }
            Err(failure) if failure.is_not_found() => {
                debug!("Address was not held, nothing to release");
                Ok(())
            }
            Err(failure) => Err(GatewayError::AllocatorUnavailable(format!(
                "release {ip}: {failure}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_subnet_is_no_address() {
        let err = classify_allocate(
            7,
            HttpFailure {
                status: Some(404),
                message: "No free addresses found".into(),
            },
        );
        assert_eq!(err.kind(), "NoAddressAvailable");

        let err = classify_allocate(
            7,
            HttpFailure {
                status: None,
                message: "No free addresses found".into(),
            },
        );
        assert_eq!(err.kind(), "NoAddressAvailable");
    }

    #[test]
    fn test_other_failures_are_allocator_unavailable() {
        let err = classify_allocate(
            7,
            HttpFailure {
                status: Some(500),
                message: "database locked".into(),
            },
        );
        assert_eq!(err.kind(), "AllocatorUnavailable");
    }
}
