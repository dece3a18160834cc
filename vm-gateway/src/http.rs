//! Shared reqwest plumbing for the HTTP gateways.

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;

/// A failed HTTP exchange, before it is classified into a
/// [`GatewayError`](crate::GatewayError) by the owning gateway.
#[derive(Debug, Clone)]
pub(crate) struct HttpFailure {
    pub status: Option<u16>,
    pub message: String,
}

impl HttpFailure {
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    pub fn mentions(&self, needle: &str) -> bool {
        self.message.to_lowercase().contains(needle)
    }
}

impl fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<reqwest::Error> for HttpFailure {
    fn from(err: reqwest::Error) -> Self {
        Self {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

pub(crate) fn build_client(
    timeout: Duration,
    verify_ssl: bool,
) -> std::result::Result<Client, HttpFailure> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("vm-provisioner/", env!("CARGO_PKG_VERSION")))
        .danger_accept_invalid_certs(!verify_ssl)
        .build()
        .map_err(HttpFailure::from)
}

/// Turn a non-2xx response into an [`HttpFailure`] carrying the body text.
pub(crate) async fn check(resp: Response) -> std::result::Result<Response, HttpFailure> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(HttpFailure {
        status: Some(status.as_u16()),
        message: truncate(&body, 500),
    })
}

pub(crate) async fn json<T: DeserializeOwned>(
    resp: Response,
) -> std::result::Result<T, HttpFailure> {
    let resp = check(resp).await?;
    resp.json::<T>().await.map_err(HttpFailure::from)
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
