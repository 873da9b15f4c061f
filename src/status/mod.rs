//! Build status sink. Delivery is fire-and-forget, at-least-once: a dead
//! endpoint never slows a build down, let alone fails one.

use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageStatus {
    Building,
    Published,
    Failed,
}

pub trait StatusSink: Send + Sync {
    fn update_status(&self, name: &str, status: PackageStatus, error_details: Option<&str>);
}

/// Sink used when no endpoint is configured.
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn update_status(&self, name: &str, status: PackageStatus, _error_details: Option<&str>) {
        debug!("status: {} -> {:?}", name, status);
    }
}

#[derive(Serialize)]
struct StatusUpdate<'a> {
    package: &'a str,
    status: PackageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<&'a str>,
}

pub struct HttpStatusSink {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpStatusSink {
    pub fn new(endpoint: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { endpoint: endpoint.into(), client }
    }
}

impl StatusSink for HttpStatusSink {
    fn update_status(&self, name: &str, status: PackageStatus, error_details: Option<&str>) {
        let update = StatusUpdate { package: name, status, error_details };
        match self.client.post(&self.endpoint).json(&update).send() {
            Ok(response) if !response.status().is_success() => {
                warn!("status sink returned {} for {}", response.status(), name);
            }
            Ok(_) => debug!("status: {} -> {:?}", name, status),
            Err(e) => warn!("status sink unreachable: {}", e),
        }
    }
}
