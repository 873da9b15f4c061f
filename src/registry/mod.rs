//! Package registry lookups. A single HTTP GET by package name decides
//! whether a package is already published and at which version.

use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{PackwrightError, Result};

/// What the registry knows about a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryVerdict {
    pub published: bool,
    pub version: Option<String>,
}

impl RegistryVerdict {
    pub fn not_published() -> Self {
        Self { published: false, version: None }
    }

    pub fn published(version: impl Into<String>) -> Self {
        Self { published: true, version: Some(version.into()) }
    }
}

pub trait RegistryLookup: Send + Sync {
    fn lookup(&self, name: &str) -> Result<RegistryVerdict>;
}

#[derive(Debug, Deserialize)]
struct PackageMetadata {
    #[serde(rename = "dist-tags", default)]
    dist_tags: DistTags,
}

#[derive(Debug, Deserialize, Default)]
struct DistTags {
    latest: Option<String>,
}

/// Registry client over HTTP. 404 means "not published"; unexpected
/// statuses are downgraded to "not published" with a warning so a flaky
/// registry never blocks classification.
pub struct HttpRegistry {
    base_url: String,
    client: reqwest::blocking::Client,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl HttpRegistry {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("packwright/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| PackwrightError::NetworkError(format!("failed to create client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
        })
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    fn package_url(&self, name: &str) -> String {
        // Scoped names keep their slash un-encoded the way npm-style
        // registries expect for metadata GETs.
        format!("{}/{}", self.base_url, name)
    }

    fn get_once(&self, name: &str) -> Result<Attempt> {
        let url = self.package_url(name);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| PackwrightError::NetworkError(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Attempt::Done(RegistryVerdict::not_published()));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Ok(Attempt::RateLimited(retry_after));
        }
        if status.is_server_error() {
            return Ok(Attempt::Transient(format!("registry returned {}", status)));
        }
        if !status.is_success() {
            warn!("registry returned {} for {}; treating as not published", status, name);
            return Ok(Attempt::Done(RegistryVerdict::not_published()));
        }

        let metadata: PackageMetadata = response
            .json()
            .map_err(|e| PackwrightError::RegistryError(format!("bad metadata for {}: {}", name, e)))?;
        match metadata.dist_tags.latest {
            Some(version) => Ok(Attempt::Done(RegistryVerdict::published(version))),
            None => {
                warn!("registry metadata for {} has no dist-tags.latest; treating as not published", name);
                Ok(Attempt::Done(RegistryVerdict::not_published()))
            }
        }
    }
}

enum Attempt {
    Done(RegistryVerdict),
    RateLimited(Option<Duration>),
    Transient(String),
}

impl RegistryLookup for HttpRegistry {
    fn lookup(&self, name: &str) -> Result<RegistryVerdict> {
        let mut backoff = self.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match self.get_once(name) {
                Ok(Attempt::Done(verdict)) => {
                    info!(
                        "registry: {} is {}",
                        name,
                        match &verdict.version {
                            Some(v) => format!("published at {}", v),
                            None => "not published".to_string(),
                        }
                    );
                    return Ok(verdict);
                }
                Ok(Attempt::RateLimited(retry_after)) => {
                    let wait = retry_after.unwrap_or(backoff);
                    warn!("registry rate-limited lookup of {}; waiting {:?}", name, wait);
                    last_error = "rate limited".to_string();
                    if attempt < self.max_attempts {
                        std::thread::sleep(wait);
                    }
                }
                Ok(Attempt::Transient(reason)) => {
                    warn!("transient registry error for {}: {}", name, reason);
                    last_error = reason;
                    if attempt < self.max_attempts {
                        std::thread::sleep(backoff);
                    }
                }
                Err(e) => {
                    warn!("registry lookup attempt {} for {} failed: {}", attempt, name, e);
                    last_error = e.to_string();
                    if attempt < self.max_attempts {
                        std::thread::sleep(backoff);
                    }
                }
            }
            backoff *= 2;
        }

        Err(PackwrightError::RegistryError(format!(
            "lookup of {} failed after {} attempts: {}",
            name, self.max_attempts, last_error
        )))
    }
}
