//! Health probe port and the HTTP implementation

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Invalid probe target '{0}'")]
    InvalidTarget(String),

    #[error("Failed to create HTTP client: {0}")]
    Client(String),
}

/// Outcome of probing a single target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub target: String,
    pub healthy: bool,
    pub latency_ms: u64,
    pub status_code: Option<u16>,
    pub message: String,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe a target; unreachable targets are an unhealthy result, not an error
    async fn probe(&self, target: &str) -> Result<ProbeResult, ProbeError>;
}

/// Probes an HTTP endpoint; any 2xx/3xx response counts as healthy
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, target: &str) -> Result<ProbeResult, ProbeError> {
        let url =
            reqwest::Url::parse(target).map_err(|_| ProbeError::InvalidTarget(target.to_string()))?;

        debug!("🔍 Probing {}", url);
        let started = Instant::now();
        let result = match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                let healthy = status.is_success() || status.is_redirection();
                ProbeResult {
                    target: target.to_string(),
                    healthy,
                    latency_ms: started.elapsed().as_millis() as u64,
                    status_code: Some(status.as_u16()),
                    message: format!("Responded with status {}", status),
                }
            }
            Err(e) => ProbeResult {
                target: target.to_string(),
                healthy: false,
                latency_ms: started.elapsed().as_millis() as u64,
                status_code: None,
                message: format!("Request failed: {}", e),
            },
        };
        Ok(result)
    }
}
