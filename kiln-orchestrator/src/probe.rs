//! Health probes
//!
//! A probe is an HTTP GET against the service's health path on loopback.
//! Probes never fail: any transport error or non-2xx answer is reported as
//! not ok.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Outcome of one health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ping {
    pub ok: bool,
    /// HTTP status, if a response arrived
    pub status: Option<u16>,
}

impl Ping {
    pub fn failed() -> Self {
        Self {
            ok: false,
            status: None,
        }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn ping(&self, port: u16, path: &str) -> Ping;
}

/// Probes over HTTP with reqwest
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn ping(&self, port: u16, path: &str) -> Ping {
        let url = format!("http://127.0.0.1:{}{}", port, path);

        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                debug!("Probe {} -> {}", url, status);
                Ping {
                    ok: status.is_success(),
                    status: Some(status.as_u16()),
                }
            }
            Err(e) => {
                debug!("Probe {} failed: {}", url, e);
                Ping::failed()
            }
        }
    }
}
