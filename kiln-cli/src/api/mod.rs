//! API client module
//!
//! HTTP client for communicating with the Kiln orchestrator API.

use anyhow::{Context, Result};
use kiln_core::domain::profile::Profile;
use kiln_core::domain::service::{Service, ServiceStatus};
use kiln_core::dto::service::{CreateService, JobView, ServiceFilter, StopService};
use kiln_remote::{ConnectionStatus, FileEntry};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Answer of the wait endpoint
#[derive(Debug, Deserialize)]
pub struct WaitResult {
    pub id: Uuid,
    pub status: ServiceStatus,
}

/// HTTP client for the Kiln orchestrator API
pub struct ApiClient {
    base_url: String,
    client: Client,
}

impl ApiClient {
    /// Create a new API client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the orchestrator API
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Create a service and submit its job
    pub async fn start_service(&self, req: &CreateService) -> Result<Service> {
        let response = self
            .client
            .post(self.url("/api/services"))
            .json(req)
            .send()
            .await
            .context("Failed to send start service request")?;

        handle_response(response).await
    }

    /// List services matching `filter`
    pub async fn list_services(&self, filter: &ServiceFilter) -> Result<Vec<Service>> {
        let response = self
            .client
            .get(self.url("/api/services"))
            .query(filter)
            .send()
            .await
            .context("Failed to send list services request")?;

        handle_response(response).await
    }

    /// Get a service by ID, refreshed
    pub async fn get_service(&self, id: Uuid) -> Result<Service> {
        let response = self
            .client
            .get(self.url(&format!("/api/services/{}", id)))
            .send()
            .await
            .context("Failed to send get service request")?;

        handle_response(response).await
    }

    pub async fn get_service_job(&self, id: Uuid) -> Result<JobView> {
        let response = self
            .client
            .get(self.url(&format!("/api/services/{}/job", id)))
            .send()
            .await
            .context("Failed to send get job request")?;

        handle_response(response).await
    }

    pub async fn stop_service(&self, id: Uuid, req: StopService) -> Result<Service> {
        let response = self
            .client
            .post(self.url(&format!("/api/services/{}/stop", id)))
            .json(&req)
            .send()
            .await
            .context("Failed to send stop service request")?;

        handle_response(response).await
    }

    /// Block until the service is healthy or terminal
    ///
    /// # Arguments
    /// * `timeout` - Seconds the orchestrator waits before answering
    /// * `interval` - Seconds between refreshes
    pub async fn wait_service(&self, id: Uuid, timeout: u64, interval: u64) -> Result<WaitResult> {
        let response = self
            .client
            .get(self.url(&format!("/api/services/{}/wait", id)))
            .query(&[("timeout", timeout), ("interval", interval)])
            .send()
            .await
            .context("Failed to send wait request")?;

        handle_response(response).await
    }

    pub async fn delete_service(&self, id: Uuid) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/api/services/{}", id)))
            .send()
            .await
            .context("Failed to send delete service request")?;

        handle_empty(response).await
    }

    // =========================================================================
    // Connections and profiles
    // =========================================================================

    pub async fn list_connections(&self) -> Result<BTreeMap<String, ConnectionStatus>> {
        let response = self
            .client
            .get(self.url("/api/connections"))
            .send()
            .await
            .context("Failed to send list connections request")?;

        handle_response(response).await
    }

    pub async fn list_profiles(&self) -> Result<Vec<Profile>> {
        let response = self
            .client
            .get(self.url("/api/profiles"))
            .send()
            .await
            .context("Failed to send list profiles request")?;

        handle_response(response).await
    }

    // =========================================================================
    // Files
    // =========================================================================

    pub async fn list_files(&self, profile: &str, path: &str) -> Result<Vec<FileEntry>> {
        let response = self
            .client
            .get(self.url(&format!("/api/files/{}", profile)))
            .query(&[("path", path)])
            .send()
            .await
            .context("Failed to send list files request")?;

        handle_response(response).await
    }

    pub async fn stat_file(&self, profile: &str, path: &str) -> Result<FileEntry> {
        let response = self
            .client
            .get(self.url(&format!("/api/files/{}/stat", profile)))
            .query(&[("path", path)])
            .send()
            .await
            .context("Failed to send stat request")?;

        handle_response(response).await
    }

    pub async fn make_directory(&self, profile: &str, path: &str, parents: bool) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/api/files/{}/mkdir", profile)))
            .json(&serde_json::json!({ "path": path, "parents": parents }))
            .send()
            .await
            .context("Failed to send mkdir request")?;

        handle_empty(response).await
    }

    pub async fn rename_file(&self, profile: &str, from: &str, to: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/api/files/{}/rename", profile)))
            .json(&serde_json::json!({ "from": from, "to": to }))
            .send()
            .await
            .context("Failed to send rename request")?;

        handle_empty(response).await
    }

    pub async fn delete_file(&self, profile: &str, path: &str, recursive: bool) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/api/files/{}", profile)))
            .query(&[("path", path), ("recursive", if recursive { "true" } else { "false" })])
            .send()
            .await
            .context("Failed to send delete file request")?;

        handle_empty(response).await
    }
}

/// Error message of a failed response, from its `{"error": ...}` body if any
async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(body);

    if message.is_empty() {
        format!("Request failed with status {}", status)
    } else {
        message
    }
}

/// Handle API response and deserialize JSON
async fn handle_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    if !response.status().is_success() {
        anyhow::bail!(error_message(response).await);
    }

    response
        .json()
        .await
        .context("Failed to parse response JSON")
}

/// Handle an API response without a body
async fn handle_empty(response: reqwest::Response) -> Result<()> {
    if !response.status().is_success() {
        anyhow::bail!(error_message(response).await);
    }
    Ok(())
}
