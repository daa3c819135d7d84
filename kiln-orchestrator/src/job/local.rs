//! Local container jobs
//!
//! Docker containers are inspected with `docker inspect` and publish their
//! port on the loopback interface. Apptainer instances share the host
//! network; their launch script records the chosen port in
//! `<home_dir>/.kiln/jobs/<instance>/port`.

use std::sync::Arc;
use tracing::{debug, info, warn};

use kiln_core::domain::profile::{LOCALHOST, Provider};
use kiln_remote::{Shell, quote};

use super::{JobQueryError, first_line, query};

/// Container state as reported by the local runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    Missing,
}

impl LocalState {
    /// Parses a docker `State.Status` value
    pub fn from_docker(status: &str) -> Option<Self> {
        match status.trim() {
            "created" => Some(LocalState::Created),
            "running" => Some(LocalState::Running),
            "restarting" => Some(LocalState::Restarting),
            "paused" => Some(LocalState::Paused),
            "exited" => Some(LocalState::Exited),
            "dead" | "removing" => Some(LocalState::Dead),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LocalState::Created => "CREATED",
            LocalState::Running => "RUNNING",
            LocalState::Restarting => "RESTARTING",
            LocalState::Paused => "PAUSED",
            LocalState::Exited => "EXITED",
            LocalState::Dead => "DEAD",
            LocalState::Missing => "MISSING",
        }
    }
}

impl std::fmt::Display for LocalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container on this machine
pub struct LocalJob {
    job_id: String,
    provider: Provider,
    home_dir: String,
    container_port: u16,
    shell: Arc<dyn Shell>,
    state: Option<LocalState>,
    port: Option<u16>,
}

impl LocalJob {
    /// # Arguments
    /// * `job_id` - Docker container id or Apptainer instance name
    /// * `container_port` - Port the server listens on inside the container
    pub fn new(
        job_id: impl Into<String>,
        provider: Provider,
        home_dir: impl Into<String>,
        container_port: u16,
        shell: Arc<dyn Shell>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            provider,
            home_dir: home_dir.into(),
            container_port,
            shell,
            state: None,
            port: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> Option<LocalState> {
        self.state
    }

    pub fn node(&self) -> &str {
        LOCALHOST
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Refreshes the container state
    ///
    /// The published port is fetched when the container is first seen running.
    pub async fn update(&mut self) -> Option<LocalState> {
        let state = match self.query_state().await {
            Ok(Some(state)) => state,
            Ok(None) => return self.state,
            Err(e) if e.is_missing() => LocalState::Missing,
            Err(e) => {
                warn!("Failed to query {} job {}: {}", self.provider, self.job_id, e);
                return self.state;
            }
        };

        let previous = self.state.replace(state);
        if previous != Some(state) {
            debug!(
                "{} job {} state: {} -> {}",
                self.provider,
                self.job_id,
                previous.map(|s| s.as_str()).unwrap_or("-"),
                state
            );
        }

        let was_waiting = matches!(
            previous,
            None | Some(LocalState::Missing) | Some(LocalState::Created)
        );
        if was_waiting && state == LocalState::Running {
            self.port = self.fetch_port().await;
        }

        Some(state)
    }

    async fn query_state(&self) -> Result<Option<LocalState>, JobQueryError> {
        match self.provider {
            Provider::Docker => {
                let command = format!(
                    "docker inspect --format {} {}",
                    quote("{{.State.Status}}"),
                    quote(&self.job_id)
                );
                let output = query(self.shell.as_ref(), &command).await?;
                let status = first_line(&output).unwrap_or_default();

                let state = LocalState::from_docker(status);
                if state.is_none() {
                    warn!("Unknown docker status '{}' for {}", status, self.job_id);
                }
                Ok(state)
            }
            Provider::Apptainer => {
                let command = format!("apptainer instance list {}", quote(&self.job_id));
                let output = query(self.shell.as_ref(), &command).await?;

                let listed = output
                    .lines()
                    .filter_map(|line| line.split_whitespace().next())
                    .any(|name| name == self.job_id);

                Ok(Some(if listed {
                    LocalState::Running
                } else {
                    LocalState::Missing
                }))
            }
        }
    }

    /// Host port the server is reachable on
    pub async fn fetch_port(&self) -> Option<u16> {
        let command = match self.provider {
            Provider::Docker => format!(
                "docker port {} {}/tcp",
                quote(&self.job_id),
                self.container_port
            ),
            Provider::Apptainer => format!(
                "cat {}/.kiln/jobs/{}/port",
                quote(self.home_dir.trim_end_matches('/')),
                quote(&self.job_id)
            ),
        };

        match query(self.shell.as_ref(), &command).await {
            Ok(output) => parse_port(&output),
            Err(e) => {
                debug!("No port yet for {} job {}: {}", self.provider, self.job_id, e);
                None
            }
        }
    }

    pub async fn cancel(&self) {
        let commands = match self.provider {
            Provider::Docker => vec![
                format!("docker stop {}", quote(&self.job_id)),
                format!("docker rm -f {}", quote(&self.job_id)),
            ],
            Provider::Apptainer => {
                vec![format!("apptainer instance stop {}", quote(&self.job_id))]
            }
        };

        for command in commands {
            if let Err(e) = query(self.shell.as_ref(), &command).await {
                warn!("Failed to cancel {} job {}: {}", self.provider, self.job_id, e);
                return;
            }
        }

        info!("Cancelled {} job {}", self.provider, self.job_id);
    }
}

/// Extracts the host port from `docker port` output or a bare port marker
///
/// Handles `127.0.0.1:32768`, `80/tcp -> 0.0.0.0:32768` and `8123`.
fn parse_port(output: &str) -> Option<u16> {
    let line = first_line(output)?;
    let address = line.rsplit("->").next().unwrap_or(line).trim();
    address.rsplit(':').next()?.trim().parse().ok()
}
