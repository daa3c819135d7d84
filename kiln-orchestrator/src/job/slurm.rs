//! Slurm batch jobs
//!
//! State comes from `sacct`, the allocated node from `squeue`, and the port
//! from a marker file the batch script writes under
//! `<home_dir>/.kiln/jobs/<job_id>/port`.

use std::sync::Arc;
use tracing::{debug, info, warn};

use kiln_remote::{Shell, quote};

use super::{first_line, query};

/// Slurm job state as reported by `sacct`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlurmState {
    Pending,
    Running,
    Suspended,
    Completing,
    Completed,
    Cancelled,
    Failed,
    Timeout,
    NodeFail,
    Preempted,
    BootFail,
    Deadline,
    OutOfMemory,
    Requeued,
    /// `sacct` knows nothing about the job yet
    Missing,
    Other(String),
}

impl SlurmState {
    /// Parses `sacct` output; empty output means the job is missing
    pub fn parse(output: &str) -> Self {
        let Some(word) = first_line(output).and_then(|line| line.split_whitespace().next()) else {
            return SlurmState::Missing;
        };

        match word.trim_end_matches('+') {
            "PENDING" => SlurmState::Pending,
            "RUNNING" => SlurmState::Running,
            "SUSPENDED" => SlurmState::Suspended,
            "COMPLETING" => SlurmState::Completing,
            "COMPLETED" => SlurmState::Completed,
            "CANCELLED" => SlurmState::Cancelled,
            "FAILED" => SlurmState::Failed,
            "TIMEOUT" => SlurmState::Timeout,
            "NODE_FAIL" => SlurmState::NodeFail,
            "PREEMPTED" => SlurmState::Preempted,
            "BOOT_FAIL" => SlurmState::BootFail,
            "DEADLINE" => SlurmState::Deadline,
            "OUT_OF_MEMORY" => SlurmState::OutOfMemory,
            "REQUEUED" => SlurmState::Requeued,
            other => SlurmState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SlurmState::Pending => "PENDING",
            SlurmState::Running => "RUNNING",
            SlurmState::Suspended => "SUSPENDED",
            SlurmState::Completing => "COMPLETING",
            SlurmState::Completed => "COMPLETED",
            SlurmState::Cancelled => "CANCELLED",
            SlurmState::Failed => "FAILED",
            SlurmState::Timeout => "TIMEOUT",
            SlurmState::NodeFail => "NODE_FAIL",
            SlurmState::Preempted => "PREEMPTED",
            SlurmState::BootFail => "BOOT_FAIL",
            SlurmState::Deadline => "DEADLINE",
            SlurmState::OutOfMemory => "OUT_OF_MEMORY",
            SlurmState::Requeued => "REQUEUED",
            SlurmState::Missing => "MISSING",
            SlurmState::Other(s) => s,
        }
    }
}

impl std::fmt::Display for SlurmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Slurm job reached through a login host shell
pub struct SlurmJob {
    job_id: String,
    home_dir: String,
    shell: Arc<dyn Shell>,
    state: Option<SlurmState>,
    node: Option<String>,
    port: Option<u16>,
}

impl SlurmJob {
    pub fn new(
        job_id: impl Into<String>,
        home_dir: impl Into<String>,
        shell: Arc<dyn Shell>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            home_dir: home_dir.into(),
            shell,
            state: None,
            node: None,
            port: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> Option<&SlurmState> {
        self.state.as_ref()
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Path of the port marker written by the batch script
    pub fn port_file(&self) -> String {
        format!(
            "{}/.kiln/jobs/{}/port",
            self.home_dir.trim_end_matches('/'),
            self.job_id
        )
    }

    /// Refreshes the job state from `sacct`
    ///
    /// On a move from nothing, `MISSING` or `PENDING` to `RUNNING` the node and
    /// port are fetched in the same call.
    pub async fn update(&mut self) -> Option<SlurmState> {
        let command = format!("sacct -n -X -P -o State -j {}", quote(&self.job_id));

        let output = match query(self.shell.as_ref(), &command).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Failed to query Slurm job {}: {}", self.job_id, e);
                return self.state.clone();
            }
        };

        let state = SlurmState::parse(&output);
        let previous = self.state.replace(state.clone());

        if previous.as_ref() != Some(&state) {
            debug!(
                "Slurm job {} state: {} -> {}",
                self.job_id,
                previous.as_ref().map(SlurmState::as_str).unwrap_or("-"),
                state
            );
        }

        let was_waiting = matches!(
            previous,
            None | Some(SlurmState::Missing) | Some(SlurmState::Pending)
        );
        if was_waiting && state == SlurmState::Running {
            self.node = self.fetch_node().await;
            self.port = self.fetch_port().await;
        }

        Some(state)
    }

    /// Node list allocated to the job, `None` when not yet allocated
    pub async fn fetch_node(&self) -> Option<String> {
        let command = format!("squeue -h -o %N -j {}", quote(&self.job_id));

        match query(self.shell.as_ref(), &command).await {
            Ok(output) => first_line(&output).map(str::to_string),
            Err(e) => {
                warn!("Failed to fetch node for Slurm job {}: {}", self.job_id, e);
                None
            }
        }
    }

    /// Port from the job's marker file, `None` until the job has written it
    pub async fn fetch_port(&self) -> Option<u16> {
        let command = format!("cat {}", quote(&self.port_file()));

        match query(self.shell.as_ref(), &command).await {
            Ok(output) => first_line(&output).and_then(|line| line.parse().ok()),
            Err(e) => {
                debug!("Port marker for Slurm job {} not readable: {}", self.job_id, e);
                None
            }
        }
    }

    pub async fn cancel(&self) {
        let command = format!("scancel {}", quote(&self.job_id));

        match query(self.shell.as_ref(), &command).await {
            Ok(_) => info!("Cancelled Slurm job {}", self.job_id),
            Err(e) => warn!("Failed to cancel Slurm job {}: {}", self.job_id, e),
        }
    }
}
