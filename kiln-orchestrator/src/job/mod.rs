//! Job abstraction
//!
//! A job is the unit of compute behind a service: a Slurm batch job or a
//! local container. Jobs are never stored; they are rebuilt from the
//! service's `job_id` every time their state is needed.
//!
//! Both variants answer the same questions:
//! - `update`: what state is the job in now
//! - `node` / `port`: where does it listen
//! - `cancel`: make it go away (best effort)

pub mod local;
pub mod slurm;

pub use local::{LocalJob, LocalState};
pub use slurm::{SlurmJob, SlurmState};

use kiln_core::domain::service::JobType;
use kiln_core::dto::service::JobView;
use kiln_remote::{Shell, ShellError};
use thiserror::Error;

/// A status query that produced no usable answer
#[derive(Debug, Error)]
pub enum JobQueryError {
    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },
}

impl JobQueryError {
    /// Whether the runtime reported that the job does not exist
    pub fn is_missing(&self) -> bool {
        match self {
            JobQueryError::Failed { stderr, .. } => {
                let stderr = stderr.to_lowercase();
                stderr.contains("no such object") || stderr.contains("no such container")
            }
            JobQueryError::Shell(_) => false,
        }
    }
}

/// Runs a query command and returns its stdout, failing on non-zero exit
pub(crate) async fn query(shell: &dyn Shell, command: &str) -> Result<String, JobQueryError> {
    let output = shell.run(command).await?;

    if !output.success() {
        return Err(JobQueryError::Failed {
            command: command.to_string(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        });
    }

    Ok(output.stdout)
}

/// First non-empty trimmed line of some command output
pub(crate) fn first_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).find(|line| !line.is_empty())
}

/// State reported by the job's scheduler or runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Slurm(SlurmState),
    Local(LocalState),
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Slurm(state) => write!(f, "{}", state),
            JobState::Local(state) => write!(f, "{}", state),
        }
    }
}

/// Unit of compute backing a service
pub enum Job {
    Slurm(SlurmJob),
    Local(LocalJob),
}

impl Job {
    pub fn job_id(&self) -> &str {
        match self {
            Job::Slurm(job) => job.job_id(),
            Job::Local(job) => job.job_id(),
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Job::Slurm(_) => JobType::Slurm,
            Job::Local(_) => JobType::Local,
        }
    }

    /// Last state seen by `update`
    pub fn state(&self) -> Option<JobState> {
        match self {
            Job::Slurm(job) => job.state().cloned().map(JobState::Slurm),
            Job::Local(job) => job.state().map(JobState::Local),
        }
    }

    pub fn node(&self) -> Option<&str> {
        match self {
            Job::Slurm(job) => job.node(),
            Job::Local(job) => Some(job.node()),
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Job::Slurm(job) => job.port(),
            Job::Local(job) => job.port(),
        }
    }

    /// Whether the job's port is already reachable on this machine
    pub fn is_local(&self) -> bool {
        matches!(self, Job::Local(_))
    }

    /// Queries the current state
    ///
    /// Query failures leave the previous state in place. Node and port are
    /// fetched when the job is first seen running.
    pub async fn update(&mut self) -> Option<JobState> {
        match self {
            Job::Slurm(job) => job.update().await.map(JobState::Slurm),
            Job::Local(job) => job.update().await.map(JobState::Local),
        }
    }

    /// Best-effort cancellation
    pub async fn cancel(&self) {
        match self {
            Job::Slurm(job) => job.cancel().await,
            Job::Local(job) => job.cancel().await,
        }
    }

    /// Detail view for API consumers
    pub fn view(&self) -> JobView {
        JobView {
            job_type: self.job_type(),
            job_id: self.job_id().to_string(),
            state: self.state().map(|s| s.to_string()),
            node: self.node().map(str::to_string),
            port: self.port(),
        }
    }
}
