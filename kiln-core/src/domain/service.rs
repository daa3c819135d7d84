//! Service domain model
//!
//! A service is a deployed inference server backed by a single job, either
//! a local container or a Slurm batch job. It is the durable record the
//! orchestrator drives through its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::profile::{LOCALHOST, Profile, Provider};
use crate::dto::service::CreateService;

/// Default seconds a starting service may stay unresponsive
pub const DEFAULT_GRACE_PERIOD: u64 = 180;

/// Deployed inference service
///
/// Structure shared between orchestrator (persists and drives) and CLI (renders).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub name: String,
    pub image: ImageKind,
    pub model: String,
    pub profile: String,
    pub status: ServiceStatus,
    pub user: Option<String>,
    pub host: String,

    /// Local port the service is reachable on, if tunnelled
    pub port: Option<u16>,

    pub job_type: JobType,

    /// External job handle, set once submission succeeds
    pub job_id: Option<String>,

    /// Seconds after creation before a starting service counts as unhealthy
    pub grace_period: u64,

    pub mounts: Vec<String>,
    pub provider: Option<Provider>,

    /// Home directory on the deployment host, where job artifacts live
    pub home_dir: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Service {
    /// Builds an unsubmitted service from a request and its resolved profile
    pub fn from_request(req: &CreateService, profile: &Profile) -> Self {
        let now = Utc::now();
        let job_type = req.job_type.unwrap_or(if profile.is_local() {
            JobType::Local
        } else {
            JobType::Slurm
        });

        Self {
            id: Uuid::new_v4(),
            name: req.name.clone(),
            image: req.image,
            model: req.model.clone(),
            profile: profile.name.clone(),
            status: ServiceStatus::Submitted,
            user: profile.user.clone(),
            host: profile.host_or_local().to_string(),
            port: None,
            job_type,
            job_id: None,
            grace_period: req.grace_period.unwrap_or(DEFAULT_GRACE_PERIOD),
            mounts: req.mounts.clone(),
            provider: profile.provider,
            home_dir: profile.home_dir.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the service host is this machine
    pub fn is_local(&self) -> bool {
        self.host.is_empty() || self.host == LOCALHOST
    }

    /// Whether more than `grace_period` seconds passed since creation
    pub fn grace_period_exceeded(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_milliseconds() > (self.grace_period as i64).saturating_mul(1000)
    }
}

/// Lifecycle status of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Submitted,
    Pending,
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
    Timeout,
    Failed,
}

impl ServiceStatus {
    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Stopped | ServiceStatus::Timeout | ServiceStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Submitted => "SUBMITTED",
            ServiceStatus::Pending => "PENDING",
            ServiceStatus::Starting => "STARTING",
            ServiceStatus::Healthy => "HEALTHY",
            ServiceStatus::Unhealthy => "UNHEALTHY",
            ServiceStatus::Stopped => "STOPPED",
            ServiceStatus::Timeout => "TIMEOUT",
            ServiceStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SUBMITTED" => Ok(ServiceStatus::Submitted),
            "PENDING" => Ok(ServiceStatus::Pending),
            "STARTING" => Ok(ServiceStatus::Starting),
            "HEALTHY" => Ok(ServiceStatus::Healthy),
            "UNHEALTHY" => Ok(ServiceStatus::Unhealthy),
            "STOPPED" => Ok(ServiceStatus::Stopped),
            "TIMEOUT" => Ok(ServiceStatus::Timeout),
            "FAILED" => Ok(ServiceStatus::Failed),
            other => Err(format!("unknown service status: {}", other)),
        }
    }
}

/// Kind of compute backing a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Local,
    Slurm,
    Ec2,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Local => "local",
            JobType::Slurm => "slurm",
            JobType::Ec2 => "ec2",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(JobType::Local),
            "slurm" => Ok(JobType::Slurm),
            "ec2" => Ok(JobType::Ec2),
            other => Err(format!("unknown job type: {}", other)),
        }
    }
}

/// Inference task served by a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageKind {
    TextGeneration,
    SpeechRecognition,
}

impl ImageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageKind::TextGeneration => "text-generation",
            ImageKind::SpeechRecognition => "speech-recognition",
        }
    }

    /// Path probed to decide whether the inference server is up
    pub fn health_path(&self) -> &'static str {
        match self {
            ImageKind::TextGeneration => "/health",
            ImageKind::SpeechRecognition => "/v1/health",
        }
    }

    /// Port the inference server listens on inside its container
    pub fn container_port(&self) -> u16 {
        match self {
            ImageKind::TextGeneration => 80,
            ImageKind::SpeechRecognition => 8000,
        }
    }
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ImageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "text-generation" => Ok(ImageKind::TextGeneration),
            "speech-recognition" => Ok(ImageKind::SpeechRecognition),
            other => Err(format!("unknown image: {}", other)),
        }
    }
}
