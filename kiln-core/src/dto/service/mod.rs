//! Service DTOs for the REST API

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::service::{ImageKind, JobType, Service, ServiceStatus};

/// Request to create and start a new service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateService {
    pub name: String,
    pub image: ImageKind,
    pub model: String,
    pub profile: String,

    /// Defaults to `local` for local profiles and `slurm` otherwise
    #[serde(default)]
    pub job_type: Option<JobType>,

    #[serde(default)]
    pub grace_period: Option<u64>,

    #[serde(default)]
    pub mounts: Vec<String>,

    #[serde(default)]
    pub container_options: ContainerOptions,

    #[serde(default)]
    pub job_options: JobOptions,
}

/// Options passed to the inference container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerOptions {
    /// Container image reference, defaults per image kind
    #[serde(default)]
    pub image_ref: Option<String>,

    /// Model revision to load
    #[serde(default)]
    pub revision: Option<String>,

    /// Extra arguments appended to the server command line
    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Scheduler resources requested for the job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Wall time limit, e.g. `00:30:00`
    #[serde(default)]
    pub time: Option<String>,

    #[serde(default)]
    pub partition: Option<String>,

    #[serde(default)]
    pub account: Option<String>,

    /// GPUs per node
    #[serde(default)]
    pub gres: Option<u32>,

    /// Memory per node in GB
    #[serde(default)]
    pub mem: Option<u32>,

    #[serde(default)]
    pub ntasks_per_node: Option<u32>,
}

/// Filter for listing services; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceFilter {
    #[serde(default)]
    pub image: Option<ImageKind>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub status: Option<ServiceStatus>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
}

impl ServiceFilter {
    pub fn matches(&self, service: &Service) -> bool {
        self.image.is_none_or(|image| image == service.image)
            && self.model.as_ref().is_none_or(|model| *model == service.model)
            && self.status.is_none_or(|status| status == service.status)
            && self.name.as_ref().is_none_or(|name| *name == service.name)
            && self
                .profile
                .as_ref()
                .is_none_or(|profile| *profile == service.profile)
    }
}

/// Request to stop a service
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StopService {
    #[serde(default)]
    pub timeout: bool,
    #[serde(default)]
    pub failed: bool,
}

/// Job detail view for a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_type: JobType,
    pub job_id: String,
    pub state: Option<String>,
    pub node: Option<String>,
    pub port: Option<u16>,
}
