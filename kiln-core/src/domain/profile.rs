//! Deployment profile domain model
//!
//! A profile names a deployment target: the local machine or a remote
//! Slurm login host reached over SSH.

use serde::{Deserialize, Serialize};

/// Host name used for profiles that run on this machine
pub const LOCALHOST: &str = "localhost";

/// Container runtime used to launch services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Docker,
    Apptainer,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Docker => write!(f, "docker"),
            Provider::Apptainer => write!(f, "apptainer"),
        }
    }
}

/// Named deployment target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,

    /// Login host, `None` or `"localhost"` for local profiles
    #[serde(default)]
    pub host: Option<String>,

    /// SSH user, required for remote profiles
    #[serde(default)]
    pub user: Option<String>,

    /// Home directory on the target, root of job artifacts and file browsing
    pub home_dir: String,

    /// Model cache directory on the target
    pub cache_dir: String,

    /// Container runtime hint
    #[serde(default)]
    pub provider: Option<Provider>,
}

impl Profile {
    /// Whether this profile deploys on the local machine
    pub fn is_local(&self) -> bool {
        match self.host.as_deref() {
            None => true,
            Some(host) => host.is_empty() || host == LOCALHOST,
        }
    }

    /// Host to record on services, `"localhost"` for local profiles
    pub fn host_or_local(&self) -> &str {
        if self.is_local() {
            LOCALHOST
        } else {
            self.host.as_deref().unwrap_or(LOCALHOST)
        }
    }

    /// Checks the remote-profile invariant
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("profile name cannot be empty".to_string());
        }

        if self.home_dir.trim().is_empty() {
            return Err(format!("profile '{}' has an empty home_dir", self.name));
        }

        if !self.is_local() && self.user.as_deref().is_none_or(|u| u.trim().is_empty()) {
            return Err(format!(
                "remote profile '{}' requires a user",
                self.name
            ));
        }

        Ok(())
    }
}
