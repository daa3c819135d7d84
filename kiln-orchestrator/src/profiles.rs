//! Profile registry
//!
//! Profiles are read once at startup from a JSON file:
//!
//! ```json
//! {"profiles": [{"name": "della", "host": "della.princeton.edu", "user": "alice",
//!                "home_dir": "/home/alice", "cache_dir": "/scratch/alice/hf"}]}
//! ```
//!
//! When the file does not exist the registry holds a single `local` profile
//! rooted at `$HOME`.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use kiln_core::domain::profile::{Profile, Provider};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Profile '{0}' not found")]
    NotFound(String),

    #[error("Invalid profile: {0}")]
    Invalid(String),

    #[error("Failed to read profiles file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse profiles file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct ProfilesFile {
    #[serde(default)]
    profiles: Vec<Profile>,
}

/// Read-only set of deployment profiles
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Profile>,
}

impl ProfileRegistry {
    /// Builds a registry, rejecting invalid or duplicate profiles
    pub fn new(profiles: Vec<Profile>) -> Result<Self, ProfileError> {
        let mut map = BTreeMap::new();

        for profile in profiles {
            profile.validate().map_err(ProfileError::Invalid)?;
            if map.contains_key(&profile.name) {
                return Err(ProfileError::Invalid(format!(
                    "duplicate profile '{}'",
                    profile.name
                )));
            }
            map.insert(profile.name.clone(), profile);
        }

        Ok(Self { profiles: map })
    }

    /// Parses the JSON profiles document
    pub fn from_json(json: &str) -> Result<Self, ProfileError> {
        let file: ProfilesFile = serde_json::from_str(json)?;
        Self::new(file.profiles)
    }

    /// Loads profiles from `path`, falling back to a single local profile
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        if !path.exists() {
            warn!(
                "Profiles file {} not found, using the local profile only",
                path.display()
            );
            return Self::new(vec![local_profile()]);
        }

        let json = std::fs::read_to_string(path)?;
        let registry = Self::from_json(&json)?;
        info!("Loaded {} profile(s) from {}", registry.len(), path.display());
        Ok(registry)
    }

    pub fn resolve(&self, name: &str) -> Result<Profile, ProfileError> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(name.to_string()))
    }

    /// Profiles sorted by name
    pub fn list(&self) -> Vec<Profile> {
        self.profiles.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn local_profile() -> Profile {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    Profile {
        name: "local".to_string(),
        host: None,
        user: None,
        cache_dir: format!("{}/.cache/huggingface", home),
        home_dir: home,
        provider: Some(Provider::Docker),
    }
}
