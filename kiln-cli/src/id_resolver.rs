//! ID resolver module
//!
//! Handles resolution of UUID prefixes to full UUIDs by querying the API.
//! This allows users to specify short, unambiguous prefixes instead of full UUIDs.

use anyhow::{Context, Result, anyhow};
use kiln_core::dto::service::ServiceFilter;
use uuid::Uuid;

use crate::api::ApiClient;
use crate::types::IdOrPrefix;

/// Resolve a service ID or prefix to a full UUID
///
/// If the input is already a full UUID, returns it immediately.
/// Otherwise, fetches all services and finds the one matching the prefix.
///
/// # Errors
/// Returns an error if:
/// - No service matches the prefix
/// - Multiple services match the prefix (ambiguous)
/// - API call fails
pub async fn resolve_service_id(client: &ApiClient, id_or_prefix: &IdOrPrefix) -> Result<Uuid> {
    // If it's already a full UUID, return it
    if let Some(uuid) = id_or_prefix.as_uuid() {
        return Ok(uuid);
    }

    let services = client
        .list_services(&ServiceFilter::default())
        .await
        .context("Failed to fetch services for ID resolution")?;

    match_prefix(&id_or_prefix.as_str(), services.iter().map(|s| s.id))
}

/// The single id starting with `prefix`
fn match_prefix(prefix: &str, ids: impl Iterator<Item = Uuid>) -> Result<Uuid> {
    let prefix = prefix.to_lowercase();
    let matches: Vec<Uuid> = ids
        .filter(|id| id.to_string().starts_with(&prefix))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No service found with ID starting with '{}'", prefix)),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(Uuid::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple services: {}",
                prefix,
                ids.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> Vec<Uuid> {
        [
            "3f2a0c1e-8d4b-4c5a-9e6f-0a1b2c3d4e5f",
            "3f2b7d9a-1c2e-4f3a-8b4c-5d6e7f8a9b0c",
            "a1b2c3d4-e5f6-4a7b-8c9d-0e1f2a3b4c5d",
        ]
        .iter()
        .map(|s| Uuid::parse_str(s).unwrap())
        .collect()
    }

    #[test]
    fn test_unique_prefix() {
        let id = match_prefix("3F2A", ids().into_iter()).unwrap();
        assert_eq!(id, ids()[0]);
    }

    #[test]
    fn test_ambiguous_prefix() {
        let err = match_prefix("3f2", ids().into_iter()).unwrap_err();
        assert!(err.to_string().contains("Ambiguous"));
    }

    #[test]
    fn test_unknown_prefix() {
        let err = match_prefix("ff", ids().into_iter()).unwrap_err();
        assert!(err.to_string().contains("No service"));
    }
}
