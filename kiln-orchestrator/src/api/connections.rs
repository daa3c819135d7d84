//! Connection and Profile API Handlers

use axum::{Json, extract::State};
use kiln_core::domain::profile::Profile;
use kiln_remote::ConnectionStatus;
use std::collections::BTreeMap;

use crate::api::AppState;

/// GET /api/connections
/// Status of every pooled SSH connection, keyed by `user@host`
pub async fn list_connections(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, ConnectionStatus>> {
    let status = state.connections.get_status().await;
    tracing::debug!("{} pooled connection(s)", status.len());

    Json(status.into_iter().collect())
}

/// GET /api/profiles
pub async fn list_profiles(State(state): State<AppState>) -> Json<Vec<Profile>> {
    Json(state.profiles.list())
}
