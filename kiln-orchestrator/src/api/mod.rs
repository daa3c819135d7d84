//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod connections;
pub mod error;
pub mod files;
pub mod health;
pub mod service;

use axum::{
    Router,
    routing::{get, post},
};
use kiln_remote::ConnectionManager;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::profiles::ProfileRegistry;
use crate::service::ServiceManager;
use crate::shell::ShellProvider;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<ServiceManager>,
    pub profiles: Arc<ProfileRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub shells: Arc<dyn ShellProvider>,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Service endpoints
        .route(
            "/api/services",
            post(service::start_service).get(service::list_services),
        )
        .route(
            "/api/services/{id}",
            get(service::get_service).delete(service::delete_service),
        )
        .route("/api/services/{id}/job", get(service::get_service_job))
        .route("/api/services/{id}/stop", post(service::stop_service))
        .route("/api/services/{id}/wait", get(service::wait_service))
        // Connection and profile endpoints
        .route("/api/connections", get(connections::list_connections))
        .route("/api/profiles", get(connections::list_profiles))
        // File browser endpoints
        .route(
            "/api/files/{profile}",
            get(files::list_files).delete(files::delete_file),
        )
        .route("/api/files/{profile}/stat", get(files::stat_file))
        .route("/api/files/{profile}/exists", get(files::file_exists))
        .route("/api/files/{profile}/mkdir", post(files::make_directory))
        .route("/api/files/{profile}/rename", post(files::rename_file))
        // Add state and middleware
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
