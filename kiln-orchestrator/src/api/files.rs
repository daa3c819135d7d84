//! File Browser API Handlers
//!
//! Browse and edit files under a profile's home directory. Paths are
//! relative to that directory; anything escaping it is refused.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use kiln_remote::{FileBrowser, FileEntry};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::api::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Deserialize)]
pub struct MkdirRequest {
    pub path: String,
    #[serde(default)]
    pub parents: bool,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Serialize)]
pub struct ExistsResponse {
    pub path: String,
    pub exists: bool,
}

/// File browser over the profile's shell
fn browser(state: &AppState, profile: &str) -> ApiResult<FileBrowser> {
    let profile = state.profiles.resolve(profile)?;
    let shell = state
        .shells
        .shell(profile.host_or_local(), profile.user.as_deref())?;

    Ok(FileBrowser::new(shell, profile.home_dir))
}

/// GET /api/files/{profile}?path=
/// List a directory
pub async fn list_files(
    State(state): State<AppState>,
    Path(profile): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<Vec<FileEntry>>> {
    tracing::debug!("Listing {}:{:?}", profile, query.path);

    let entries = browser(&state, &profile)?.list(&query.path).await?;
    Ok(Json(entries))
}

/// GET /api/files/{profile}/stat?path=
pub async fn stat_file(
    State(state): State<AppState>,
    Path(profile): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<FileEntry>> {
    tracing::debug!("Stat {}:{:?}", profile, query.path);

    let entry = browser(&state, &profile)?.stat(&query.path).await?;
    Ok(Json(entry))
}

/// GET /api/files/{profile}/exists?path=
pub async fn file_exists(
    State(state): State<AppState>,
    Path(profile): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<ExistsResponse>> {
    let exists = browser(&state, &profile)?.exists(&query.path).await?;
    Ok(Json(ExistsResponse {
        path: query.path,
        exists,
    }))
}

/// POST /api/files/{profile}/mkdir
/// Create a directory
pub async fn make_directory(
    State(state): State<AppState>,
    Path(profile): Path<String>,
    Json(req): Json<MkdirRequest>,
) -> ApiResult<StatusCode> {
    tracing::info!("Creating directory {}:{}", profile, req.path);

    browser(&state, &profile)?
        .mkdir(&req.path, req.parents)
        .await?;
    Ok(StatusCode::CREATED)
}

/// POST /api/files/{profile}/rename
/// Move a file or directory
pub async fn rename_file(
    State(state): State<AppState>,
    Path(profile): Path<String>,
    Json(req): Json<RenameRequest>,
) -> ApiResult<StatusCode> {
    tracing::info!("Renaming {}:{} -> {}", profile, req.from, req.to);

    browser(&state, &profile)?.rename(&req.from, &req.to).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/files/{profile}?path=&recursive=
/// Delete a file or directory
pub async fn delete_file(
    State(state): State<AppState>,
    Path(profile): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<StatusCode> {
    tracing::info!(
        "Deleting {}:{} (recursive: {})",
        profile,
        query.path,
        query.recursive
    );

    browser(&state, &profile)?
        .delete(&query.path, query.recursive)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
