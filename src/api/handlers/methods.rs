//! RPC-style lifecycle methods, mounted under `/methods`.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::lifecycle_error;
use super::records::{record_to_response, RecordResponse};
use crate::api::response::{ApiError, AppJson, JSend};
use crate::lifecycle::{RemoveOutcome, UploadDescriptor};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct InsertRemoteRequest {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct IdRequest {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct RemoveAllItem {
    pub id: String,
    pub removed: bool,
    pub orphaned: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RemoveAllResponse {
    pub failed: usize,
    pub items: Vec<RemoveAllItem>,
    pub removed: usize,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn insert_remote_image(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<InsertRemoteRequest>,
) -> Result<Json<JSend<RecordResponse>>, ApiError> {
    let record = state
        .lifecycle
        .insert_from_url(&req.url)
        .map_err(lifecycle_error)?;
    Ok(JSend::success(record_to_response(&record)))
}

pub async fn insert_uploaded_image(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<UploadDescriptor>,
) -> Result<Json<JSend<RecordResponse>>, ApiError> {
    let record = state
        .lifecycle
        .insert_from_upload(&req)
        .map_err(lifecycle_error)?;
    Ok(JSend::success(record_to_response(&record)))
}

pub async fn remove_image(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<IdRequest>,
) -> Result<Json<JSend<RemoveOutcome>>, ApiError> {
    let outcome = state
        .lifecycle
        .remove(&req.id)
        .await
        .map_err(lifecycle_error)?;
    Ok(JSend::success(outcome))
}

pub async fn remove_all_images(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<RemoveAllResponse>>, ApiError> {
    let results = state
        .lifecycle
        .remove_all()
        .await
        .map_err(lifecycle_error)?;

    let items: Vec<RemoveAllItem> = results
        .into_iter()
        .map(|(id, result)| match result {
            Ok(outcome) => RemoveAllItem {
                id,
                removed: true,
                orphaned: outcome.orphaned,
                error: None,
            },
            Err(e) => RemoveAllItem {
                id,
                removed: false,
                orphaned: Vec::new(),
                error: Some(e.to_string()),
            },
        })
        .collect();
    let removed = items.iter().filter(|i| i.removed).count();

    Ok(JSend::success(RemoveAllResponse {
        failed: items.len() - removed,
        items,
        removed,
    }))
}

pub async fn clone_image(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<IdRequest>,
) -> Result<Json<JSend<RecordResponse>>, ApiError> {
    let record = state
        .lifecycle
        .clone_file(&req.id)
        .await
        .map_err(lifecycle_error)?;
    Ok(JSend::success(record_to_response(&record)))
}
