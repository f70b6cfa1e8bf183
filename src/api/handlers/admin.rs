use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::api::response::{ApiError, JSend};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub in_flight: usize,
    pub status: String,
    pub stores: Vec<String>,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub files_deleted: u64,
    pub objects_orphaned: usize,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health(State(state): State<Arc<AppState>>) -> Json<JSend<HealthResponse>> {
    JSend::success(HealthResponse {
        in_flight: state.pool.in_flight(),
        status: "ok".to_string(),
        stores: state.stores.iter().map(|a| a.name().to_string()).collect(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Remove every record with its stored objects, then clear whatever the
/// database still holds.
pub async fn admin_purge(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<PurgeResponse>>, ApiError> {
    let results = state
        .lifecycle
        .remove_all()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let objects_orphaned = results
        .iter()
        .map(|(_, r)| r.as_ref().map_or(0, |o| o.orphaned.len()))
        .sum();

    let stats = state
        .db
        .purge_all()
        .map_err(|e| ApiError::internal(e.to_string()))?;

    tracing::warn!(
        files = results.len(),
        leftover = stats.files,
        "Purged all data"
    );

    Ok(JSend::success(PurgeResponse {
        files_deleted: results.len() as u64 + stats.files,
        objects_orphaned,
    }))
}
