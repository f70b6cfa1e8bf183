use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::lifecycle_error;
use crate::api::response::{ApiError, AppQuery, JSend, JSendPaginated, Pagination};
use crate::storage::models::{
    EntryStatus, FileRecord, FileSource, RecordState, StoreEntry, ORIGINAL_VARIANT,
};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct RecordResponse {
    pub byte_size: u64,
    pub created_at: String,
    pub id: String,
    pub mime_type: String,
    pub name: String,
    pub ready: bool,
    pub source: FileSource,
    pub state: RecordState,
    pub stores: Vec<StoreEntryResponse>,
    pub updated_at: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct StoreEntryResponse {
    pub attempts: u32,
    pub byte_size: Option<u64>,
    pub last_error: Option<String>,
    pub remote_id: Option<String>,
    pub required: bool,
    pub status: EntryStatus,
    pub store_name: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct ListRecordsParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub state: Option<String>,
}

fn default_limit() -> u32 {
    20
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn get_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<RecordResponse>>, ApiError> {
    let record = state.lifecycle.get(&id).map_err(lifecycle_error)?;
    Ok(JSend::success(record_to_response(&record)))
}

pub async fn list_records(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<ListRecordsParams>,
) -> Result<Json<JSendPaginated<RecordResponse>>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }
    let filter = params
        .state
        .as_deref()
        .map(str::parse::<RecordState>)
        .transpose()
        .map_err(ApiError::bad_request)?;

    let records = state.lifecycle.list(filter).map_err(lifecycle_error)?;
    let total = records.len() as u64;
    let items: Vec<RecordResponse> = records
        .iter()
        .skip(params.offset as usize)
        .take(params.limit as usize)
        .map(record_to_response)
        .collect();

    Ok(JSendPaginated::success(
        items,
        Pagination {
            limit: params.limit,
            offset: params.offset,
            total,
        },
    ))
}

// ============================================================================
// Helpers
// ============================================================================

pub(super) fn record_to_response(record: &FileRecord) -> RecordResponse {
    RecordResponse {
        byte_size: record.byte_size,
        created_at: record.created_at.to_rfc3339(),
        id: record.id.clone(),
        mime_type: record.mime_type.clone(),
        name: record.name.clone(),
        ready: record.is_ready(),
        source: record.source.clone(),
        state: record.state(),
        stores: record.stores.iter().map(entry_to_response).collect(),
        updated_at: record.updated_at.to_rfc3339(),
        url: format!("/files/{}/{}", record.id, ORIGINAL_VARIANT),
    }
}

fn entry_to_response(entry: &StoreEntry) -> StoreEntryResponse {
    StoreEntryResponse {
        attempts: entry.attempts,
        byte_size: entry.byte_size,
        last_error: entry.last_error.clone(),
        remote_id: entry.remote_id.clone(),
        required: entry.required,
        status: entry.status,
        store_name: entry.store_name.clone(),
        updated_at: entry.updated_at.to_rfc3339(),
    }
}
