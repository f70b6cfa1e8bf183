//! tus 1.0.0 resumable upload endpoints (core, creation and termination).

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::sync::Arc;

use super::upload_error;
use crate::api::response::ApiError;
use crate::uploads::UploadMetadata;
use crate::AppState;

const TUS_VERSION: &str = "1.0.0";
const TUS_EXTENSIONS: &str = "creation,termination";
const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
const TUS_VERSION_HEADER: HeaderName = HeaderName::from_static("tus-version");
const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
const TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");

// ============================================================================
// Handlers
// ============================================================================

/// Route: OPTIONS /uploads
pub async fn upload_options(State(state): State<Arc<AppState>>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    headers.insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION));
    headers.insert(TUS_EXTENSION, HeaderValue::from_static(TUS_EXTENSIONS));
    headers.insert(TUS_MAX_SIZE, HeaderValue::from(state.temp.max_size()));
    response
}

/// Route: POST /uploads
pub async fn create_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_version(&headers)?;

    let length = numeric_header(&headers, &UPLOAD_LENGTH)?
        .ok_or_else(|| ApiError::bad_request("Upload-Length header is required"))?;
    let metadata = match headers.get(&UPLOAD_METADATA) {
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| ApiError::bad_request("Upload-Metadata must be ASCII"))?;
            UploadMetadata::parse(raw).map_err(upload_error)?
        }
        None => UploadMetadata::default(),
    };

    let session = state
        .temp
        .create(length, metadata)
        .await
        .map_err(upload_error)?;

    let mut response = StatusCode::CREATED.into_response();
    let out = response.headers_mut();
    out.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    out.insert(UPLOAD_OFFSET, HeaderValue::from(session.offset()));
    if let Ok(location) = HeaderValue::from_str(&format!("/uploads/{}", session.id)) {
        out.insert(header::LOCATION, location);
    }

    tracing::debug!(upload_id = %session.id, length, "Created upload");
    Ok(response)
}

/// Route: HEAD /uploads/:id
pub async fn upload_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state
        .temp
        .get(&id)
        .ok_or_else(|| ApiError::not_found("Upload not found"))?;

    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    headers.insert(UPLOAD_OFFSET, HeaderValue::from(session.offset()));
    headers.insert(UPLOAD_LENGTH, HeaderValue::from(session.total_size));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

/// Route: PATCH /uploads/:id
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    check_version(&headers)?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.eq_ignore_ascii_case(OFFSET_CONTENT_TYPE) {
        return Err(ApiError::unsupported_media_type(format!(
            "Content-Type must be {OFFSET_CONTENT_TYPE}"
        )));
    }
    let offset = numeric_header(&headers, &UPLOAD_OFFSET)?
        .ok_or_else(|| ApiError::bad_request("Upload-Offset header is required"))?;

    let new_offset = state
        .temp
        .write_chunk(&id, offset, body)
        .await
        .map_err(upload_error)?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    let out = response.headers_mut();
    out.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    out.insert(UPLOAD_OFFSET, HeaderValue::from(new_offset));
    Ok(response)
}

/// Route: DELETE /uploads/:id
pub async fn terminate_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_version(&headers)?;
    if state.temp.get(&id).is_some_and(|s| s.claimed) {
        return Err(ApiError::conflict(
            "Upload belongs to a file record; remove the record instead",
        ));
    }
    state.temp.terminate(&id).await.map_err(upload_error)?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    response
        .headers_mut()
        .insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    Ok(response)
}

// ============================================================================
// Helpers
// ============================================================================

/// Requests that name a protocol version must name ours.
fn check_version(headers: &HeaderMap) -> Result<(), ApiError> {
    match headers.get(&TUS_RESUMABLE) {
        Some(v) if v.as_bytes() != TUS_VERSION.as_bytes() => Err(ApiError::Fail(
            StatusCode::PRECONDITION_FAILED,
            format!("Unsupported tus version; this server speaks {TUS_VERSION}"),
        )),
        _ => Ok(()),
    }
}

fn numeric_header(headers: &HeaderMap, name: &HeaderName) -> Result<Option<u64>, ApiError> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| {
                    ApiError::bad_request(format!("{name} must be a non-negative integer"))
                })
        })
        .transpose()
}
