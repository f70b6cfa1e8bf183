use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use super::download_error;
use crate::api::response::ApiError;
use crate::downloads::ByteRangeSpec;
use crate::AppState;

/// Serve a stored variant of a file record.
/// Route: GET /files/:id/:variant
pub async fn serve_file(
    State(state): State<Arc<AppState>>,
    Path((id, variant)): Path<(String, String)>,
    request_headers: HeaderMap,
) -> Result<Response, ApiError> {
    let range = request_headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ByteRangeSpec::parse);

    let download = state
        .downloads
        .serve(&id, &variant, range)
        .await
        .map_err(download_error)?;

    let status = if download.range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let length = download.data.len() as u64;
    let mut response = (status, download.data).into_response();
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        download
            .content_type
            .parse()
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some((start, end)) = download.range {
        if let Ok(value) = format!("bytes {start}-{end}/{}", download.total_size).parse() {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }

    let filename = download.name.replace('"', "");
    if let Ok(value) = format!("inline; filename=\"{filename}\"").parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = download.cache_control.parse() {
        headers.insert(header::CACHE_CONTROL, value);
    }

    tracing::debug!(
        file_id = %download.file_id,
        store = %download.store_name,
        bytes = length,
        "Served file"
    );
    Ok(response)
}
