//! JSend envelopes. Successes carry `data`, client mistakes are `fail` with a
//! `data.message`, and server faults are `error` with a top-level `message`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JSendStatus {
    Error,
    Fail,
    Success,
}

#[derive(Debug, Serialize)]
pub struct JSend<T: Serialize> {
    pub data: T,
    pub status: JSendStatus,
}

impl<T: Serialize> JSend<T> {
    pub fn success(data: T) -> Json<JSend<T>> {
        Json(JSend {
            data,
            status: JSendStatus::Success,
        })
    }
}

/// One page of a record listing.
#[derive(Debug, Serialize)]
pub struct JSendPaginated<T: Serialize> {
    pub data: Page<T>,
    pub status: JSendStatus,
}

#[derive(Debug, Serialize)]
pub struct Page<T: Serialize> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
    pub total: u64,
}

impl<T: Serialize> JSendPaginated<T> {
    pub fn success(items: Vec<T>, pagination: Pagination) -> Json<JSendPaginated<T>> {
        Json(JSendPaginated {
            data: Page { items, pagination },
            status: JSendStatus::Success,
        })
    }
}

#[derive(Debug, Serialize)]
struct FailBody {
    data: FailMessage,
    status: JSendStatus,
}

#[derive(Debug, Serialize)]
struct FailMessage {
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    status: JSendStatus,
}

/// Handler error. `Fail` renders a 4xx JSend fail, `Error` a 5xx JSend error.
#[derive(Debug)]
pub enum ApiError {
    Fail(StatusCode, String),
    Error(StatusCode, String),
    /// 416 with the `Content-Range: bytes */{size}` the client needs to retry.
    RangeNotSatisfiable { size: u64 },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Fail(code, message) => fail_response(code, message),
            ApiError::Error(code, message) => (
                code,
                Json(ErrorBody {
                    message,
                    status: JSendStatus::Error,
                }),
            )
                .into_response(),
            ApiError::RangeNotSatisfiable { size } => {
                let mut response = fail_response(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    "Requested range not satisfiable".to_string(),
                );
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    response.headers_mut().insert(header::CONTENT_RANGE, value);
                }
                response
            }
        }
    }
}

fn fail_response(code: StatusCode, message: String) -> Response {
    (
        code,
        Json(FailBody {
            data: FailMessage { message },
            status: JSendStatus::Fail,
        }),
    )
        .into_response()
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::BAD_REQUEST, message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::FORBIDDEN, message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::NOT_FOUND, message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::CONFLICT, message.into())
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::PAYLOAD_TOO_LARGE, message.into())
    }

    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::UNSUPPORTED_MEDIA_TYPE, message.into())
    }

    /// A tus chunk is already being written to the session.
    pub fn locked(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::LOCKED, message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Error(StatusCode::INTERNAL_SERVER_ERROR, message.into())
    }

    /// The server is shutting down and dropped the request part way.
    pub fn unavailable(message: impl Into<String>) -> Self {
        ApiError::Error(StatusCode::SERVICE_UNAVAILABLE, message.into())
    }
}

/// JSON body extractor whose rejections are JSend fails.
pub struct AppJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, ApiError> {
        let Json(params) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::bad_request(describe_json_rejection(&rejection)))?;
        Ok(AppJson(params))
    }
}

fn describe_json_rejection(rejection: &JsonRejection) -> String {
    match rejection {
        JsonRejection::JsonDataError(err) => format!("Invalid method params: {}", err.body_text()),
        JsonRejection::JsonSyntaxError(_) => "Method params are not valid JSON".into(),
        JsonRejection::MissingJsonContentType(_) => {
            "Method params must be sent as application/json".into()
        }
        _ => "Could not read method params".into(),
    }
}

/// Query string extractor (parsed with serde_qs) whose rejections are JSend fails.
pub struct AppQuery<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for AppQuery<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, ApiError> {
        serde_qs::from_str(parts.uri.query().unwrap_or_default())
            .map(AppQuery)
            .map_err(|e| {
                ApiError::bad_request(format!("Invalid query: {}", plain_types(&e.to_string())))
            })
    }
}

/// Swap Rust integer type names in deserializer messages for plain words.
fn plain_types(raw: &str) -> String {
    raw.replace("u32", "non-negative integer")
        .replace("u64", "non-negative integer")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let fail = ApiError::not_found("gone").into_response();
        assert_eq!(fail.status(), StatusCode::NOT_FOUND);

        let error = ApiError::unavailable("stopping").into_response();
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_range_not_satisfiable_carries_size() {
        let response = ApiError::RangeNotSatisfiable { size: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */42"
        );
    }

    #[test]
    fn test_plain_types() {
        assert_eq!(
            plain_types("invalid digit found in string for u32"),
            "invalid digit found in string for non-negative integer"
        );
    }
}
