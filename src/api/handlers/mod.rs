mod admin;
mod downloads;
mod methods;
mod records;
mod uploads;

use crate::api::response::ApiError;
use crate::downloads::DownloadError;
use crate::lifecycle::LifecycleError;
use crate::uploads::UploadError;

pub use admin::{admin_purge, health};
pub use downloads::serve_file;
pub use methods::{
    clone_image, insert_remote_image, insert_uploaded_image, remove_all_images, remove_image,
};
pub use records::{get_record, list_records};
pub use uploads::{create_upload, terminate_upload, upload_chunk, upload_options, upload_status};

/// Map an UploadError to an ApiError
fn upload_error(e: UploadError) -> ApiError {
    match e {
        UploadError::NotFound(_) => ApiError::not_found("Upload not found"),
        UploadError::OffsetMismatch { .. }
        | UploadError::Incomplete(_)
        | UploadError::AlreadyClaimed(_) => ApiError::conflict(e.to_string()),
        UploadError::ChunkTooLarge { .. } | UploadError::TooLarge { .. } => {
            ApiError::payload_too_large(e.to_string())
        }
        UploadError::Busy(_) => ApiError::locked(e.to_string()),
        UploadError::Rejected(_) => ApiError::forbidden(e.to_string()),
        UploadError::InvalidMetadata(_) => ApiError::bad_request(e.to_string()),
        UploadError::Io(_) => ApiError::internal(e.to_string()),
    }
}

fn download_error(e: DownloadError) -> ApiError {
    match e {
        DownloadError::NotFound(_) => ApiError::not_found("File not found"),
        DownloadError::RangeNotSatisfiable { size } => ApiError::RangeNotSatisfiable { size },
        DownloadError::Store(_) | DownloadError::Database(_) => ApiError::internal(e.to_string()),
    }
}

/// Map a LifecycleError to an ApiError
fn lifecycle_error(e: LifecycleError) -> ApiError {
    match e {
        LifecycleError::Validation(message) => ApiError::bad_request(message),
        LifecycleError::NotFound(_) => ApiError::not_found("File not found"),
        LifecycleError::Interrupted(_) => ApiError::unavailable(e.to_string()),
        LifecycleError::Upload(e) => upload_error(e),
        LifecycleError::Download(e) => download_error(e),
        LifecycleError::Database(_) => ApiError::internal(e.to_string()),
    }
}
