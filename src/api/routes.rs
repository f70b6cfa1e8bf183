use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, head, options, patch, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.max_upload_size as usize;

    let mut router = Router::new()
        // Resumable uploads (tus)
        .route("/uploads", options(handlers::upload_options))
        .route("/uploads", post(handlers::create_upload))
        .route("/uploads/:id", head(handlers::upload_status))
        .route(
            "/uploads/:id",
            patch(handlers::upload_chunk).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/uploads/:id", delete(handlers::terminate_upload))
        // Downloads
        .route("/files/:id/:variant", get(handlers::serve_file))
        // Lifecycle methods
        .route(
            "/methods/insertRemoteImage",
            post(handlers::insert_remote_image),
        )
        .route(
            "/methods/insertUploadedImage",
            post(handlers::insert_uploaded_image),
        )
        .route("/methods/removeImage", post(handlers::remove_image))
        .route("/methods/removeAllImages", post(handlers::remove_all_images))
        .route("/methods/cloneImage", post(handlers::clone_image))
        // Records
        .route("/records", get(handlers::list_records))
        .route("/records/:id", get(handlers::get_record))
        // Internal
        .route("/_internal/health", get(handlers::health));

    // Test-only routes
    if state.config.test_mode {
        tracing::warn!("Test mode enabled, purge route is available.");
        router = router.route("/admin/purge", delete(handlers::admin_purge));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
