//! Batch upload route.

use axum::{extract::State, routing::post, Json, Router};

use crate::auth::AuthApp;
use crate::error::Result;
use crate::handlers::handle_batch;
use crate::AppState;
use approver_engine::{UploadRequest, UploadResponse};

/// Create batch routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/batches", post(upload_handler))
}

/// POST /v1/batches - Store a batch of records and acknowledge it.
async fn upload_handler(
    State(state): State<AppState>,
    auth: AuthApp,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadResponse>> {
    let response = handle_batch(&state.pool, &auth.app_id, request).await?;
    Ok(Json(response))
}
