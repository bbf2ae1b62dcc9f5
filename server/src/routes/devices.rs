//! Device record routes.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};

use crate::auth::AuthApp;
use crate::error::Result;
use crate::handlers::{handle_records, RecordsQuery, RecordsResponse};
use crate::AppState;

/// Create device routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/devices/{device_id}/records", get(records_handler))
}

/// GET /v1/devices/{device_id}/records - Page through a device's records.
async fn records_handler(
    State(state): State<AppState>,
    auth: AuthApp,
    Path(device_id): Path<String>,
    Query(query): Query<RecordsQuery>,
) -> Result<Json<RecordsResponse>> {
    let response = handle_records(&state.pool, &auth.app_id, &device_id, query).await?;
    Ok(Json(response))
}
