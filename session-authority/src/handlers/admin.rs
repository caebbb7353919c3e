use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use service_core::error::AppError;

use crate::{
    dtos::admin::{KeyStatusResponse, RotateKeysResponse},
    AppState,
};

/// Force a signing-key rotation
#[utoipa::path(
    post,
    path = "/admin/keys/rotate",
    responses(
        (status = 200, description = "Signing key rotated", body = RotateKeysResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 503, description = "Key store unavailable", body = ErrorResponse)
    ),
    tag = "Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn rotate_keys(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let key_id = state.keys.rotate().await?;
    tracing::info!(key_id = %key_id, "Signing key rotated by administrator");

    Ok((
        StatusCode::OK,
        Json(RotateKeysResponse {
            key_id,
            message: "Signing key rotated".to_string(),
        }),
    ))
}

/// Signing-key health and inventory
#[utoipa::path(
    get,
    path = "/admin/keys",
    responses(
        (status = 200, description = "Key status", body = KeyStatusResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    tag = "Admin",
    security(
        ("admin_api_key" = [])
    )
)]
pub async fn key_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(KeyStatusResponse {
        status: state.keys.key_status(),
        keys: state.keys.list_keys(),
    })
}
