use axum::{extract::State, http::header, response::IntoResponse, Json};

use crate::AppState;

/// Get JSON Web Key Set (JWKS)
#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    responses(
        (status = 200, description = "Unexpired verification keys, newest first", body = PublishedKeySet)
    ),
    tag = "Well-Known"
)]
pub async fn jwks(State(state): State<AppState>) -> impl IntoResponse {
    // Short max-age: a rotation must reach verifiers well within the grace period.
    (
        [(header::CACHE_CONTROL, "public, max-age=300")],
        Json(state.keys.published_key_set()),
    )
}

/// OpenID Connect discovery document
#[utoipa::path(
    get,
    path = "/.well-known/openid-configuration",
    responses(
        (status = 200, description = "Discovery document", body = OidcConfiguration)
    ),
    tag = "Well-Known"
)]
pub async fn openid_configuration(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "public, max-age=3600")],
        Json(state.delegated.configuration()),
    )
}
