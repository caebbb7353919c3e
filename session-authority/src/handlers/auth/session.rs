use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    dtos::{
        auth::{
            LoginRequest, LoginResponse, RefreshRequest, RevokeAllResponse,
            RevokeSessionResponse, SessionListResponse,
        },
        MessageResponse,
    },
    handlers::ClientContext,
    middleware::AuthUser,
    models::RevokeReason,
    services::{identity::CaptchaSubmission, LoginAttempt, MfaProof},
    utils::{Password, ValidatedJson},
    AppState,
};

/// Login with email and password
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = LoginResponse),
        (status = 400, description = "CAPTCHA required or failed", body = ErrorResponse),
        (status = 401, description = "Invalid credentials or MFA required", body = ErrorResponse),
        (status = 403, description = "Account not active", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<AppState>,
    client: ClientContext,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let captcha = match (req.captcha_provider, req.captcha_token) {
        (Some(provider), Some(token)) => Some(CaptchaSubmission { provider, token }),
        _ => None,
    };
    let mfa = req
        .mfa_code
        .map(MfaProof::Totp)
        .or(req.recovery_code.map(MfaProof::RecoveryCode));

    let outcome = state
        .identity
        .login(LoginAttempt {
            email: req.email,
            password: Password::new(req.password),
            device: req.device,
            ip_address: client.ip_address,
            user_agent: client.user_agent,
            captcha,
            mfa,
        })
        .await?;

    Ok((
        StatusCode::OK,
        Json(LoginResponse {
            user: outcome.user,
            session_id: outcome.session_id,
            access_token: outcome.tokens.access_token,
            refresh_token: outcome.tokens.refresh_token,
            token_type: outcome.tokens.token_type,
            expires_in: outcome.tokens.expires_in,
            roles: outcome.roles,
            permissions: outcome.permissions,
        }),
    ))
}

/// Exchange a refresh token for a new token pair
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Token refreshed successfully", body = TokenResponse),
        (status = 401, description = "Invalid, expired or reused refresh token", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn refresh(
    State(state): State<AppState>,
    client: ClientContext,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let rotated = state
        .ledger
        .rotate(&req.refresh_token, client.ip_address, client.user_agent)
        .await?;
    Ok((StatusCode::OK, Json(rotated.tokens)))
}

/// End the session the access token belongs to
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logged out successfully", body = MessageResponse),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "Sessions",
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn logout(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let claims = user.0;
    let user_id = claims.user_id()?;
    if let Some(session_id) = claims.sid {
        state
            .ledger
            .revoke_owned(user_id, session_id, RevokeReason::Logout)
            .await?;
    }
    Ok((
        StatusCode::OK,
        Json(MessageResponse {
            message: "Logged out successfully".to_string(),
        }),
    ))
}

/// List the caller's live sessions
#[utoipa::path(
    get,
    path = "/auth/sessions",
    responses(
        (status = 200, description = "Active sessions", body = SessionListResponse),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "Sessions",
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let sessions = state.ledger.list_active_sessions(user.0.user_id()?).await?;
    Ok(Json(SessionListResponse { sessions }))
}

/// Revoke one of the caller's sessions
#[utoipa::path(
    delete,
    path = "/auth/sessions/{session_id}",
    params(
        ("session_id" = Uuid, Path, description = "Session to revoke")
    ),
    responses(
        (status = 200, description = "Session revoked (or already revoked)", body = RevokeSessionResponse),
        (status = 401, description = "Invalid token", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    tag = "Sessions",
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn revoke_session(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .ledger
        .revoke_owned(user.0.user_id()?, session_id, RevokeReason::UserRevoked)
        .await?;
    Ok(Json(RevokeSessionResponse { session_id, outcome }))
}

/// Sign out everywhere
#[utoipa::path(
    post,
    path = "/auth/sessions/revoke-all",
    responses(
        (status = 200, description = "All sessions revoked", body = RevokeAllResponse),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "Sessions",
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn revoke_all_sessions(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let revoked = state
        .ledger
        .revoke_all_for_user(user.0.user_id()?, RevokeReason::SignOutEverywhere)
        .await?;
    Ok(Json(RevokeAllResponse { revoked }))
}
