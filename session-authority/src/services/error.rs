use service_core::error::AppError;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account is not active")]
    AccountNotActive,

    #[error("Multi-factor authentication required")]
    MfaRequired,

    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Refresh token reuse detected")]
    TokenReuseDetected,

    #[error("Invalid or expired authorization code")]
    InvalidOrExpiredCode,

    #[error("Invalid code verifier")]
    InvalidCodeVerifier,

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Invalid client: {0}")]
    InvalidClient(String),

    #[error("Unknown signing key")]
    UnknownSigningKey,

    #[error("Signing key expired")]
    ExpiredSigningKey,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Email already registered")]
    EmailAlreadyRegistered,

    #[error("CAPTCHA required")]
    CaptchaRequired,

    #[error("CAPTCHA verification failed")]
    CaptchaFailed,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store call timed out")]
    Timeout,

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout(_) => AuthError::Timeout,
            StoreError::Unavailable(msg) => AuthError::Unavailable(msg),
            StoreError::Conflict(msg) => AuthError::Conflict(msg),
            StoreError::Database(e) => AuthError::Internal(anyhow::Error::new(e)),
            StoreError::Corrupt(msg) => AuthError::Internal(anyhow::anyhow!("corrupt record: {}", msg)),
        }
    }
}

impl AuthError {
    /// RFC 6749 section 5.2 error code.
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            AuthError::InvalidOrExpiredCode
            | AuthError::InvalidCodeVerifier
            | AuthError::InvalidRefreshToken
            | AuthError::TokenReuseDetected
            | AuthError::AccountNotActive => "invalid_grant",
            AuthError::InvalidScope(_) => "invalid_scope",
            AuthError::InvalidClient(_) => "invalid_client",
            AuthError::InvalidToken
            | AuthError::UnknownSigningKey
            | AuthError::ExpiredSigningKey
            | AuthError::InvalidCredentials
            | AuthError::MfaRequired => "invalid_token",
            AuthError::Validation(_)
            | AuthError::SessionNotFound
            | AuthError::EmailAlreadyRegistered
            | AuthError::CaptchaRequired
            | AuthError::CaptchaFailed
            | AuthError::Conflict(_) => "invalid_request",
            AuthError::Timeout | AuthError::Unavailable(_) => "temporarily_unavailable",
            AuthError::Internal(_) => "server_error",
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        let message = err.to_string();
        match err {
            AuthError::InvalidCredentials
            | AuthError::MfaRequired
            | AuthError::InvalidRefreshToken
            | AuthError::TokenReuseDetected
            | AuthError::UnknownSigningKey
            | AuthError::ExpiredSigningKey
            | AuthError::InvalidToken => AppError::AuthError(anyhow::anyhow!(message)),
            AuthError::AccountNotActive => AppError::Forbidden(anyhow::anyhow!(message)),
            AuthError::InvalidOrExpiredCode
            | AuthError::InvalidCodeVerifier
            | AuthError::InvalidScope(_)
            | AuthError::InvalidClient(_)
            | AuthError::CaptchaRequired
            | AuthError::CaptchaFailed
            | AuthError::Validation(_) => AppError::BadRequest(anyhow::anyhow!(message)),
            AuthError::SessionNotFound => AppError::NotFound(anyhow::anyhow!(message)),
            AuthError::EmailAlreadyRegistered | AuthError::Conflict(_) => {
                AppError::Conflict(anyhow::anyhow!(message))
            }
            AuthError::Timeout | AuthError::Unavailable(_) => AppError::ServiceUnavailable(message),
            AuthError::Internal(e) => AppError::InternalError(e),
        }
    }
}
