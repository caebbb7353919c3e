//! One-time token model - email verification and password reset links.

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPurpose {
    EmailVerification,
    PasswordReset,
}

impl TokenPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenPurpose::EmailVerification => "email_verification",
            TokenPurpose::PasswordReset => "password_reset",
        }
    }

    pub fn lifetime(&self) -> Duration {
        match self {
            TokenPurpose::EmailVerification => Duration::hours(24),
            TokenPurpose::PasswordReset => Duration::hours(1),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct OneTimeToken {
    pub token_hash: String,
    pub user_id: Uuid,
    pub purpose: String,
    pub created_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
    pub used_utc: Option<DateTime<Utc>>,
}

impl OneTimeToken {
    pub fn new(token_hash: String, user_id: Uuid, purpose: TokenPurpose, now: DateTime<Utc>) -> Self {
        Self {
            token_hash,
            user_id,
            purpose: purpose.as_str().to_string(),
            created_utc: now,
            expiry_utc: now + purpose.lifetime(),
            used_utc: None,
        }
    }
}
