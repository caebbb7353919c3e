//! Session model - one row per login, rotated in place on every refresh.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Stored in `token_hash` until the first refresh token is issued.
pub const PLACEHOLDER_TOKEN_HASH: &str = "placeholder";

#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub family_id: Uuid,
    pub current_token_id: Uuid,
    pub token_hash: String,
    pub device_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub last_used_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
    pub revoked_utc: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
    /// Token id that was replayed, set only when reuse is detected.
    pub reused_token_id_of: Option<Uuid>,
}

impl Session {
    pub fn new(
        user_id: Uuid,
        device_id: Option<Uuid>,
        ip_address: Option<String>,
        user_agent: Option<String>,
        now: DateTime<Utc>,
        lifetime: chrono::Duration,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            family_id: Uuid::new_v4(),
            current_token_id: Uuid::new_v4(),
            token_hash: PLACEHOLDER_TOKEN_HASH.to_string(),
            device_id,
            ip_address,
            user_agent,
            created_utc: now,
            last_used_utc: now,
            expiry_utc: now + lifetime,
            revoked_utc: None,
            revoked_reason: None,
            reused_token_id_of: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_utc <= now
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_utc.is_some()
    }

    /// Not revoked and not expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && !self.is_expired(now)
    }
}

/// A refresh-token hash that has been rotated away. Presenting it again is a
/// replay.
#[derive(Debug, Clone, FromRow)]
pub struct RetiredRefreshToken {
    pub token_hash: String,
    pub token_id: Uuid,
    pub session_id: Uuid,
    pub family_id: Uuid,
    pub retired_utc: DateTime<Utc>,
}

/// Conditional in-place rotation of a session's refresh token.
#[derive(Debug, Clone)]
pub struct TokenRotation {
    pub session_id: Uuid,
    pub family_id: Uuid,
    pub expected_token_id: Uuid,
    pub retired_token_hash: String,
    pub new_token_id: Uuid,
    pub new_token_hash: String,
    pub used_utc: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RevocationOutcome {
    Revoked,
    AlreadyRevoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeReason {
    Logout,
    UserRevoked,
    SignOutEverywhere,
    TokenReuse,
    PasswordReset,
    AccountInactive,
}

impl RevokeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevokeReason::Logout => "logout",
            RevokeReason::UserRevoked => "user_revoked",
            RevokeReason::SignOutEverywhere => "sign_out_everywhere",
            RevokeReason::TokenReuse => "token_reuse",
            RevokeReason::PasswordReset => "password_reset",
            RevokeReason::AccountInactive => "account_inactive",
        }
    }
}

/// Live session as listed to its owner.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, ToSchema)]
pub struct ActiveSession {
    pub session_id: Uuid,
    pub device_id: Option<Uuid>,
    pub platform: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub last_used_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_session_state() {
        let now = Utc::now();
        let session = Session::new(Uuid::new_v4(), None, None, None, now, Duration::days(30));

        assert!(session.is_active(now));
        assert_eq!(session.token_hash, PLACEHOLDER_TOKEN_HASH);
        assert_ne!(session.family_id, session.session_id);
        assert!(session.is_expired(now + Duration::days(30)));
    }
}
