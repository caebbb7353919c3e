//! Auth event model - append-only security audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthEventType {
    Register,
    EmailVerified,
    Login,
    Refresh,
    TokenReuse,
    Logout,
    SessionRevoked,
    SessionRevokeFamily,
    SessionRevokeAll,
    PasswordResetRequested,
    PasswordReset,
    CodeIssued,
    CodeExchanged,
    DelegatedRefresh,
    DelegatedRevoke,
    KeyRotated,
}

impl AuthEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthEventType::Register => "register",
            AuthEventType::EmailVerified => "email_verified",
            AuthEventType::Login => "login",
            AuthEventType::Refresh => "refresh",
            AuthEventType::TokenReuse => "token_reuse",
            AuthEventType::Logout => "logout",
            AuthEventType::SessionRevoked => "session_revoked",
            AuthEventType::SessionRevokeFamily => "session_revoke_family",
            AuthEventType::SessionRevokeAll => "session_revoke_all",
            AuthEventType::PasswordResetRequested => "password_reset_requested",
            AuthEventType::PasswordReset => "password_reset",
            AuthEventType::CodeIssued => "code_issued",
            AuthEventType::CodeExchanged => "code_exchanged",
            AuthEventType::DelegatedRefresh => "delegated_refresh",
            AuthEventType::DelegatedRevoke => "delegated_revoke",
            AuthEventType::KeyRotated => "key_rotated",
        }
    }
}

/// Structured context attached to an event. Unset fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthEventDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

impl AuthEventDetails {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AuthEvent {
    pub event_id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub success: bool,
    pub details: Json<AuthEventDetails>,
    pub created_utc: DateTime<Utc>,
}

impl AuthEvent {
    pub fn new(
        user_id: Option<Uuid>,
        event_type: AuthEventType,
        success: bool,
        details: AuthEventDetails,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            user_id,
            event_type: event_type.as_str().to_string(),
            success,
            details: Json(details),
            created_utc: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_details_omit_unset_fields() {
        let details = AuthEventDetails {
            session_id: Some(Uuid::nil()),
            ..AuthEventDetails::reason("invalid_password")
        };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["reason"], "invalid_password");
        assert!(json.get("email").is_none());
        assert!(json.get("count").is_none());
    }
}
