//! User model - password-authenticated accounts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// User status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Pending,
    Active,
    Suspended,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Pending => "pending",
            UserStatus::Active => "active",
            UserStatus::Suspended => "suspended",
        }
    }
}

impl std::str::FromStr for UserStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UserStatus::Pending),
            "active" => Ok(UserStatus::Active),
            "suspended" => Ok(UserStatus::Suspended),
            _ => Err(format!("Invalid user status: {}", s)),
        }
    }
}

/// User entity. Soft-deleted rows (`deleted_utc` set) are never returned by
/// the stores.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: Uuid,
    pub email: String,
    pub password_hash: Option<String>,
    pub status: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

impl User {
    /// Create a new user awaiting email verification.
    pub fn new(email: &str, password_hash: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            email: normalize_email(email),
            password_hash,
            status: UserStatus::Pending.as_str().to_string(),
            created_utc: now,
            updated_utc: now,
            deleted_utc: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active.as_str() && self.deleted_utc.is_none()
    }

    pub fn email_verified(&self) -> bool {
        self.status != UserStatus::Pending.as_str()
    }
}

/// Emails are unique case-insensitively.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// User fields safe to return to clients.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserSummary {
    pub user_id: Uuid,
    pub email: String,
    pub status: String,
    pub created_utc: DateTime<Utc>,
}

impl From<&User> for UserSummary {
    fn from(u: &User) -> Self {
        Self {
            user_id: u.user_id,
            email: u.email.clone(),
            status: u.status.clone(),
            created_utc: u.created_utc,
        }
    }
}
