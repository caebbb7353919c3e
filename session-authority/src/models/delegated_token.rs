//! Delegated refresh token model - refresh grants held by third-party clients.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct DelegatedRefreshToken {
    pub token_hash: String,
    pub user_id: Uuid,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub created_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
    pub used_utc: Option<DateTime<Utc>>,
}

impl DelegatedRefreshToken {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.used_utc.is_none() && self.expiry_utc > now
    }
}
