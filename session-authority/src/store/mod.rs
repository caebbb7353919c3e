//! Persistence contract for the authority.
//!
//! Every exactly-once transition (refresh rotation, code and delegated-token
//! consumption, one-time tokens) is a single conditional write: the `bool` or
//! `Option` result reports whether this caller won it. Losing is terminal for
//! the caller and never retried.
//!
//! Two backends implement the traits: [`PgStore`] for production and
//! [`MemoryStore`] for tests and local runs.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{future::Future, time::Duration};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    ActiveSession, AuthEvent, AuthorizationCode, DelegatedRefreshToken, Device, OneTimeToken,
    RetiredRefreshToken, RevocationOutcome, Session, SigningKey, TokenPurpose, TokenRotation, User,
    UserStatus,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store call exceeded {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if matches!(
            err,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
        ) {
            return StoreError::Unavailable(err.to_string());
        }
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return StoreError::Conflict(db.message().to_string());
            }
        }
        if matches!(err, sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)) {
            return StoreError::Corrupt(err.to_string());
        }
        StoreError::Database(err)
    }
}

/// Run a store call under a deadline.
pub async fn bounded<T, F>(limit: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when the email is taken.
    async fn create_user(&self, user: &User) -> StoreResult<()>;
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn find_user_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>>;
    async fn set_user_status(
        &self,
        user_id: Uuid,
        status: UserStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;
    async fn set_password_hash(
        &self,
        user_id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Insert or refresh a device keyed by `(user_id, device_handle)`;
    /// returns the stored device id.
    async fn upsert_device(&self, device: &Device) -> StoreResult<Uuid>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> StoreResult<()>;

    /// Install the hash of a freshly issued refresh token for `token_id` on a
    /// live session. Returns false if the session moved on or was revoked.
    async fn install_token_hash(
        &self,
        session_id: Uuid,
        token_id: Uuid,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn find_session(&self, session_id: Uuid) -> StoreResult<Option<Session>>;

    /// Session whose current refresh-token hash matches, in any state.
    async fn find_session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Session>>;

    async fn find_retired_token(&self, token_hash: &str) -> StoreResult<Option<RetiredRefreshToken>>;

    /// Conditionally rotate the session's refresh token and retire the old
    /// hash in one transaction. Returns false if the session no longer holds
    /// `expected_token_id`, is revoked, or has expired.
    async fn rotate_session_token(
        &self,
        rotation: &TokenRotation,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Record the replayed token id on the session; the first marker wins.
    async fn mark_token_reuse(&self, session_id: Uuid, replayed_token_id: Uuid) -> StoreResult<()>;

    /// `None` when no such session exists.
    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RevocationOutcome>>;

    async fn revoke_family(&self, family_id: Uuid, reason: &str, now: DateTime<Utc>) -> StoreResult<u64>;

    async fn revoke_user_sessions(
        &self,
        user_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Non-revoked, unexpired sessions, most recently used first.
    async fn list_active_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ActiveSession>>;

    /// Delete sessions (and their retired hashes) that expired before `cutoff`.
    async fn purge_expired_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait SigningKeyStore: Send + Sync {
    async fn load_signing_keys(&self) -> StoreResult<Vec<SigningKey>>;

    /// Deactivate the current key and insert `key` as the active one, in one
    /// transaction.
    async fn activate_signing_key(&self, key: &SigningKey) -> StoreResult<()>;

    /// Hard-delete keys that expired before `cutoff`; returns their ids.
    async fn delete_signing_keys_expired_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<String>>;
}

#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn insert_authorization_code(&self, code: &AuthorizationCode) -> StoreResult<()>;
    async fn find_authorization_code(&self, code_hash: &str)
        -> StoreResult<Option<AuthorizationCode>>;
    /// Marks the code used and stores `issued` in one transaction. False
    /// if the code was already used or expired; nothing is written then.
    async fn redeem_authorization_code(
        &self,
        code_hash: &str,
        issued: &DelegatedRefreshToken,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn find_delegated_refresh_token(
        &self,
        token_hash: &str,
    ) -> StoreResult<Option<DelegatedRefreshToken>>;
    /// Atomic `unused -> used`; false if already used or expired.
    async fn consume_delegated_refresh_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;
    /// Consumes `token_hash` and stores its replacement in one
    /// transaction. Same outcome rules as [`Self::redeem_authorization_code`].
    async fn replace_delegated_refresh_token(
        &self,
        token_hash: &str,
        issued: &DelegatedRefreshToken,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn insert_one_time_token(&self, token: &OneTimeToken) -> StoreResult<()>;
    /// Atomic consume; returns the token if this call used it.
    async fn consume_one_time_token(
        &self,
        token_hash: &str,
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<OneTimeToken>>;

    /// Delete codes and tokens that expired before `cutoff`.
    async fn purge_expired_grants(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_event(&self, event: &AuthEvent) -> StoreResult<()>;
    async fn list_events_for_user(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<AuthEvent>>;
}

/// Everything the authority persists.
pub trait AuthorityStore:
    UserStore + DeviceStore + SessionStore + SigningKeyStore + GrantStore + AuditStore
{
}

impl<T> AuthorityStore for T where
    T: UserStore + DeviceStore + SessionStore + SigningKeyStore + GrantStore + AuditStore
{
}
