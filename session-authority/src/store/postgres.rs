//! PostgreSQL store.
//!
//! Queries are checked at runtime (`query_as::<_, T>`), so the crate builds
//! without a live database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::{
    AuditStore, DeviceStore, GrantStore, SessionStore, SigningKeyStore, StoreResult, UserStore,
};
use crate::models::{
    ActiveSession, AuthEvent, AuthorizationCode, DelegatedRefreshToken, Device, OneTimeToken,
    RetiredRefreshToken, RevocationOutcome, Session, SigningKey, TokenPurpose, TokenRotation, User,
    UserStatus,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn create_user(&self, user: &User) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, email, password_hash, status, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user.user_id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.status)
        .bind(user.created_utc)
        .bind(user.updated_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE lower(email) = lower($1) AND deleted_utc IS NULL",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1 AND deleted_utc IS NULL")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn set_user_status(
        &self,
        user_id: Uuid,
        status: UserStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE users SET status = $2, updated_utc = $3 WHERE user_id = $1 AND deleted_utc IS NULL",
        )
        .bind(user_id)
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_password_hash(
        &self,
        user_id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $2, updated_utc = $3 WHERE user_id = $1 AND deleted_utc IS NULL",
        )
        .bind(user_id)
        .bind(password_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl DeviceStore for PgStore {
    async fn upsert_device(&self, device: &Device) -> StoreResult<Uuid> {
        let device_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO devices (device_id, user_id, platform, device_handle, signals, first_seen_utc, last_seen_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, device_handle) DO UPDATE
                SET signals = EXCLUDED.signals, last_seen_utc = EXCLUDED.last_seen_utc
            RETURNING device_id
            "#,
        )
        .bind(device.device_id)
        .bind(device.user_id)
        .bind(&device.platform)
        .bind(&device.device_handle)
        .bind(&device.signals)
        .bind(device.first_seen_utc)
        .bind(device.last_seen_utc)
        .fetch_one(&self.pool)
        .await?;
        Ok(device_id)
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, user_id, family_id, current_token_id, token_hash, device_id,
                ip_address, user_agent, created_utc, last_used_utc, expiry_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(session.session_id)
        .bind(session.user_id)
        .bind(session.family_id)
        .bind(session.current_token_id)
        .bind(&session.token_hash)
        .bind(session.device_id)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(session.created_utc)
        .bind(session.last_used_utc)
        .bind(session.expiry_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn install_token_hash(
        &self,
        session_id: Uuid,
        token_id: Uuid,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET token_hash = $3
            WHERE session_id = $1 AND current_token_id = $2
              AND revoked_utc IS NULL AND expiry_utc > $4
            "#,
        )
        .bind(session_id)
        .bind(token_id)
        .bind(token_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_session(&self, session_id: Uuid) -> StoreResult<Option<Session>> {
        Ok(
            sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE session_id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        Ok(
            sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE token_hash = $1 LIMIT 1")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_retired_token(&self, token_hash: &str) -> StoreResult<Option<RetiredRefreshToken>> {
        Ok(sqlx::query_as::<_, RetiredRefreshToken>(
            "SELECT * FROM retired_refresh_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn rotate_session_token(
        &self,
        rotation: &TokenRotation,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE sessions
            SET current_token_id = $3,
                token_hash = $4,
                last_used_utc = $5,
                ip_address = COALESCE($6, ip_address),
                user_agent = COALESCE($7, user_agent)
            WHERE session_id = $1 AND current_token_id = $2
              AND revoked_utc IS NULL AND expiry_utc > $8
            "#,
        )
        .bind(rotation.session_id)
        .bind(rotation.expected_token_id)
        .bind(rotation.new_token_id)
        .bind(&rotation.new_token_hash)
        .bind(rotation.used_utc)
        .bind(&rotation.ip_address)
        .bind(&rotation.user_agent)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO retired_refresh_tokens (token_hash, token_id, session_id, family_id, retired_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&rotation.retired_token_hash)
        .bind(rotation.expected_token_id)
        .bind(rotation.session_id)
        .bind(rotation.family_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_token_reuse(&self, session_id: Uuid, replayed_token_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            "UPDATE sessions SET reused_token_id_of = $2 WHERE session_id = $1 AND reused_token_id_of IS NULL",
        )
        .bind(session_id)
        .bind(replayed_token_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RevocationOutcome>> {
        let updated = sqlx::query(
            r#"
            UPDATE sessions SET revoked_utc = $3, revoked_reason = $2
            WHERE session_id = $1 AND revoked_utc IS NULL
            "#,
        )
        .bind(session_id)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(Some(RevocationOutcome::Revoked));
        }

        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT session_id FROM sessions WHERE session_id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(exists.map(|_| RevocationOutcome::AlreadyRevoked))
    }

    async fn revoke_family(&self, family_id: Uuid, reason: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET revoked_utc = $3, revoked_reason = $2
            WHERE family_id = $1 AND revoked_utc IS NULL
            "#,
        )
        .bind(family_id)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_user_sessions(
        &self,
        user_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET revoked_utc = $3, revoked_reason = $2
            WHERE user_id = $1 AND revoked_utc IS NULL
            "#,
        )
        .bind(user_id)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_active_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ActiveSession>> {
        Ok(sqlx::query_as::<_, ActiveSession>(
            r#"
            SELECT s.session_id, s.device_id, d.platform, s.ip_address, s.user_agent,
                   s.created_utc, s.last_used_utc, s.expiry_utc
            FROM sessions s
            LEFT JOIN devices d ON s.device_id = d.device_id
            WHERE s.user_id = $1 AND s.revoked_utc IS NULL AND s.expiry_utc > $2
            ORDER BY s.last_used_utc DESC
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn purge_expired_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        // retired_refresh_tokens rows cascade
        let result = sqlx::query("DELETE FROM sessions WHERE expiry_utc < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SigningKeyStore for PgStore {
    async fn load_signing_keys(&self) -> StoreResult<Vec<SigningKey>> {
        Ok(
            sqlx::query_as::<_, SigningKey>("SELECT * FROM signing_keys ORDER BY created_utc")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn activate_signing_key(&self, key: &SigningKey) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE signing_keys SET is_active = FALSE WHERE is_active")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO signing_keys (key_id, secret, created_utc, expiry_utc, is_active)
            VALUES ($1, $2, $3, $4, TRUE)
            "#,
        )
        .bind(&key.key_id)
        .bind(&key.secret)
        .bind(key.created_utc)
        .bind(key.expiry_utc)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_signing_keys_expired_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        Ok(sqlx::query_scalar(
            "DELETE FROM signing_keys WHERE NOT is_active AND expiry_utc < $1 RETURNING key_id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl GrantStore for PgStore {
    async fn insert_authorization_code(&self, code: &AuthorizationCode) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO authorization_codes (
                code_hash, user_id, client_id, redirect_uri, scopes, code_challenge,
                challenge_method, created_utc, expiry_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&code.code_hash)
        .bind(code.user_id)
        .bind(&code.client_id)
        .bind(&code.redirect_uri)
        .bind(&code.scopes)
        .bind(&code.code_challenge)
        .bind(&code.challenge_method)
        .bind(code.created_utc)
        .bind(code.expiry_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_authorization_code(
        &self,
        code_hash: &str,
    ) -> StoreResult<Option<AuthorizationCode>> {
        Ok(sqlx::query_as::<_, AuthorizationCode>(
            "SELECT * FROM authorization_codes WHERE code_hash = $1",
        )
        .bind(code_hash)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn redeem_authorization_code(
        &self,
        code_hash: &str,
        issued: &DelegatedRefreshToken,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE authorization_codes SET used_utc = $2
            WHERE code_hash = $1 AND used_utc IS NULL AND expiry_utc > $2
            "#,
        )
        .bind(code_hash)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_delegated_token(&mut tx, issued).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn find_delegated_refresh_token(
        &self,
        token_hash: &str,
    ) -> StoreResult<Option<DelegatedRefreshToken>> {
        Ok(sqlx::query_as::<_, DelegatedRefreshToken>(
            "SELECT * FROM delegated_refresh_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn consume_delegated_refresh_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delegated_refresh_tokens SET used_utc = $2
            WHERE token_hash = $1 AND used_utc IS NULL AND expiry_utc > $2
            "#,
        )
        .bind(token_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn replace_delegated_refresh_token(
        &self,
        token_hash: &str,
        issued: &DelegatedRefreshToken,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE delegated_refresh_tokens SET used_utc = $2
            WHERE token_hash = $1 AND used_utc IS NULL AND expiry_utc > $2
            "#,
        )
        .bind(token_hash)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_delegated_token(&mut tx, issued).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn insert_one_time_token(&self, token: &OneTimeToken) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO one_time_tokens (token_hash, user_id, purpose, created_utc, expiry_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&token.token_hash)
        .bind(token.user_id)
        .bind(&token.purpose)
        .bind(token.created_utc)
        .bind(token.expiry_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_one_time_token(
        &self,
        token_hash: &str,
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<OneTimeToken>> {
        Ok(sqlx::query_as::<_, OneTimeToken>(
            r#"
            UPDATE one_time_tokens SET used_utc = $3
            WHERE token_hash = $1 AND purpose = $2 AND used_utc IS NULL AND expiry_utc > $3
            RETURNING *
            "#,
        )
        .bind(token_hash)
        .bind(purpose.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn purge_expired_grants(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for table in [
            "authorization_codes",
            "delegated_refresh_tokens",
            "one_time_tokens",
        ] {
            removed += sqlx::query(&format!("DELETE FROM {} WHERE expiry_utc < $1", table))
                .bind(cutoff)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }
}

async fn insert_delegated_token(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    token: &DelegatedRefreshToken,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO delegated_refresh_tokens (token_hash, user_id, client_id, scopes, created_utc, expiry_utc)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&token.token_hash)
    .bind(token.user_id)
    .bind(&token.client_id)
    .bind(&token.scopes)
    .bind(token.created_utc)
    .bind(token.expiry_utc)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append_event(&self, event: &AuthEvent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_events (event_id, user_id, event_type, success, details, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.event_id)
        .bind(event.user_id)
        .bind(&event.event_type)
        .bind(event.success)
        .bind(&event.details)
        .bind(event.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_events_for_user(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<AuthEvent>> {
        Ok(sqlx::query_as::<_, AuthEvent>(
            "SELECT * FROM auth_events WHERE user_id = $1 ORDER BY created_utc DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }
}
