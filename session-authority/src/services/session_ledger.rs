//! Sessions, refresh-token rotation and reuse detection.
//!
//! A session row carries the hash of exactly one current refresh token.
//! Rotation replaces it in place with a conditional update and retires the
//! old hash; presenting a retired hash, or losing the conditional update,
//! revokes the whole family.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::AuthorityConfig;
use crate::models::{
    ActiveSession, AuthEventDetails, AuthEventType, RevocationOutcome, RevokeReason, Session,
    TokenRotation, User,
};
use crate::services::{AuditTrail, AuthError, KeyAuthority};
use crate::store::{bounded, SessionStore, UserStore};
use crate::utils::{generate_opaque_token, now_utc, TokenHasher};

/// Expired sessions are kept this long before being purged.
const EXPIRED_SESSION_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<Uuid>,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl AccessClaims {
    pub fn user_id(&self) -> Result<Uuid, AuthError> {
        Uuid::parse_str(&self.sub).map_err(|_| AuthError::InvalidToken)
    }

    pub fn scopes(&self) -> Vec<&str> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub session: Session,
    pub tokens: TokenResponse,
}

#[derive(Debug, Clone)]
pub struct RotatedSession {
    pub user: User,
    pub session: Session,
    pub tokens: TokenResponse,
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub issuer: String,
    pub audience: String,
    pub access_ttl: Duration,
    pub refresh_lifetime: Duration,
    pub store_timeout: std::time::Duration,
}

impl LedgerSettings {
    pub fn from_config(config: &AuthorityConfig) -> Self {
        Self {
            issuer: config.jwt.issuer.clone(),
            audience: config.jwt.audience.clone(),
            access_ttl: Duration::minutes(config.jwt.access_token_expiry_minutes),
            refresh_lifetime: Duration::days(config.jwt.refresh_token_expiry_days),
            store_timeout: std::time::Duration::from_millis(config.store.timeout_ms),
        }
    }
}

pub struct SessionLedger {
    users: Arc<dyn UserStore>,
    sessions: Arc<dyn SessionStore>,
    keys: Arc<KeyAuthority>,
    hasher: TokenHasher,
    audit: AuditTrail,
    settings: LedgerSettings,
}

impl SessionLedger {
    pub fn new(
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
        keys: Arc<KeyAuthority>,
        hasher: TokenHasher,
        audit: AuditTrail,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            users,
            sessions,
            keys,
            hasher,
            audit,
            settings,
        }
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    pub async fn create_session(
        &self,
        user_id: Uuid,
        device_id: Option<Uuid>,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<SessionGrant, AuthError> {
        let session = Session::new(
            user_id,
            device_id,
            ip_address,
            user_agent,
            now_utc(),
            self.settings.refresh_lifetime,
        );
        bounded(self.settings.store_timeout, self.sessions.insert_session(&session)).await?;

        let tokens = self.issue_tokens(&session).await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session.session_id,
            family_id = %session.family_id,
            "Session created"
        );

        Ok(SessionGrant { session, tokens })
    }

    /// Mint an access token and a fresh refresh token for the session's
    /// current token id. Only the refresh token's hash is stored.
    pub async fn issue_tokens(&self, session: &Session) -> Result<TokenResponse, AuthError> {
        let refresh_token = generate_opaque_token();
        let token_hash = self.hasher.hash(&refresh_token);

        let installed = bounded(
            self.settings.store_timeout,
            self.sessions.install_token_hash(
                session.session_id,
                session.current_token_id,
                &token_hash,
                now_utc(),
            ),
        )
        .await?;
        if !installed {
            return Err(AuthError::InvalidRefreshToken);
        }

        let access_token = self.mint_access_token(session.user_id, session.session_id)?;
        Ok(self.token_response(access_token, refresh_token))
    }

    pub async fn rotate(
        &self,
        presented: &str,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<RotatedSession, AuthError> {
        let timeout = self.settings.store_timeout;
        let now = now_utc();
        let presented_hash = self.hasher.hash(presented);

        // Current hash first: the rotation that replaces it writes the
        // retired row in the same transaction, so a miss here is visible there.
        let current =
            bounded(timeout, self.sessions.find_session_by_token_hash(&presented_hash)).await?;
        let session = match current {
            Some(session) => session,
            None => {
                let retired =
                    bounded(timeout, self.sessions.find_retired_token(&presented_hash))
                        .await?
                        .ok_or(AuthError::InvalidRefreshToken)?;
                let owner =
                    bounded(timeout, self.sessions.find_session(retired.session_id)).await?;
                return Err(self
                    .handle_reuse(
                        owner.map(|s| s.user_id),
                        retired.session_id,
                        retired.family_id,
                        retired.token_id,
                    )
                    .await);
            }
        };

        if session.reused_token_id_of.is_some() {
            return Err(self
                .handle_reuse(
                    Some(session.user_id),
                    session.session_id,
                    session.family_id,
                    session.current_token_id,
                )
                .await);
        }

        if !session.is_active(now) {
            return Err(AuthError::InvalidRefreshToken);
        }

        let user = bounded(timeout, self.users.find_user_by_id(session.user_id)).await?;
        let user = match user {
            Some(user) if user.is_active() => user,
            _ => {
                tracing::warn!(
                    user_id = %session.user_id,
                    session_id = %session.session_id,
                    "Refresh for inactive account, revoking session"
                );
                bounded(
                    timeout,
                    self.sessions.revoke_session(
                        session.session_id,
                        RevokeReason::AccountInactive.as_str(),
                        now,
                    ),
                )
                .await?;
                return Err(AuthError::InvalidRefreshToken);
            }
        };

        let refresh_token = generate_opaque_token();
        let rotation = TokenRotation {
            session_id: session.session_id,
            family_id: session.family_id,
            expected_token_id: session.current_token_id,
            retired_token_hash: presented_hash,
            new_token_id: Uuid::new_v4(),
            new_token_hash: self.hasher.hash(&refresh_token),
            used_utc: next_last_used(now, session.last_used_utc),
            ip_address: ip_address.clone(),
            user_agent: user_agent.clone(),
        };

        let rotated = bounded(timeout, self.sessions.rotate_session_token(&rotation, now)).await?;
        if !rotated {
            // Another request rotated this token first
            return Err(self
                .handle_reuse(
                    Some(session.user_id),
                    session.session_id,
                    session.family_id,
                    session.current_token_id,
                )
                .await);
        }

        let mut session = session;
        session.current_token_id = rotation.new_token_id;
        session.token_hash = rotation.new_token_hash;
        session.last_used_utc = rotation.used_utc;
        if ip_address.is_some() {
            session.ip_address = ip_address;
        }
        if user_agent.is_some() {
            session.user_agent = user_agent;
        }

        let access_token = self.mint_access_token(session.user_id, session.session_id)?;

        self.audit.record(
            Some(session.user_id),
            AuthEventType::Refresh,
            true,
            AuthEventDetails {
                session_id: Some(session.session_id),
                family_id: Some(session.family_id),
                ip_address: session.ip_address.clone(),
                ..Default::default()
            },
        );

        Ok(RotatedSession {
            user,
            session,
            tokens: self.token_response(access_token, refresh_token),
        })
    }

    /// Mark the replay and revoke the family. Always yields
    /// [`AuthError::TokenReuseDetected`] unless the store itself fails.
    async fn handle_reuse(
        &self,
        user_id: Option<Uuid>,
        session_id: Uuid,
        family_id: Uuid,
        replayed_token_id: Uuid,
    ) -> AuthError {
        let timeout = self.settings.store_timeout;

        if let Err(e) = bounded(
            timeout,
            self.sessions.mark_token_reuse(session_id, replayed_token_id),
        )
        .await
        {
            return e.into();
        }

        let revoked = match bounded(
            timeout,
            self.sessions
                .revoke_family(family_id, RevokeReason::TokenReuse.as_str(), now_utc()),
        )
        .await
        {
            Ok(count) => count,
            Err(e) => return e.into(),
        };

        tracing::warn!(
            user_id = ?user_id,
            session_id = %session_id,
            family_id = %family_id,
            revoked = revoked,
            "Refresh token reuse detected, family revoked"
        );
        self.audit.record(
            user_id,
            AuthEventType::TokenReuse,
            false,
            AuthEventDetails {
                session_id: Some(session_id),
                family_id: Some(family_id),
                count: Some(revoked),
                ..Default::default()
            },
        );

        AuthError::TokenReuseDetected
    }

    pub async fn revoke(
        &self,
        session_id: Uuid,
        reason: RevokeReason,
    ) -> Result<RevocationOutcome, AuthError> {
        let outcome = bounded(
            self.settings.store_timeout,
            self.sessions
                .revoke_session(session_id, reason.as_str(), now_utc()),
        )
        .await?
        .ok_or(AuthError::SessionNotFound)?;

        tracing::info!(session_id = %session_id, reason = reason.as_str(), outcome = ?outcome, "Session revoke");
        self.audit.record(
            None,
            AuthEventType::SessionRevoked,
            true,
            AuthEventDetails {
                reason: Some(reason.as_str().to_string()),
                session_id: Some(session_id),
                ..Default::default()
            },
        );

        Ok(outcome)
    }

    /// Revoke a session on behalf of its owner. Sessions belonging to
    /// someone else are reported as not found.
    pub async fn revoke_owned(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        reason: RevokeReason,
    ) -> Result<RevocationOutcome, AuthError> {
        let session = bounded(self.settings.store_timeout, self.sessions.find_session(session_id))
            .await?
            .filter(|s| s.user_id == user_id)
            .ok_or(AuthError::SessionNotFound)?;

        self.revoke(session.session_id, reason).await
    }

    pub async fn revoke_family(
        &self,
        family_id: Uuid,
        reason: RevokeReason,
    ) -> Result<u64, AuthError> {
        let count = bounded(
            self.settings.store_timeout,
            self.sessions
                .revoke_family(family_id, reason.as_str(), now_utc()),
        )
        .await?;

        self.audit.record(
            None,
            AuthEventType::SessionRevokeFamily,
            true,
            AuthEventDetails {
                reason: Some(reason.as_str().to_string()),
                family_id: Some(family_id),
                count: Some(count),
                ..Default::default()
            },
        );

        Ok(count)
    }

    pub async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        reason: RevokeReason,
    ) -> Result<u64, AuthError> {
        let count = bounded(
            self.settings.store_timeout,
            self.sessions
                .revoke_user_sessions(user_id, reason.as_str(), now_utc()),
        )
        .await?;

        tracing::info!(user_id = %user_id, revoked = count, reason = reason.as_str(), "Revoked all sessions");
        self.audit.record(
            Some(user_id),
            AuthEventType::SessionRevokeAll,
            true,
            AuthEventDetails {
                reason: Some(reason.as_str().to_string()),
                count: Some(count),
                ..Default::default()
            },
        );

        Ok(count)
    }

    pub async fn list_active_sessions(&self, user_id: Uuid) -> Result<Vec<ActiveSession>, AuthError> {
        Ok(bounded(
            self.settings.store_timeout,
            self.sessions.list_active_sessions(user_id, now_utc()),
        )
        .await?)
    }

    /// Verify a session access token and confirm its session is still live.
    pub async fn validate_access(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let claims: AccessClaims =
            self.keys
                .verify(token, &self.settings.issuer, &self.settings.audience)?;
        let session_id = claims.sid.ok_or(AuthError::InvalidToken)?;
        let user_id = claims.user_id()?;

        let live = bounded(self.settings.store_timeout, self.sessions.find_session(session_id))
            .await?
            .is_some_and(|s| s.user_id == user_id && s.is_active(now_utc()));
        if !live {
            return Err(AuthError::InvalidToken);
        }

        Ok(claims)
    }

    pub async fn purge_expired(&self) -> Result<u64, AuthError> {
        let cutoff = now_utc() - Duration::days(EXPIRED_SESSION_RETENTION_DAYS);
        Ok(bounded(
            self.settings.store_timeout,
            self.sessions.purge_expired_sessions(cutoff),
        )
        .await?)
    }

    fn mint_access_token(&self, user_id: Uuid, session_id: Uuid) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = AccessClaims {
            sub: user_id.to_string(),
            sid: Some(session_id),
            iss: self.settings.issuer.clone(),
            aud: self.settings.audience.clone(),
            iat: now.timestamp(),
            exp: (now + self.settings.access_ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
            scope: None,
            client_id: None,
        };
        self.keys.sign(&claims)
    }

    fn token_response(&self, access_token: String, refresh_token: String) -> TokenResponse {
        TokenResponse {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.settings.access_ttl.num_seconds(),
        }
    }
}

/// `last_used_utc` must strictly increase across rotations.
fn next_last_used(now: DateTime<Utc>, previous: DateTime<Utc>) -> DateTime<Utc> {
    std::cmp::max(now, previous + Duration::microseconds(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RetiredRefreshToken, UserStatus};
    use crate::services::key_authority::KeySettings;
    use crate::store::{MemoryStore, StoreResult};
    use parking_lot::Mutex;
    use secrecy::Secret;

    struct Fixture {
        store: Arc<MemoryStore>,
        ledger: SessionLedger,
        user: User,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        fixture_on(store.clone(), store).await
    }

    async fn fixture_on(store: Arc<MemoryStore>, sessions: Arc<dyn SessionStore>) -> Fixture {
        let timeout = std::time::Duration::from_secs(1);
        let audit = AuditTrail::new(store.clone(), timeout);
        let keys = KeyAuthority::initialize(
            store.clone(),
            audit.clone(),
            KeySettings {
                lifetime: Duration::hours(168),
                rotation_threshold: Duration::hours(24),
                grace: Duration::days(1),
                store_timeout: timeout,
            },
            None,
        )
        .await
        .unwrap();

        let mut user = User::new("ledger@example.com", None, now_utc());
        user.status = UserStatus::Active.as_str().to_string();
        store.create_user(&user).await.unwrap();

        let ledger = SessionLedger::new(
            store.clone(),
            sessions,
            Arc::new(keys),
            hasher(),
            audit,
            LedgerSettings {
                issuer: "issuer".to_string(),
                audience: "audience".to_string(),
                access_ttl: Duration::minutes(15),
                refresh_lifetime: Duration::days(30),
                store_timeout: timeout,
            },
        );

        Fixture { store, ledger, user }
    }

    fn hasher() -> TokenHasher {
        TokenHasher::new(&Secret::new("pepper".to_string())).unwrap()
    }

    /// Session store that lets a competing rotation commit at a chosen
    /// point inside `rotate`.
    #[derive(Default)]
    struct RacingSessions {
        inner: Arc<MemoryStore>,
        before_lookup: Mutex<Option<TokenRotation>>,
        before_update: Mutex<Option<TokenRotation>>,
    }

    impl RacingSessions {
        async fn commit_pending(&self, slot: &Mutex<Option<TokenRotation>>) -> StoreResult<()> {
            let pending = slot.lock().take();
            if let Some(rotation) = pending {
                assert!(self.inner.rotate_session_token(&rotation, now_utc()).await?);
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl SessionStore for RacingSessions {
        async fn insert_session(&self, session: &Session) -> StoreResult<()> {
            self.inner.insert_session(session).await
        }

        async fn install_token_hash(
            &self,
            session_id: Uuid,
            token_id: Uuid,
            token_hash: &str,
            now: DateTime<Utc>,
        ) -> StoreResult<bool> {
            self.inner.install_token_hash(session_id, token_id, token_hash, now).await
        }

        async fn find_session(&self, session_id: Uuid) -> StoreResult<Option<Session>> {
            self.inner.find_session(session_id).await
        }

        async fn find_session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Session>> {
            self.commit_pending(&self.before_lookup).await?;
            self.inner.find_session_by_token_hash(token_hash).await
        }

        async fn find_retired_token(
            &self,
            token_hash: &str,
        ) -> StoreResult<Option<RetiredRefreshToken>> {
            self.inner.find_retired_token(token_hash).await
        }

        async fn rotate_session_token(
            &self,
            rotation: &TokenRotation,
            now: DateTime<Utc>,
        ) -> StoreResult<bool> {
            self.commit_pending(&self.before_update).await?;
            self.inner.rotate_session_token(rotation, now).await
        }

        async fn mark_token_reuse(&self, session_id: Uuid, replayed_token_id: Uuid) -> StoreResult<()> {
            self.inner.mark_token_reuse(session_id, replayed_token_id).await
        }

        async fn revoke_session(
            &self,
            session_id: Uuid,
            reason: &str,
            now: DateTime<Utc>,
        ) -> StoreResult<Option<RevocationOutcome>> {
            self.inner.revoke_session(session_id, reason, now).await
        }

        async fn revoke_family(
            &self,
            family_id: Uuid,
            reason: &str,
            now: DateTime<Utc>,
        ) -> StoreResult<u64> {
            self.inner.revoke_family(family_id, reason, now).await
        }

        async fn revoke_user_sessions(
            &self,
            user_id: Uuid,
            reason: &str,
            now: DateTime<Utc>,
        ) -> StoreResult<u64> {
            self.inner.revoke_user_sessions(user_id, reason, now).await
        }

        async fn list_active_sessions(
            &self,
            user_id: Uuid,
            now: DateTime<Utc>,
        ) -> StoreResult<Vec<ActiveSession>> {
            self.inner.list_active_sessions(user_id, now).await
        }

        async fn purge_expired_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
            self.inner.purge_expired_sessions(cutoff).await
        }
    }

    async fn racing_fixture() -> (Fixture, Arc<RacingSessions>) {
        let store = Arc::new(MemoryStore::new());
        let racing = Arc::new(RacingSessions {
            inner: store.clone(),
            ..Default::default()
        });
        let f = fixture_on(store, racing.clone()).await;
        (f, racing)
    }

    /// The rotation a competing request would commit for `presented`.
    fn competing_rotation(session: &Session, presented: &str) -> TokenRotation {
        TokenRotation {
            session_id: session.session_id,
            family_id: session.family_id,
            expected_token_id: session.current_token_id,
            retired_token_hash: hasher().hash(presented),
            new_token_id: Uuid::new_v4(),
            new_token_hash: hasher().hash(&generate_opaque_token()),
            used_utc: next_last_used(now_utc(), session.last_used_utc),
            ip_address: None,
            user_agent: None,
        }
    }

    #[test]
    fn test_last_used_strictly_increases() {
        let now = now_utc();
        assert_eq!(next_last_used(now, now - Duration::seconds(1)), now);
        assert_eq!(next_last_used(now, now), now + Duration::microseconds(1));
    }

    #[tokio::test]
    async fn test_create_session_issues_verifiable_tokens() {
        let f = fixture().await;
        let grant = f.ledger.create_session(f.user.user_id, None, None, None).await.unwrap();

        assert_eq!(grant.tokens.token_type, "Bearer");
        assert_eq!(grant.tokens.expires_in, 900);
        assert_eq!(grant.tokens.refresh_token.len(), 64);

        let claims = f.ledger.validate_access(&grant.tokens.access_token).await.unwrap();
        assert_eq!(claims.sid, Some(grant.session.session_id));
        assert_eq!(claims.user_id().unwrap(), f.user.user_id);
    }

    #[tokio::test]
    async fn test_rotation_chain_keeps_one_row() {
        let f = fixture().await;
        let grant = f.ledger.create_session(f.user.user_id, None, None, None).await.unwrap();

        let mut token = grant.tokens.refresh_token;
        let mut last_used = grant.session.last_used_utc;
        for _ in 0..5 {
            let rotated = f.ledger.rotate(&token, None, None).await.unwrap();
            assert_eq!(rotated.session.session_id, grant.session.session_id);
            assert!(rotated.session.last_used_utc > last_used);
            last_used = rotated.session.last_used_utc;
            token = rotated.tokens.refresh_token;
        }

        let active = f.ledger.list_active_sessions(f.user.user_id).await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_replay_revokes_family() {
        let f = fixture().await;
        let grant = f.ledger.create_session(f.user.user_id, None, None, None).await.unwrap();
        let old = grant.tokens.refresh_token;

        let rotated = f.ledger.rotate(&old, None, None).await.unwrap();

        let replay = f.ledger.rotate(&old, None, None).await;
        assert!(matches!(replay, Err(AuthError::TokenReuseDetected)));

        // The legitimate successor is dead too
        let next = f.ledger.rotate(&rotated.tokens.refresh_token, None, None).await;
        assert!(matches!(next, Err(AuthError::TokenReuseDetected)));

        let session = f.store.find_session(grant.session.session_id).await.unwrap().unwrap();
        assert!(session.is_revoked());
        assert_eq!(session.revoked_reason.as_deref(), Some("token_reuse"));
        assert!(session.reused_token_id_of.is_some());

        let access = f.ledger.validate_access(&rotated.tokens.access_token).await;
        assert!(matches!(access, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_replay_racing_the_winning_rotation_is_reuse() {
        let (f, racing) = racing_fixture().await;
        let grant = f.ledger.create_session(f.user.user_id, None, None, None).await.unwrap();
        let presented = grant.tokens.refresh_token;

        // The winner commits after this request started but before it reads
        // the current hash
        *racing.before_lookup.lock() = Some(competing_rotation(&grant.session, &presented));

        let result = f.ledger.rotate(&presented, None, None).await;
        assert!(matches!(result, Err(AuthError::TokenReuseDetected)));

        let session = f.store.find_session(grant.session.session_id).await.unwrap().unwrap();
        assert!(session.is_revoked());
        assert_eq!(session.reused_token_id_of, Some(grant.session.current_token_id));
    }

    #[tokio::test]
    async fn test_losing_the_conditional_update_is_reuse() {
        let (f, racing) = racing_fixture().await;
        let grant = f.ledger.create_session(f.user.user_id, None, None, None).await.unwrap();
        let presented = grant.tokens.refresh_token;

        let mut sibling = Session::new(f.user.user_id, None, None, None, now_utc(), Duration::days(30));
        sibling.family_id = grant.session.family_id;
        f.store.insert_session(&sibling).await.unwrap();

        // Both requests read the same current token; the other one updates first
        *racing.before_update.lock() = Some(competing_rotation(&grant.session, &presented));

        let result = f.ledger.rotate(&presented, None, None).await;
        assert!(matches!(result, Err(AuthError::TokenReuseDetected)));

        let session = f.store.find_session(grant.session.session_id).await.unwrap().unwrap();
        assert!(session.is_revoked());
        assert_eq!(session.revoked_reason.as_deref(), Some("token_reuse"));
        assert_eq!(session.reused_token_id_of, Some(grant.session.current_token_id));

        let sibling = f.store.find_session(sibling.session_id).await.unwrap().unwrap();
        assert!(sibling.is_revoked());
    }

    #[tokio::test]
    async fn test_unknown_token_is_invalid() {
        let f = fixture().await;
        let result = f.ledger.rotate("not-a-token", None, None).await;
        assert!(matches!(result, Err(AuthError::InvalidRefreshToken)));
    }

    #[tokio::test]
    async fn test_revoked_session_refresh_is_invalid() {
        let f = fixture().await;
        let grant = f.ledger.create_session(f.user.user_id, None, None, None).await.unwrap();

        let outcome = f.ledger.revoke(grant.session.session_id, RevokeReason::Logout).await.unwrap();
        assert_eq!(outcome, RevocationOutcome::Revoked);
        let again = f.ledger.revoke(grant.session.session_id, RevokeReason::Logout).await.unwrap();
        assert_eq!(again, RevocationOutcome::AlreadyRevoked);

        let result = f.ledger.rotate(&grant.tokens.refresh_token, None, None).await;
        assert!(matches!(result, Err(AuthError::InvalidRefreshToken)));
    }

    #[tokio::test]
    async fn test_revoke_unknown_session() {
        let f = fixture().await;
        let result = f.ledger.revoke(Uuid::new_v4(), RevokeReason::UserRevoked).await;
        assert!(matches!(result, Err(AuthError::SessionNotFound)));
    }

    #[tokio::test]
    async fn test_revoke_owned_hides_foreign_sessions() {
        let f = fixture().await;
        let grant = f.ledger.create_session(f.user.user_id, None, None, None).await.unwrap();

        let result = f
            .ledger
            .revoke_owned(Uuid::new_v4(), grant.session.session_id, RevokeReason::UserRevoked)
            .await;
        assert!(matches!(result, Err(AuthError::SessionNotFound)));
    }

    #[tokio::test]
    async fn test_suspended_user_cannot_refresh() {
        let f = fixture().await;
        let grant = f.ledger.create_session(f.user.user_id, None, None, None).await.unwrap();
        f.store
            .set_user_status(f.user.user_id, UserStatus::Suspended, now_utc())
            .await
            .unwrap();

        let result = f.ledger.rotate(&grant.tokens.refresh_token, None, None).await;
        assert!(matches!(result, Err(AuthError::InvalidRefreshToken)));

        let session = f.store.find_session(grant.session.session_id).await.unwrap().unwrap();
        assert_eq!(session.revoked_reason.as_deref(), Some("account_inactive"));
    }

    #[tokio::test]
    async fn test_revoke_all_for_user() {
        let f = fixture().await;
        for _ in 0..3 {
            f.ledger.create_session(f.user.user_id, None, None, None).await.unwrap();
        }

        let count = f
            .ledger
            .revoke_all_for_user(f.user.user_id, RevokeReason::SignOutEverywhere)
            .await
            .unwrap();
        assert_eq!(count, 3);
        assert!(f.ledger.list_active_sessions(f.user.user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_is_unavailable() {
        let f = fixture().await;
        let grant = f.ledger.create_session(f.user.user_id, None, None, None).await.unwrap();
        f.store.set_offline(true);

        let result = f.ledger.rotate(&grant.tokens.refresh_token, None, None).await;
        assert!(matches!(result, Err(AuthError::Unavailable(_))));
    }
}
