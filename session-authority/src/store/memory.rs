//! In-memory store for tests and local runs.
//!
//! A single mutex guards all tables, so every conditional write is atomic
//! with respect to every other call, matching the transactional guarantees of
//! the Postgres backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};
use uuid::Uuid;

use super::{
    AuditStore, DeviceStore, GrantStore, SessionStore, SigningKeyStore, StoreError, StoreResult,
    UserStore,
};
use crate::models::{
    ActiveSession, AuthEvent, AuthorizationCode, DelegatedRefreshToken, Device, OneTimeToken,
    RetiredRefreshToken, RevocationOutcome, Session, SigningKey, TokenPurpose, TokenRotation, User,
    UserStatus,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    devices: HashMap<Uuid, Device>,
    sessions: HashMap<Uuid, Session>,
    retired_tokens: HashMap<String, RetiredRefreshToken>,
    signing_keys: HashMap<String, SigningKey>,
    authorization_codes: HashMap<String, AuthorizationCode>,
    delegated_tokens: HashMap<String, DelegatedRefreshToken>,
    one_time_tokens: HashMap<String, OneTimeToken>,
    events: Vec<AuthEvent>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable backend: while set, every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

fn revoke(session: &mut Session, reason: &str, now: DateTime<Utc>) -> bool {
    if session.revoked_utc.is_some() {
        return false;
    }
    session.revoked_utc = Some(now);
    session.revoked_reason = Some(reason.to_string());
    true
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, user: &User) -> StoreResult<()> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        let email = user.email.to_lowercase();
        if tables.users.values().any(|u| u.email.to_lowercase() == email) {
            return Err(StoreError::Conflict(format!("email {} already registered", email)));
        }
        tables.users.insert(user.user_id, user.clone());
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        self.ensure_online()?;
        let email = email.to_lowercase();
        Ok(self
            .tables
            .lock()
            .users
            .values()
            .find(|u| u.email.to_lowercase() == email && u.deleted_utc.is_none())
            .cloned())
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        self.ensure_online()?;
        Ok(self
            .tables
            .lock()
            .users
            .get(&user_id)
            .filter(|u| u.deleted_utc.is_none())
            .cloned())
    }

    async fn set_user_status(
        &self,
        user_id: Uuid,
        status: UserStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        match tables.users.get_mut(&user_id).filter(|u| u.deleted_utc.is_none()) {
            Some(user) => {
                user.status = status.as_str().to_string();
                user.updated_utc = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_password_hash(
        &self,
        user_id: Uuid,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        match tables.users.get_mut(&user_id).filter(|u| u.deleted_utc.is_none()) {
            Some(user) => {
                user.password_hash = Some(password_hash.to_string());
                user.updated_utc = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn upsert_device(&self, device: &Device) -> StoreResult<Uuid> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        if let Some(existing) = tables
            .devices
            .values_mut()
            .find(|d| d.user_id == device.user_id && d.device_handle == device.device_handle)
        {
            existing.signals = device.signals.clone();
            existing.last_seen_utc = device.last_seen_utc;
            return Ok(existing.device_id);
        }
        tables.devices.insert(device.device_id, device.clone());
        Ok(device.device_id)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        if tables.sessions.contains_key(&session.session_id) {
            return Err(StoreError::Conflict(format!("session {} exists", session.session_id)));
        }
        tables.sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn install_token_hash(
        &self,
        session_id: Uuid,
        token_id: Uuid,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        match tables.sessions.get_mut(&session_id) {
            Some(s) if s.current_token_id == token_id && s.is_active(now) => {
                s.token_hash = token_hash.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_session(&self, session_id: Uuid) -> StoreResult<Option<Session>> {
        self.ensure_online()?;
        Ok(self.tables.lock().sessions.get(&session_id).cloned())
    }

    async fn find_session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        self.ensure_online()?;
        Ok(self
            .tables
            .lock()
            .sessions
            .values()
            .find(|s| s.token_hash == token_hash)
            .cloned())
    }

    async fn find_retired_token(&self, token_hash: &str) -> StoreResult<Option<RetiredRefreshToken>> {
        self.ensure_online()?;
        Ok(self.tables.lock().retired_tokens.get(token_hash).cloned())
    }

    async fn rotate_session_token(
        &self,
        rotation: &TokenRotation,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();

        let Some(session) = tables.sessions.get_mut(&rotation.session_id) else {
            return Ok(false);
        };
        if session.current_token_id != rotation.expected_token_id || !session.is_active(now) {
            return Ok(false);
        }

        session.current_token_id = rotation.new_token_id;
        session.token_hash = rotation.new_token_hash.clone();
        session.last_used_utc = rotation.used_utc;
        if rotation.ip_address.is_some() {
            session.ip_address = rotation.ip_address.clone();
        }
        if rotation.user_agent.is_some() {
            session.user_agent = rotation.user_agent.clone();
        }

        tables.retired_tokens.insert(
            rotation.retired_token_hash.clone(),
            RetiredRefreshToken {
                token_hash: rotation.retired_token_hash.clone(),
                token_id: rotation.expected_token_id,
                session_id: rotation.session_id,
                family_id: rotation.family_id,
                retired_utc: now,
            },
        );
        Ok(true)
    }

    async fn mark_token_reuse(&self, session_id: Uuid, replayed_token_id: Uuid) -> StoreResult<()> {
        self.ensure_online()?;
        if let Some(session) = self.tables.lock().sessions.get_mut(&session_id) {
            session.reused_token_id_of.get_or_insert(replayed_token_id);
        }
        Ok(())
    }

    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RevocationOutcome>> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        Ok(tables.sessions.get_mut(&session_id).map(|s| {
            if revoke(s, reason, now) {
                RevocationOutcome::Revoked
            } else {
                RevocationOutcome::AlreadyRevoked
            }
        }))
    }

    async fn revoke_family(&self, family_id: Uuid, reason: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        Ok(tables
            .sessions
            .values_mut()
            .filter(|s| s.family_id == family_id)
            .map(|s| revoke(s, reason, now))
            .filter(|revoked| *revoked)
            .count() as u64)
    }

    async fn revoke_user_sessions(
        &self,
        user_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        Ok(tables
            .sessions
            .values_mut()
            .filter(|s| s.user_id == user_id)
            .map(|s| revoke(s, reason, now))
            .filter(|revoked| *revoked)
            .count() as u64)
    }

    async fn list_active_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ActiveSession>> {
        self.ensure_online()?;
        let tables = self.tables.lock();
        let mut sessions: Vec<ActiveSession> = tables
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active(now))
            .map(|s| ActiveSession {
                session_id: s.session_id,
                device_id: s.device_id,
                platform: s
                    .device_id
                    .and_then(|id| tables.devices.get(&id))
                    .map(|d| d.platform.clone()),
                ip_address: s.ip_address.clone(),
                user_agent: s.user_agent.clone(),
                created_utc: s.created_utc,
                last_used_utc: s.last_used_utc,
                expiry_utc: s.expiry_utc,
            })
            .collect();
        sessions.sort_by(|a, b| b.last_used_utc.cmp(&a.last_used_utc));
        Ok(sessions)
    }

    async fn purge_expired_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        let before = tables.sessions.len();
        tables.sessions.retain(|_, s| s.expiry_utc >= cutoff);
        let removed = before - tables.sessions.len();

        let Tables {
            sessions,
            retired_tokens,
            ..
        } = &mut *tables;
        retired_tokens.retain(|_, r| sessions.contains_key(&r.session_id));
        Ok(removed as u64)
    }
}

#[async_trait]
impl SigningKeyStore for MemoryStore {
    async fn load_signing_keys(&self) -> StoreResult<Vec<SigningKey>> {
        self.ensure_online()?;
        let mut keys: Vec<SigningKey> = self.tables.lock().signing_keys.values().cloned().collect();
        keys.sort_by(|a, b| a.created_utc.cmp(&b.created_utc));
        Ok(keys)
    }

    async fn activate_signing_key(&self, key: &SigningKey) -> StoreResult<()> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        if tables.signing_keys.contains_key(&key.key_id) {
            return Err(StoreError::Conflict(format!("signing key {} exists", key.key_id)));
        }
        for existing in tables.signing_keys.values_mut() {
            existing.is_active = false;
        }
        let mut active = key.clone();
        active.is_active = true;
        tables.signing_keys.insert(active.key_id.clone(), active);
        Ok(())
    }

    async fn delete_signing_keys_expired_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        let doomed: Vec<String> = tables
            .signing_keys
            .values()
            .filter(|k| !k.is_active && k.expiry_utc < cutoff)
            .map(|k| k.key_id.clone())
            .collect();
        for key_id in &doomed {
            tables.signing_keys.remove(key_id);
        }
        Ok(doomed)
    }
}

#[async_trait]
impl GrantStore for MemoryStore {
    async fn insert_authorization_code(&self, code: &AuthorizationCode) -> StoreResult<()> {
        self.ensure_online()?;
        self.tables
            .lock()
            .authorization_codes
            .insert(code.code_hash.clone(), code.clone());
        Ok(())
    }

    async fn find_authorization_code(
        &self,
        code_hash: &str,
    ) -> StoreResult<Option<AuthorizationCode>> {
        self.ensure_online()?;
        Ok(self.tables.lock().authorization_codes.get(code_hash).cloned())
    }

    async fn redeem_authorization_code(
        &self,
        code_hash: &str,
        issued: &DelegatedRefreshToken,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        if tables.delegated_tokens.contains_key(&issued.token_hash) {
            return Err(StoreError::Conflict("delegated refresh token exists".to_string()));
        }
        match tables.authorization_codes.get_mut(code_hash) {
            Some(code) if code.is_redeemable(now) => {
                code.used_utc = Some(now);
            }
            _ => return Ok(false),
        }
        tables
            .delegated_tokens
            .insert(issued.token_hash.clone(), issued.clone());
        Ok(true)
    }

    async fn find_delegated_refresh_token(
        &self,
        token_hash: &str,
    ) -> StoreResult<Option<DelegatedRefreshToken>> {
        self.ensure_online()?;
        Ok(self.tables.lock().delegated_tokens.get(token_hash).cloned())
    }

    async fn consume_delegated_refresh_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        match tables.delegated_tokens.get_mut(token_hash) {
            Some(token) if token.is_live(now) => {
                token.used_utc = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn replace_delegated_refresh_token(
        &self,
        token_hash: &str,
        issued: &DelegatedRefreshToken,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        if tables.delegated_tokens.contains_key(&issued.token_hash) {
            return Err(StoreError::Conflict("delegated refresh token exists".to_string()));
        }
        match tables.delegated_tokens.get_mut(token_hash) {
            Some(token) if token.is_live(now) => {
                token.used_utc = Some(now);
            }
            _ => return Ok(false),
        }
        tables
            .delegated_tokens
            .insert(issued.token_hash.clone(), issued.clone());
        Ok(true)
    }

    async fn insert_one_time_token(&self, token: &OneTimeToken) -> StoreResult<()> {
        self.ensure_online()?;
        self.tables
            .lock()
            .one_time_tokens
            .insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn consume_one_time_token(
        &self,
        token_hash: &str,
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<OneTimeToken>> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        match tables.one_time_tokens.get_mut(token_hash) {
            Some(token)
                if token.purpose == purpose.as_str()
                    && token.used_utc.is_none()
                    && token.expiry_utc > now =>
            {
                token.used_utc = Some(now);
                Ok(Some(token.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn purge_expired_grants(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.ensure_online()?;
        let mut tables = self.tables.lock();
        let before = tables.authorization_codes.len()
            + tables.delegated_tokens.len()
            + tables.one_time_tokens.len();
        tables.authorization_codes.retain(|_, c| c.expiry_utc >= cutoff);
        tables.delegated_tokens.retain(|_, t| t.expiry_utc >= cutoff);
        tables.one_time_tokens.retain(|_, t| t.expiry_utc >= cutoff);
        let after = tables.authorization_codes.len()
            + tables.delegated_tokens.len()
            + tables.one_time_tokens.len();
        Ok((before - after) as u64)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append_event(&self, event: &AuthEvent) -> StoreResult<()> {
        self.ensure_online()?;
        self.tables.lock().events.push(event.clone());
        Ok(())
    }

    async fn list_events_for_user(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<AuthEvent>> {
        self.ensure_online()?;
        let tables = self.tables.lock();
        let mut events: Vec<AuthEvent> = tables
            .events
            .iter()
            .filter(|e| e.user_id == Some(user_id))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session_for(user_id: Uuid, now: DateTime<Utc>) -> Session {
        Session::new(user_id, None, None, None, now, Duration::days(30))
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts_case_insensitively() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.create_user(&User::new("a@example.com", None, now)).await.unwrap();

        let err = store
            .create_user(&User::new("A@Example.com", None, now))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_rotation_is_conditional_and_retires_old_hash() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let session = session_for(Uuid::new_v4(), now);
        store.insert_session(&session).await.unwrap();
        assert!(store
            .install_token_hash(session.session_id, session.current_token_id, "h1", now)
            .await
            .unwrap());

        let rotation = TokenRotation {
            session_id: session.session_id,
            family_id: session.family_id,
            expected_token_id: session.current_token_id,
            retired_token_hash: "h1".to_string(),
            new_token_id: Uuid::new_v4(),
            new_token_hash: "h2".to_string(),
            used_utc: now,
            ip_address: None,
            user_agent: None,
        };
        assert!(store.rotate_session_token(&rotation, now).await.unwrap());
        // Same expectation again loses
        assert!(!store.rotate_session_token(&rotation, now).await.unwrap());

        let retired = store.find_retired_token("h1").await.unwrap().unwrap();
        assert_eq!(retired.token_id, session.current_token_id);
        assert_eq!(
            store.find_session_by_token_hash("h2").await.unwrap().unwrap().session_id,
            session.session_id
        );
    }

    #[tokio::test]
    async fn test_revoke_session_outcomes() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let session = session_for(Uuid::new_v4(), now);
        store.insert_session(&session).await.unwrap();

        assert_eq!(
            store.revoke_session(session.session_id, "logout", now).await.unwrap(),
            Some(RevocationOutcome::Revoked)
        );
        assert_eq!(
            store.revoke_session(session.session_id, "logout", now).await.unwrap(),
            Some(RevocationOutcome::AlreadyRevoked)
        );
        assert_eq!(
            store.revoke_session(Uuid::new_v4(), "logout", now).await.unwrap(),
            None
        );
    }

    fn delegated_token(hash: &str, now: DateTime<Utc>) -> DelegatedRefreshToken {
        DelegatedRefreshToken {
            token_hash: hash.to_string(),
            user_id: Uuid::new_v4(),
            client_id: "web".to_string(),
            scopes: vec!["openid".to_string()],
            created_utc: now,
            expiry_utc: now + Duration::days(30),
            used_utc: None,
        }
    }

    #[tokio::test]
    async fn test_redeem_code_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let code = AuthorizationCode {
            code_hash: "c".to_string(),
            user_id: Uuid::new_v4(),
            client_id: "web".to_string(),
            redirect_uri: "https://app/cb".to_string(),
            scopes: vec!["openid".to_string()],
            code_challenge: "x".to_string(),
            challenge_method: "plain".to_string(),
            created_utc: now,
            expiry_utc: now + Duration::minutes(10),
            used_utc: None,
        };
        store.insert_authorization_code(&code).await.unwrap();

        assert!(store
            .redeem_authorization_code("c", &delegated_token("r1", now), now)
            .await
            .unwrap());
        assert!(!store
            .redeem_authorization_code("c", &delegated_token("r2", now), now)
            .await
            .unwrap());
        assert!(store.find_delegated_refresh_token("r1").await.unwrap().is_some());
        assert!(store.find_delegated_refresh_token("r2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_redeem_leaves_code_unused() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let code = AuthorizationCode {
            code_hash: "c".to_string(),
            user_id: Uuid::new_v4(),
            client_id: "web".to_string(),
            redirect_uri: "https://app/cb".to_string(),
            scopes: vec!["openid".to_string()],
            code_challenge: "x".to_string(),
            challenge_method: "plain".to_string(),
            created_utc: now,
            expiry_utc: now + Duration::minutes(10),
            used_utc: None,
        };
        store.insert_authorization_code(&code).await.unwrap();
        let existing = delegated_token("taken", now);
        store.tables.lock().delegated_tokens.insert("taken".to_string(), existing.clone());

        let clash = store.redeem_authorization_code("c", &existing, now).await;
        assert!(matches!(clash, Err(StoreError::Conflict(_))));

        let stored = store.find_authorization_code("c").await.unwrap().unwrap();
        assert!(stored.used_utc.is_none());
        assert!(store
            .redeem_authorization_code("c", &delegated_token("fresh", now), now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_replace_delegated_token_is_single_use() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let original = delegated_token("old", now);
        store.tables.lock().delegated_tokens.insert("old".to_string(), original);

        assert!(store
            .replace_delegated_refresh_token("old", &delegated_token("new", now), now)
            .await
            .unwrap());
        assert!(!store
            .replace_delegated_refresh_token("old", &delegated_token("again", now), now)
            .await
            .unwrap());
        assert!(store.find_delegated_refresh_token("again").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_only_inactive_expired_keys_are_deleted() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = SigningKey::generate(now - Duration::days(10), Duration::days(7));
        let current = SigningKey::generate(now, Duration::days(7));
        store.activate_signing_key(&old).await.unwrap();
        store.activate_signing_key(&current).await.unwrap();

        let deleted = store
            .delete_signing_keys_expired_before(now - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(deleted, vec![old.key_id.clone()]);

        let keys = store.load_signing_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].is_active);
    }

    #[tokio::test]
    async fn test_offline_store_is_unavailable() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.load_signing_keys().await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
