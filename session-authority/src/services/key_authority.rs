//! Signing-key set, scheduled rotation and the HS256 sign/verify contract.
//!
//! Request paths read an immutable [`KeyRing`] snapshot; only rotation and
//! cleanup replace it, serialized by their own async mutex.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, Secret};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, sync::Arc};
use utoipa::ToSchema;

use crate::config::AuthorityConfig;
use crate::models::{AuthEventDetails, AuthEventType, SigningKey, SigningKeyInfo};
use crate::services::{AuditTrail, AuthError};
use crate::store::{bounded, SigningKeyStore};
use crate::utils::now_utc;

pub const FALLBACK_KEY_ID: &str = "fallback";

#[derive(Debug, Clone)]
pub struct KeySettings {
    pub lifetime: Duration,
    pub rotation_threshold: Duration,
    /// How long an expired key is kept before it is hard-deleted.
    pub grace: Duration,
    pub store_timeout: std::time::Duration,
}

impl KeySettings {
    pub fn from_config(config: &AuthorityConfig) -> Self {
        Self {
            lifetime: Duration::hours(config.signing_keys.lifetime_hours),
            rotation_threshold: Duration::hours(config.signing_keys.rotation_threshold_hours),
            grace: Duration::days(1),
            store_timeout: std::time::Duration::from_millis(config.store.timeout_ms),
        }
    }
}

pub struct CachedKey {
    pub key: SigningKey,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl CachedKey {
    fn from_key(key: SigningKey) -> Result<Self, AuthError> {
        let material = URL_SAFE_NO_PAD.decode(&key.secret).map_err(|e| {
            AuthError::Internal(anyhow::anyhow!("Signing key {} is not base64url: {}", key.key_id, e))
        })?;
        Ok(Self {
            encoding: EncodingKey::from_secret(&material),
            decoding: DecodingKey::from_secret(&material),
            key,
        })
    }

    fn fallback(secret: &Secret<String>, now: DateTime<Utc>, lifetime: Duration) -> Self {
        let material = secret.expose_secret().as_bytes();
        Self {
            encoding: EncodingKey::from_secret(material),
            decoding: DecodingKey::from_secret(material),
            key: SigningKey {
                key_id: FALLBACK_KEY_ID.to_string(),
                secret: URL_SAFE_NO_PAD.encode(material),
                created_utc: now,
                expiry_utc: now + lifetime,
                is_active: true,
            },
        }
    }

    fn deactivated(&self) -> Self {
        let mut key = self.key.clone();
        key.is_active = false;
        Self {
            key,
            encoding: self.encoding.clone(),
            decoding: self.decoding.clone(),
        }
    }
}

/// Immutable view of every cached key and which one signs.
pub struct KeyRing {
    pub active_key_id: String,
    pub keys: HashMap<String, Arc<CachedKey>>,
    pub degraded: bool,
}

impl KeyRing {
    fn active(&self) -> Option<&Arc<CachedKey>> {
        self.keys.get(&self.active_key_id)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RotationCheck {
    pub rotated: bool,
    pub deleted: Vec<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PublishedKey {
    pub kty: &'static str,
    pub kid: String,
    #[serde(rename = "use")]
    pub use_: &'static str,
    pub alg: &'static str,
    pub k: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PublishedKeySet {
    pub keys: Vec<PublishedKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum KeyHealth {
    Healthy,
    Warning,
    Critical,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct KeyStatus {
    pub status: KeyHealth,
    pub current_key_id: Option<String>,
    pub hours_until_expiry: Option<i64>,
    pub total_keys: usize,
    pub degraded: bool,
}

pub struct KeyAuthority {
    store: Arc<dyn SigningKeyStore>,
    audit: AuditTrail,
    settings: KeySettings,
    ring: RwLock<Arc<KeyRing>>,
    rotation: tokio::sync::Mutex<()>,
}

impl KeyAuthority {
    /// Load the key set from the store, generating the first key when there
    /// is no usable one. When the store cannot be reached the fallback secret
    /// signs in degraded mode; without one, startup fails.
    pub async fn initialize(
        store: Arc<dyn SigningKeyStore>,
        audit: AuditTrail,
        settings: KeySettings,
        fallback_secret: Option<&Secret<String>>,
    ) -> Result<Self, AuthError> {
        let now = now_utc();
        let loaded = bounded(settings.store_timeout, store.load_signing_keys()).await;

        let ring = match loaded {
            Ok(keys) => ring_from_keys(keys, None, now),
            Err(e) => match fallback_secret {
                Some(secret) => {
                    tracing::warn!(
                        error = %e,
                        "Signing key store unreachable, running in degraded mode with the fallback key"
                    );
                    let fallback = Arc::new(CachedKey::fallback(secret, now, settings.lifetime));
                    let mut keys = HashMap::new();
                    keys.insert(FALLBACK_KEY_ID.to_string(), fallback);
                    KeyRing {
                        active_key_id: FALLBACK_KEY_ID.to_string(),
                        keys,
                        degraded: true,
                    }
                }
                None => {
                    tracing::error!(error = %e, "Signing key store unreachable and no fallback secret configured");
                    return Err(e.into());
                }
            },
        };

        let needs_key = ring.active().is_none();
        let authority = Self {
            store,
            audit,
            settings,
            ring: RwLock::new(Arc::new(ring)),
            rotation: tokio::sync::Mutex::new(()),
        };

        if needs_key {
            tracing::info!("No usable signing key found, generating initial key");
            let _guard = authority.rotation.lock().await;
            authority.rotate_locked().await?;
        }

        Ok(authority)
    }

    pub fn snapshot(&self) -> Arc<KeyRing> {
        self.ring.read().clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.snapshot().degraded
    }

    /// Generate and activate a new key now, regardless of the schedule.
    pub async fn rotate(&self) -> Result<String, AuthError> {
        let _guard = self.rotation.lock().await;
        self.rotate_locked().await
    }

    async fn rotate_locked(&self) -> Result<String, AuthError> {
        let now = now_utc();
        let key = SigningKey::generate(now, self.settings.lifetime);
        bounded(self.settings.store_timeout, self.store.activate_signing_key(&key)).await?;

        let key_id = key.key_id.clone();
        let cached = Arc::new(CachedKey::from_key(key)?);

        let current = self.snapshot();
        let mut keys: HashMap<String, Arc<CachedKey>> = current
            .keys
            .iter()
            .map(|(id, cached)| {
                let entry = if cached.key.is_active {
                    Arc::new(cached.deactivated())
                } else {
                    cached.clone()
                };
                (id.clone(), entry)
            })
            .collect();
        keys.insert(key_id.clone(), cached);

        *self.ring.write() = Arc::new(KeyRing {
            active_key_id: key_id.clone(),
            keys,
            degraded: false,
        });

        tracing::info!(key_id = %key_id, "Signing key rotated");
        self.audit.record(
            None,
            AuthEventType::KeyRotated,
            true,
            AuthEventDetails {
                key_id: Some(key_id.clone()),
                ..Default::default()
            },
        );

        Ok(key_id)
    }

    /// Periodic maintenance: resync with the store, rotate when the active
    /// key is inside the rotation threshold, and delete keys that expired
    /// more than the grace window ago.
    pub async fn check_rotation(&self) -> Result<RotationCheck, AuthError> {
        let _guard = self.rotation.lock().await;
        let now = now_utc();
        let timeout = self.settings.store_timeout;

        let keys = bounded(timeout, self.store.load_signing_keys()).await?;
        let fallback = self.snapshot().keys.get(FALLBACK_KEY_ID).cloned();
        let was_degraded = self.is_degraded();
        let ring = ring_from_keys(keys, fallback, now);
        if was_degraded {
            tracing::info!("Signing key store reachable again, leaving degraded mode");
        }

        let needs_rotation = match ring.active() {
            Some(active) if active.key.key_id != FALLBACK_KEY_ID => {
                active.key.expiry_utc - now <= self.settings.rotation_threshold
            }
            _ => true,
        };
        *self.ring.write() = Arc::new(ring);

        let mut check = RotationCheck::default();
        if needs_rotation {
            self.rotate_locked().await?;
            check.rotated = true;
        }

        let cutoff = now - self.settings.grace;
        let deleted = bounded(timeout, self.store.delete_signing_keys_expired_before(cutoff)).await?;

        let current = self.snapshot();
        let stale_fallback = current
            .keys
            .get(FALLBACK_KEY_ID)
            .is_some_and(|k| current.active_key_id != FALLBACK_KEY_ID && k.key.expiry_utc < cutoff);
        if !deleted.is_empty() || stale_fallback {
            let mut keys = current.keys.clone();
            for key_id in &deleted {
                keys.remove(key_id);
            }
            if stale_fallback {
                keys.remove(FALLBACK_KEY_ID);
            }
            *self.ring.write() = Arc::new(KeyRing {
                active_key_id: current.active_key_id.clone(),
                keys,
                degraded: current.degraded,
            });
            tracing::info!(deleted = ?deleted, "Deleted expired signing keys");
        }
        check.deleted = deleted;

        Ok(check)
    }

    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, AuthError> {
        let ring = self.snapshot();
        let active = ring
            .active()
            .ok_or_else(|| AuthError::Internal(anyhow::anyhow!("No active signing key")))?;

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(active.key.key_id.clone());

        encode(&header, claims, &active.encoding)
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("Failed to sign token: {}", e)))
    }

    pub fn verify<T: DeserializeOwned>(
        &self,
        token: &str,
        issuer: &str,
        audience: &str,
    ) -> Result<T, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::InvalidToken)?;
        if header.alg != Algorithm::HS256 {
            return Err(AuthError::InvalidToken);
        }
        let kid = header.kid.ok_or(AuthError::InvalidToken)?;

        let ring = self.snapshot();
        let cached = ring.keys.get(&kid).ok_or(AuthError::UnknownSigningKey)?;
        if cached.key.is_expired(now_utc()) {
            return Err(AuthError::ExpiredSigningKey);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);

        decode::<T>(token, &cached.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, kid = %kid, "Token verification failed");
                AuthError::InvalidToken
            })
    }

    pub fn published_key_set(&self) -> PublishedKeySet {
        let ring = self.snapshot();
        let now = now_utc();

        let mut keys: Vec<PublishedKey> = ring
            .keys
            .values()
            .filter(|cached| !cached.key.is_expired(now))
            .map(|cached| PublishedKey {
                kty: "oct",
                kid: cached.key.key_id.clone(),
                use_: "sig",
                alg: "HS256",
                k: cached.key.secret.clone(),
                created_at: cached.key.created_utc,
                expires_at: cached.key.expiry_utc,
            })
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        PublishedKeySet { keys }
    }

    pub fn list_keys(&self) -> Vec<SigningKeyInfo> {
        let mut keys: Vec<SigningKeyInfo> =
            self.snapshot().keys.values().map(|cached| cached.key.info()).collect();
        keys.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        keys
    }

    pub fn key_status(&self) -> KeyStatus {
        let ring = self.snapshot();
        let now = now_utc();

        let active = ring.active().filter(|cached| !cached.key.is_expired(now));
        let hours_until_expiry = active.map(|cached| (cached.key.expiry_utc - now).num_hours());
        let status = match hours_until_expiry {
            None => KeyHealth::Unhealthy,
            Some(h) if h < 1 => KeyHealth::Critical,
            Some(h) if h < 24 => KeyHealth::Warning,
            Some(_) => KeyHealth::Healthy,
        };

        KeyStatus {
            status,
            current_key_id: active.map(|cached| cached.key.key_id.clone()),
            hours_until_expiry,
            total_keys: ring.keys.len(),
            degraded: ring.degraded,
        }
    }
}

/// Build a ring from stored keys. The active key is the newest stored key
/// marked active and not yet expired; a carried-over fallback key stays
/// verifiable but only signs when nothing else can.
fn ring_from_keys(
    keys: Vec<SigningKey>,
    fallback: Option<Arc<CachedKey>>,
    now: DateTime<Utc>,
) -> KeyRing {
    let mut cached: HashMap<String, Arc<CachedKey>> = HashMap::new();
    let mut active: Option<(String, DateTime<Utc>)> = None;

    for key in keys {
        let key_id = key.key_id.clone();
        let usable = key.is_active && !key.is_expired(now);
        let created = key.created_utc;
        match CachedKey::from_key(key) {
            Ok(entry) => {
                if usable && active.as_ref().map_or(true, |(_, c)| created > *c) {
                    active = Some((key_id.clone(), created));
                }
                cached.insert(key_id, Arc::new(entry));
            }
            Err(e) => tracing::warn!(key_id = %key_id, error = %e, "Skipping unreadable signing key"),
        }
    }

    let mut active_key_id = active.map(|(id, _)| id).unwrap_or_default();
    if let Some(fallback) = fallback {
        if active_key_id.is_empty() && !fallback.key.is_expired(now) {
            active_key_id = FALLBACK_KEY_ID.to_string();
        }
        cached.insert(FALLBACK_KEY_ID.to_string(), fallback);
    }

    KeyRing {
        active_key_id,
        keys: cached,
        degraded: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Claims {
        sub: String,
        iss: String,
        aud: String,
        exp: i64,
    }

    fn settings() -> KeySettings {
        KeySettings {
            lifetime: Duration::hours(168),
            rotation_threshold: Duration::hours(24),
            grace: Duration::days(1),
            store_timeout: std::time::Duration::from_secs(1),
        }
    }

    fn claims() -> Claims {
        Claims {
            sub: "user-1".to_string(),
            iss: "issuer".to_string(),
            aud: "audience".to_string(),
            exp: (Utc::now() + Duration::minutes(15)).timestamp(),
        }
    }

    async fn authority(store: Arc<MemoryStore>) -> KeyAuthority {
        let audit = AuditTrail::new(store.clone(), std::time::Duration::from_secs(1));
        KeyAuthority::initialize(store, audit, settings(), None).await.unwrap()
    }

    #[tokio::test]
    async fn test_initialize_generates_first_key() {
        let store = Arc::new(MemoryStore::new());
        let keys = authority(store.clone()).await;

        let stored = store.load_signing_keys().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_active);
        assert_eq!(keys.key_status().current_key_id, Some(stored[0].key_id.clone()));
        assert_eq!(keys.key_status().status, KeyHealth::Healthy);
    }

    #[tokio::test]
    async fn test_sign_verify_round_trip() {
        let keys = authority(Arc::new(MemoryStore::new())).await;

        let original = claims();
        let token = keys.sign(&original).unwrap();
        let decoded: Claims = keys.verify(&token, "issuer", "audience").unwrap();
        assert_eq!(decoded, original);
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_audience() {
        let keys = authority(Arc::new(MemoryStore::new())).await;
        let token = keys.sign(&claims()).unwrap();

        let result: Result<Claims, _> = keys.verify(&token, "issuer", "someone-else");
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_token_signed_before_rotation_still_verifies() {
        let keys = authority(Arc::new(MemoryStore::new())).await;
        let token = keys.sign(&claims()).unwrap();

        keys.rotate().await.unwrap();

        let decoded: Result<Claims, _> = keys.verify(&token, "issuer", "audience");
        assert!(decoded.is_ok());
        assert_eq!(keys.published_key_set().keys.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_kid_is_rejected() {
        let keys = authority(Arc::new(MemoryStore::new())).await;
        let other = authority(Arc::new(MemoryStore::new())).await;
        let token = other.sign(&claims()).unwrap();

        let result: Result<Claims, _> = keys.verify(&token, "issuer", "audience");
        assert!(matches!(result, Err(AuthError::UnknownSigningKey)));
    }

    #[tokio::test]
    async fn test_expired_key_is_rejected_then_deleted() {
        let store = Arc::new(MemoryStore::new());
        let now = now_utc();
        let mut old = SigningKey::generate(now - Duration::days(10), Duration::days(8));
        old.is_active = false;
        store.activate_signing_key(&old).await.unwrap();
        let current = SigningKey::generate(now, Duration::hours(168));
        store.activate_signing_key(&current).await.unwrap();

        let keys = authority(store.clone()).await;

        // Forge a token under the expired key
        let cached = CachedKey::from_key(old.clone()).unwrap();
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(old.key_id.clone());
        let token = encode(&header, &claims(), &cached.encoding).unwrap();

        let result: Result<Claims, _> = keys.verify(&token, "issuer", "audience");
        assert!(matches!(result, Err(AuthError::ExpiredSigningKey)));

        let check = keys.check_rotation().await.unwrap();
        assert!(!check.rotated);
        assert_eq!(check.deleted, vec![old.key_id.clone()]);

        let result: Result<Claims, _> = keys.verify(&token, "issuer", "audience");
        assert!(matches!(result, Err(AuthError::UnknownSigningKey)));
    }

    #[tokio::test]
    async fn test_check_rotation_rotates_inside_threshold() {
        let store = Arc::new(MemoryStore::new());
        let expiring = SigningKey::generate(now_utc() - Duration::hours(160), Duration::hours(168));
        store.activate_signing_key(&expiring).await.unwrap();

        let keys = authority(store.clone()).await;
        assert_eq!(keys.key_status().status, KeyHealth::Warning);

        let check = keys.check_rotation().await.unwrap();
        assert!(check.rotated);
        assert_ne!(keys.key_status().current_key_id, Some(expiring.key_id.clone()));

        let stored = store.load_signing_keys().await.unwrap();
        assert_eq!(stored.iter().filter(|k| k.is_active).count(), 1);
    }

    #[tokio::test]
    async fn test_degraded_startup_uses_fallback() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let audit = AuditTrail::new(store.clone(), std::time::Duration::from_secs(1));
        let secret = Secret::new("static-fallback-secret".to_string());

        let keys = KeyAuthority::initialize(store.clone(), audit, settings(), Some(&secret))
            .await
            .unwrap();
        assert!(keys.is_degraded());
        assert_eq!(keys.key_status().current_key_id.as_deref(), Some(FALLBACK_KEY_ID));

        let token = keys.sign(&claims()).unwrap();

        // Store comes back: a real key takes over, fallback tokens still verify
        store.set_offline(false);
        let check = keys.check_rotation().await.unwrap();
        assert!(check.rotated);
        assert!(!keys.is_degraded());

        let decoded: Result<Claims, _> = keys.verify(&token, "issuer", "audience");
        assert!(decoded.is_ok());
    }

    #[tokio::test]
    async fn test_startup_without_store_or_fallback_fails() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let audit = AuditTrail::new(store.clone(), std::time::Duration::from_secs(1));

        let result = KeyAuthority::initialize(store, audit, settings(), None).await;
        assert!(matches!(result, Err(AuthError::Unavailable(_))));
    }
}
