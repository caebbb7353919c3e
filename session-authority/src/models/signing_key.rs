//! Signing key model - HS256 secrets used for access and ID tokens.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use sqlx::FromRow;
use utoipa::ToSchema;

const KEY_BYTES: usize = 64;
const KEY_ID_BYTES: usize = 8;

#[derive(Clone, FromRow)]
pub struct SigningKey {
    pub key_id: String,
    /// base64url (unpadded) key material
    pub secret: String,
    pub created_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
    pub is_active: bool,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("secret", &"[REDACTED]")
            .field("created_utc", &self.created_utc)
            .field("expiry_utc", &self.expiry_utc)
            .field("is_active", &self.is_active)
            .finish()
    }
}

impl SigningKey {
    /// Generate fresh random key material.
    pub fn generate(now: DateTime<Utc>, lifetime: Duration) -> Self {
        let mut rng = rand::thread_rng();

        let mut secret = [0u8; KEY_BYTES];
        rng.fill_bytes(&mut secret);
        let mut key_id = [0u8; KEY_ID_BYTES];
        rng.fill_bytes(&mut key_id);

        Self {
            key_id: hex::encode(key_id),
            secret: URL_SAFE_NO_PAD.encode(secret),
            created_utc: now,
            expiry_utc: now + lifetime,
            is_active: true,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_utc <= now
    }

    pub fn info(&self) -> SigningKeyInfo {
        SigningKeyInfo {
            key_id: self.key_id.clone(),
            created_utc: self.created_utc,
            expiry_utc: self.expiry_utc,
            is_active: self.is_active,
        }
    }
}

/// Key metadata without material.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SigningKeyInfo {
    pub key_id: String,
    pub created_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_shape() {
        let now = Utc::now();
        let key = SigningKey::generate(now, Duration::hours(168));

        assert_eq!(key.key_id.len(), 16);
        assert_eq!(URL_SAFE_NO_PAD.decode(&key.secret).unwrap().len(), KEY_BYTES);
        assert!(key.is_active);
        assert!(!key.is_expired(now));
        assert!(key.is_expired(now + Duration::hours(168)));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let key = SigningKey::generate(Utc::now(), Duration::hours(1));
        let printed = format!("{:?}", key);
        assert!(!printed.contains(&key.secret));
        assert!(printed.contains("REDACTED"));
    }
}
