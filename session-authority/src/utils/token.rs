//! Opaque tokens, their keyed hashes, and PKCE.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::models::ChallengeMethod;

type HmacSha256 = Hmac<Sha256>;

const OPAQUE_TOKEN_BYTES: usize = 32;

/// 32 random bytes, hex encoded.
pub fn generate_opaque_token() -> String {
    let mut bytes = [0u8; OPAQUE_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// HMAC-SHA256 over opaque tokens with a server-side pepper. Only these
/// hashes are ever persisted.
#[derive(Clone)]
pub struct TokenHasher {
    mac: HmacSha256,
}

impl TokenHasher {
    pub fn new(pepper: &Secret<String>) -> Result<Self, anyhow::Error> {
        let mac = HmacSha256::new_from_slice(pepper.expose_secret().as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid token hash pepper: {}", e))?;
        Ok(Self { mac })
    }

    pub fn hash(&self, token: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(token.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// RFC 7636: 43-128 characters from the unreserved set.
pub fn is_valid_code_verifier(verifier: &str) -> bool {
    (43..=128).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

pub fn pkce_challenge(verifier: &str, method: ChallengeMethod) -> String {
    match method {
        ChallengeMethod::S256 => URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())),
        ChallengeMethod::Plain => verifier.to_string(),
    }
}

/// Recompute the challenge and compare in constant time.
pub fn verify_pkce(verifier: &str, challenge: &str, method: ChallengeMethod) -> bool {
    let computed = pkce_challenge(verifier, method);
    computed.as_bytes().ct_eq(challenge.as_bytes()).into()
}
