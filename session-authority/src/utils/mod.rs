pub mod password;
pub mod token;
pub mod validation;

pub use password::{burn_verification, hash_password, verify_password, Password, PasswordHashString};
pub use token::{generate_opaque_token, is_valid_code_verifier, pkce_challenge, verify_pkce, TokenHasher};
pub use validation::ValidatedJson;

use chrono::{DateTime, SubsecRound, Utc};

/// Current time at the store's (microsecond) resolution.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
