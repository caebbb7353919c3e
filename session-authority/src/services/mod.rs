pub mod audit;
pub mod collaborators;
pub mod delegated;
pub mod error;
pub mod identity;
pub mod key_authority;
pub mod maintenance;
pub mod session_ledger;

pub use audit::AuditTrail;
pub use collaborators::{
    CaptchaVerifier, Collaborators, EmailProvider, MfaProof, MfaVerifier, RoleProvider,
};
pub use delegated::{DelegatedEngine, DelegatedTokenResponse, IntrospectionResponse, OidcConfiguration, UserInfo};
pub use error::AuthError;
pub use identity::{IdentityVerifier, LoginAttempt, LoginOutcome};
pub use key_authority::{KeyAuthority, KeyStatus, PublishedKeySet};
pub use maintenance::MaintenanceJob;
pub use session_ledger::{AccessClaims, SessionLedger, TokenResponse};
