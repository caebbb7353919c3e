pub mod auth_event;
pub mod authorization_code;
pub mod delegated_token;
pub mod device;
pub mod one_time_token;
pub mod session;
pub mod signing_key;
pub mod user;

pub use auth_event::{AuthEvent, AuthEventDetails, AuthEventType};
pub use authorization_code::{AuthorizationCode, ChallengeMethod};
pub use delegated_token::DelegatedRefreshToken;
pub use device::{Device, DeviceSignals};
pub use one_time_token::{OneTimeToken, TokenPurpose};
pub use session::{
    ActiveSession, RetiredRefreshToken, RevocationOutcome, RevokeReason, Session, TokenRotation,
};
pub use signing_key::{SigningKey, SigningKeyInfo};
pub use user::{normalize_email, User, UserStatus, UserSummary};
