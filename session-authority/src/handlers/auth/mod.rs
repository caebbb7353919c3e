pub mod password;
pub mod registration;
pub mod session;

pub use password::{confirm_password_reset, request_password_reset};
pub use registration::{register, verify_email};
pub use session::{list_sessions, login, logout, refresh, revoke_all_sessions, revoke_session};
