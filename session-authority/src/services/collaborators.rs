//! External collaborators the authority consults but does not own: MFA,
//! RBAC, CAPTCHA risk scoring and transactional email.
//!
//! Only minimal implementations ship here; deployments plug in their own.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum MfaProof {
    Totp(String),
    RecoveryCode(String),
}

#[async_trait]
pub trait MfaVerifier: Send + Sync {
    async fn is_enrolled(&self, user_id: Uuid) -> Result<bool, anyhow::Error>;
    async fn verify(&self, user_id: Uuid, proof: &MfaProof) -> Result<bool, anyhow::Error>;
}

#[async_trait]
pub trait RoleProvider: Send + Sync {
    async fn roles(&self, user_id: Uuid) -> Result<Vec<String>, anyhow::Error>;
    async fn permissions(&self, user_id: Uuid) -> Result<Vec<String>, anyhow::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaFlow {
    Login,
    Register,
}

impl CaptchaFlow {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptchaFlow::Login => "login",
            CaptchaFlow::Register => "register",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptchaOutcome {
    pub success: bool,
    pub score: Option<f32>,
}

#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn should_challenge(
        &self,
        flow: CaptchaFlow,
        user_id: Option<Uuid>,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<bool, anyhow::Error>;

    async fn verify(
        &self,
        provider: &str,
        token: &str,
        flow: CaptchaFlow,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<CaptchaOutcome, anyhow::Error>;
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send_verification_email(
        &self,
        user_id: Uuid,
        email: &str,
        token: &str,
    ) -> Result<(), anyhow::Error>;

    async fn send_password_reset_email(
        &self,
        user_id: Uuid,
        email: &str,
        token: &str,
    ) -> Result<(), anyhow::Error>;
}

/// Nobody is enrolled; any proof is rejected.
pub struct DenyAllMfa;

#[async_trait]
impl MfaVerifier for DenyAllMfa {
    async fn is_enrolled(&self, _user_id: Uuid) -> Result<bool, anyhow::Error> {
        Ok(false)
    }

    async fn verify(&self, _user_id: Uuid, _proof: &MfaProof) -> Result<bool, anyhow::Error> {
        Ok(false)
    }
}

/// Same roles and permissions for everyone.
pub struct StaticRoleProvider {
    roles: Vec<String>,
    permissions: Vec<String>,
}

impl StaticRoleProvider {
    pub fn new(roles: Vec<String>, permissions: Vec<String>) -> Self {
        Self { roles, permissions }
    }
}

impl Default for StaticRoleProvider {
    fn default() -> Self {
        Self::new(vec!["user".to_string()], Vec::new())
    }
}

#[async_trait]
impl RoleProvider for StaticRoleProvider {
    async fn roles(&self, _user_id: Uuid) -> Result<Vec<String>, anyhow::Error> {
        Ok(self.roles.clone())
    }

    async fn permissions(&self, _user_id: Uuid) -> Result<Vec<String>, anyhow::Error> {
        Ok(self.permissions.clone())
    }
}

/// Never challenges.
pub struct NoCaptcha;

#[async_trait]
impl CaptchaVerifier for NoCaptcha {
    async fn should_challenge(
        &self,
        _flow: CaptchaFlow,
        _user_id: Option<Uuid>,
        _ip: Option<&str>,
        _user_agent: Option<&str>,
    ) -> Result<bool, anyhow::Error> {
        Ok(false)
    }

    async fn verify(
        &self,
        _provider: &str,
        _token: &str,
        _flow: CaptchaFlow,
        _ip: Option<&str>,
        _user_agent: Option<&str>,
    ) -> Result<CaptchaOutcome, anyhow::Error> {
        Ok(CaptchaOutcome {
            success: true,
            score: None,
        })
    }
}

/// Logs outgoing mail instead of sending it.
pub struct LoggingEmailProvider;

#[async_trait]
impl EmailProvider for LoggingEmailProvider {
    async fn send_verification_email(
        &self,
        user_id: Uuid,
        email: &str,
        _token: &str,
    ) -> Result<(), anyhow::Error> {
        tracing::info!(user_id = %user_id, email = %email, "Verification email queued");
        Ok(())
    }

    async fn send_password_reset_email(
        &self,
        user_id: Uuid,
        email: &str,
        _token: &str,
    ) -> Result<(), anyhow::Error> {
        tracing::info!(user_id = %user_id, email = %email, "Password reset email queued");
        Ok(())
    }
}

/// The set of collaborators handed to the identity verifier.
#[derive(Clone)]
pub struct Collaborators {
    pub mfa: Arc<dyn MfaVerifier>,
    pub roles: Arc<dyn RoleProvider>,
    pub captcha: Arc<dyn CaptchaVerifier>,
    pub email: Arc<dyn EmailProvider>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            mfa: Arc::new(DenyAllMfa),
            roles: Arc::new(StaticRoleProvider::default()),
            captcha: Arc::new(NoCaptcha),
            email: Arc::new(LoggingEmailProvider),
        }
    }
}
