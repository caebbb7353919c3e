use std::sync::Arc;
use uuid::Uuid;

use crate::models::{
    AuthEventDetails, AuthEventType, Device, DeviceSignals, OneTimeToken, RevokeReason,
    TokenPurpose, User, UserStatus, UserSummary,
};
use crate::services::{
    collaborators::{CaptchaFlow, Collaborators, MfaProof},
    session_ledger::TokenResponse,
    AuditTrail, AuthError, SessionLedger,
};
use crate::store::{bounded, DeviceStore, GrantStore, StoreError, UserStore};
use crate::utils::{
    burn_verification, generate_opaque_token, hash_password, now_utc, verify_password, Password,
    PasswordHashString, TokenHasher,
};

#[derive(Debug, Clone)]
pub struct CaptchaSubmission {
    pub provider: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub email: String,
    pub password: Password,
    pub device: Option<DeviceSignals>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub captcha: Option<CaptchaSubmission>,
    pub mfa: Option<MfaProof>,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: UserSummary,
    pub session_id: Uuid,
    pub tokens: TokenResponse,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

/// Primary-credential login and the account lifecycle around it.
pub struct IdentityVerifier {
    users: Arc<dyn UserStore>,
    devices: Arc<dyn DeviceStore>,
    grants: Arc<dyn GrantStore>,
    ledger: Arc<SessionLedger>,
    collaborators: Collaborators,
    hasher: TokenHasher,
    audit: AuditTrail,
    store_timeout: std::time::Duration,
}

impl IdentityVerifier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        users: Arc<dyn UserStore>,
        devices: Arc<dyn DeviceStore>,
        grants: Arc<dyn GrantStore>,
        ledger: Arc<SessionLedger>,
        collaborators: Collaborators,
        hasher: TokenHasher,
        audit: AuditTrail,
        store_timeout: std::time::Duration,
    ) -> Self {
        Self {
            users,
            devices,
            grants,
            ledger,
            collaborators,
            hasher,
            audit,
            store_timeout,
        }
    }

    pub async fn login(&self, attempt: LoginAttempt) -> Result<LoginOutcome, AuthError> {
        let ip = attempt.ip_address.clone();
        let email = attempt.email.trim().to_lowercase();

        self.check_captcha(CaptchaFlow::Login, None, &attempt).await?;

        let user = bounded(self.store_timeout, self.users.find_user_by_email(&email)).await?;
        let Some(user) = user else {
            burn_verification_work(&attempt.password).await;
            self.audit_login_failure(None, &email, ip, "unknown_email");
            return Err(AuthError::InvalidCredentials);
        };

        let Some(stored_hash) = user.password_hash.clone() else {
            burn_verification_work(&attempt.password).await;
            self.audit_login_failure(Some(user.user_id), &email, ip, "no_password");
            return Err(AuthError::InvalidCredentials);
        };
        let password = attempt.password.clone();
        let verified = tokio::task::spawn_blocking(move || {
            verify_password(&password, &PasswordHashString::new(stored_hash))
        })
        .await
        .map_err(|e| AuthError::Internal(anyhow::anyhow!("Password verification task failed: {}", e)))?;
        if verified.is_err() {
            self.audit_login_failure(Some(user.user_id), &email, ip, "wrong_password");
            return Err(AuthError::InvalidCredentials);
        }

        if !user.is_active() {
            self.audit_login_failure(Some(user.user_id), &email, ip, "account_not_active");
            return Err(AuthError::AccountNotActive);
        }

        self.check_mfa(&user, attempt.mfa.as_ref(), &email, ip.clone()).await?;

        let device_id = match attempt.device {
            Some(signals) => {
                let device = Device::new(user.user_id, signals, now_utc());
                Some(bounded(self.store_timeout, self.devices.upsert_device(&device)).await?)
            }
            None => None,
        };

        let grant = self
            .ledger
            .create_session(user.user_id, device_id, ip.clone(), attempt.user_agent)
            .await?;

        let roles = self.collaborators.roles.roles(user.user_id).await.unwrap_or_else(|e| {
            tracing::warn!(user_id = %user.user_id, error = %e, "Role lookup failed");
            Vec::new()
        });
        let permissions = self
            .collaborators
            .roles
            .permissions(user.user_id)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(user_id = %user.user_id, error = %e, "Permission lookup failed");
                Vec::new()
            });

        tracing::info!(user_id = %user.user_id, session_id = %grant.session.session_id, "User logged in");
        self.audit.record(
            Some(user.user_id),
            AuthEventType::Login,
            true,
            AuthEventDetails {
                session_id: Some(grant.session.session_id),
                ip_address: ip,
                ..Default::default()
            },
        );

        Ok(LoginOutcome {
            user: UserSummary::from(&user),
            session_id: grant.session.session_id,
            tokens: grant.tokens,
            roles,
            permissions,
        })
    }

    async fn check_captcha(
        &self,
        flow: CaptchaFlow,
        user_id: Option<Uuid>,
        attempt: &LoginAttempt,
    ) -> Result<(), AuthError> {
        let ip = attempt.ip_address.as_deref();
        let ua = attempt.user_agent.as_deref();

        let challenge = self
            .collaborators
            .captcha
            .should_challenge(flow, user_id, ip, ua)
            .await
            .map_err(|e| AuthError::Unavailable(format!("captcha: {}", e)))?;
        if !challenge {
            return Ok(());
        }

        let submission = attempt.captcha.as_ref().ok_or(AuthError::CaptchaRequired)?;
        let outcome = self
            .collaborators
            .captcha
            .verify(&submission.provider, &submission.token, flow, ip, ua)
            .await
            .map_err(|e| AuthError::Unavailable(format!("captcha: {}", e)))?;

        if !outcome.success {
            tracing::warn!(flow = flow.as_str(), score = ?outcome.score, "CAPTCHA verification failed");
            return Err(AuthError::CaptchaFailed);
        }
        Ok(())
    }

    async fn check_mfa(
        &self,
        user: &User,
        proof: Option<&MfaProof>,
        email: &str,
        ip: Option<String>,
    ) -> Result<(), AuthError> {
        let enrolled = self
            .collaborators
            .mfa
            .is_enrolled(user.user_id)
            .await
            .map_err(|e| AuthError::Unavailable(format!("mfa: {}", e)))?;
        if !enrolled {
            return Ok(());
        }

        let Some(proof) = proof else {
            return Err(AuthError::MfaRequired);
        };
        let verified = self
            .collaborators
            .mfa
            .verify(user.user_id, proof)
            .await
            .map_err(|e| AuthError::Unavailable(format!("mfa: {}", e)))?;
        if !verified {
            self.audit_login_failure(Some(user.user_id), email, ip, "mfa_failed");
            return Err(AuthError::InvalidCredentials);
        }
        Ok(())
    }

    fn audit_login_failure(&self, user_id: Option<Uuid>, email: &str, ip: Option<String>, reason: &str) {
        tracing::warn!(user_id = ?user_id, reason = reason, "Login failed");
        self.audit.record(
            user_id,
            AuthEventType::Login,
            false,
            AuthEventDetails {
                reason: Some(reason.to_string()),
                email: Some(email.to_string()),
                ip_address: ip,
                ..Default::default()
            },
        );
    }

    /// Create a pending account and send its verification email.
    pub async fn register(&self, email: &str, password: Password) -> Result<UserSummary, AuthError> {
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("Password hashing task failed: {}", e)))??;

        let user = User::new(email, Some(password_hash.into_string()), now_utc());
        match bounded(self.store_timeout, self.users.create_user(&user)).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                self.audit.record(
                    None,
                    AuthEventType::Register,
                    false,
                    AuthEventDetails {
                        reason: Some("email_taken".to_string()),
                        email: Some(user.email.clone()),
                        ..Default::default()
                    },
                );
                return Err(AuthError::EmailAlreadyRegistered);
            }
            Err(e) => return Err(e.into()),
        }

        let token = self.issue_one_time_token(user.user_id, TokenPurpose::EmailVerification).await?;
        if let Err(e) = self
            .collaborators
            .email
            .send_verification_email(user.user_id, &user.email, &token)
            .await
        {
            tracing::warn!(user_id = %user.user_id, error = %e, "Failed to send verification email");
        }

        tracing::info!(user_id = %user.user_id, "User registered");
        self.audit.record(
            Some(user.user_id),
            AuthEventType::Register,
            true,
            AuthEventDetails::default(),
        );

        Ok(UserSummary::from(&user))
    }

    pub async fn verify_email(&self, token: &str) -> Result<UserSummary, AuthError> {
        let consumed = bounded(
            self.store_timeout,
            self.grants.consume_one_time_token(
                &self.hasher.hash(token),
                TokenPurpose::EmailVerification,
                now_utc(),
            ),
        )
        .await?
        .ok_or(AuthError::InvalidToken)?;

        let mut user = bounded(self.store_timeout, self.users.find_user_by_id(consumed.user_id))
            .await?
            .ok_or(AuthError::InvalidToken)?;

        match user.status.parse::<UserStatus>() {
            Ok(UserStatus::Pending) => {
                let now = now_utc();
                bounded(
                    self.store_timeout,
                    self.users.set_user_status(user.user_id, UserStatus::Active, now),
                )
                .await?;
                user.status = UserStatus::Active.as_str().to_string();
                user.updated_utc = now;
            }
            Ok(UserStatus::Active) => {}
            _ => return Err(AuthError::AccountNotActive),
        }

        tracing::info!(user_id = %user.user_id, "Email verified");
        self.audit.record(
            Some(user.user_id),
            AuthEventType::EmailVerified,
            true,
            AuthEventDetails::default(),
        );

        Ok(UserSummary::from(&user))
    }

    /// Always succeeds so callers cannot learn which emails are registered.
    pub async fn request_password_reset(&self, email: &str) -> Result<(), AuthError> {
        let email = email.trim().to_lowercase();
        let user = bounded(self.store_timeout, self.users.find_user_by_email(&email)).await?;

        let Some(user) = user else {
            tracing::info!("Password reset requested for unknown email");
            return Ok(());
        };

        let token = self.issue_one_time_token(user.user_id, TokenPurpose::PasswordReset).await?;
        if let Err(e) = self
            .collaborators
            .email
            .send_password_reset_email(user.user_id, &user.email, &token)
            .await
        {
            tracing::warn!(user_id = %user.user_id, error = %e, "Failed to send password reset email");
        }

        self.audit.record(
            Some(user.user_id),
            AuthEventType::PasswordResetRequested,
            true,
            AuthEventDetails::default(),
        );
        Ok(())
    }

    /// Set a new password and end every session the user has.
    pub async fn confirm_password_reset(
        &self,
        token: &str,
        new_password: Password,
    ) -> Result<(), AuthError> {
        let consumed = bounded(
            self.store_timeout,
            self.grants.consume_one_time_token(
                &self.hasher.hash(token),
                TokenPurpose::PasswordReset,
                now_utc(),
            ),
        )
        .await?
        .ok_or(AuthError::InvalidToken)?;

        let password_hash = tokio::task::spawn_blocking(move || hash_password(&new_password))
            .await
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("Password hashing task failed: {}", e)))??;

        let updated = bounded(
            self.store_timeout,
            self.users
                .set_password_hash(consumed.user_id, password_hash.as_str(), now_utc()),
        )
        .await?;
        if !updated {
            return Err(AuthError::InvalidToken);
        }

        let revoked = self
            .ledger
            .revoke_all_for_user(consumed.user_id, RevokeReason::PasswordReset)
            .await?;

        tracing::info!(user_id = %consumed.user_id, revoked = revoked, "Password reset");
        self.audit.record(
            Some(consumed.user_id),
            AuthEventType::PasswordReset,
            true,
            AuthEventDetails {
                count: Some(revoked),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn issue_one_time_token(
        &self,
        user_id: Uuid,
        purpose: TokenPurpose,
    ) -> Result<String, AuthError> {
        let token = generate_opaque_token();
        let record = OneTimeToken::new(self.hasher.hash(&token), user_id, purpose, now_utc());
        bounded(self.store_timeout, self.grants.insert_one_time_token(&record)).await?;
        Ok(token)
    }
}

/// Runs a dummy verification off the async runtime so a login with no
/// stored hash costs the same as a wrong password.
async fn burn_verification_work(password: &Password) {
    let password = password.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || burn_verification(&password)).await {
        tracing::warn!(error = %e, "Dummy password verification task failed");
    }
}
