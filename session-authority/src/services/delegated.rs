//! Authorization-code flow with PKCE for registered third-party clients.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::{AuthorityConfig, OidcClient};
use crate::models::{
    AuthEventDetails, AuthEventType, AuthorizationCode, ChallengeMethod, DelegatedRefreshToken,
    User,
};
use crate::services::{session_ledger::AccessClaims, AuditTrail, AuthError, KeyAuthority};
use crate::store::{bounded, GrantStore, SessionStore, UserStore};
use crate::utils::{generate_opaque_token, is_valid_code_verifier, now_utc, verify_pkce, TokenHasher};

pub const SUPPORTED_SCOPES: [&str; 3] = ["openid", "profile", "email"];

const CODE_LIFETIME_MINUTES: i64 = 10;
const DELEGATED_ACCESS_TTL_SECONDS: i64 = 3600;
const DELEGATED_REFRESH_DAYS: i64 = 30;
/// Expired codes and tokens are kept this long before being purged.
const EXPIRED_GRANT_RETENTION_DAYS: i64 = 1;

#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub user_id: Uuid,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: Option<String>,
    pub code_challenge: String,
    pub challenge_method: ChallengeMethod,
}

#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub code: String,
    pub redirect_uri: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DelegatedTokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_token: String,
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl IntrospectionResponse {
    fn inactive() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserInfo {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OidcConfiguration {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
    pub introspection_endpoint: String,
    pub revocation_endpoint: String,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub claims_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DelegatedSettings {
    pub issuer: String,
    pub audience: String,
    pub public_base_url: Url,
    pub clients: Vec<OidcClient>,
    pub store_timeout: std::time::Duration,
}

impl DelegatedSettings {
    pub fn from_config(config: &AuthorityConfig) -> Result<Self, AuthError> {
        let public_base_url = Url::parse(&config.oidc.public_base_url).map_err(|e| {
            AuthError::Internal(anyhow::anyhow!("PUBLIC_BASE_URL is not a valid URL: {}", e))
        })?;

        Ok(Self {
            issuer: config.jwt.issuer.clone(),
            audience: config.jwt.audience.clone(),
            public_base_url,
            clients: config.oidc.clients.clone(),
            store_timeout: std::time::Duration::from_millis(config.store.timeout_ms),
        })
    }
}

/// Parse a space-separated scope string. An absent or empty scope means
/// `openid`; duplicates collapse and unknown scopes are rejected.
pub fn parse_scopes(scope: Option<&str>) -> Result<Vec<String>, AuthError> {
    let mut scopes: Vec<String> = Vec::new();
    for s in scope.unwrap_or_default().split_whitespace() {
        if !SUPPORTED_SCOPES.contains(&s) {
            return Err(AuthError::InvalidScope(s.to_string()));
        }
        if !scopes.iter().any(|existing| existing == s) {
            scopes.push(s.to_string());
        }
    }
    if scopes.is_empty() {
        scopes.push("openid".to_string());
    }
    Ok(scopes)
}

pub struct DelegatedEngine {
    users: Arc<dyn UserStore>,
    sessions: Arc<dyn SessionStore>,
    grants: Arc<dyn GrantStore>,
    keys: Arc<KeyAuthority>,
    hasher: TokenHasher,
    audit: AuditTrail,
    settings: DelegatedSettings,
}

impl DelegatedEngine {
    pub fn new(
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
        grants: Arc<dyn GrantStore>,
        keys: Arc<KeyAuthority>,
        hasher: TokenHasher,
        audit: AuditTrail,
        settings: DelegatedSettings,
    ) -> Self {
        Self {
            users,
            sessions,
            grants,
            keys,
            hasher,
            audit,
            settings,
        }
    }

    fn client(&self, client_id: &str) -> Result<&OidcClient, AuthError> {
        self.settings
            .clients
            .iter()
            .find(|c| c.client_id == client_id)
            .ok_or_else(|| AuthError::InvalidClient(format!("unknown client '{}'", client_id)))
    }

    pub async fn issue_authorization_code(
        &self,
        request: AuthorizationRequest,
    ) -> Result<IssuedCode, AuthError> {
        let client = self.client(&request.client_id)?;
        if !client.redirect_uris.iter().any(|uri| *uri == request.redirect_uri) {
            return Err(AuthError::InvalidClient(
                "redirect_uri is not registered for this client".to_string(),
            ));
        }

        let scopes = parse_scopes(request.scope.as_deref())?;

        if !is_valid_code_verifier(&request.code_challenge) {
            return Err(AuthError::Validation("code_challenge is malformed".to_string()));
        }

        let code = generate_opaque_token();
        let now = now_utc();
        let record = AuthorizationCode {
            code_hash: self.hasher.hash(&code),
            user_id: request.user_id,
            client_id: request.client_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            scopes,
            code_challenge: request.code_challenge,
            challenge_method: request.challenge_method.as_str().to_string(),
            created_utc: now,
            expiry_utc: now + Duration::minutes(CODE_LIFETIME_MINUTES),
            used_utc: None,
        };
        bounded(self.settings.store_timeout, self.grants.insert_authorization_code(&record)).await?;

        self.audit.record(
            Some(request.user_id),
            AuthEventType::CodeIssued,
            true,
            AuthEventDetails {
                client_id: Some(request.client_id),
                ..Default::default()
            },
        );

        Ok(IssuedCode {
            code,
            redirect_uri: request.redirect_uri,
            expires_in: CODE_LIFETIME_MINUTES * 60,
        })
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<DelegatedTokenResponse, AuthError> {
        let timeout = self.settings.store_timeout;
        let code_hash = self.hasher.hash(code);

        let record = bounded(timeout, self.grants.find_authorization_code(&code_hash))
            .await?
            .filter(|c| c.is_redeemable(now_utc()))
            .filter(|c| c.client_id == client_id && c.redirect_uri == redirect_uri)
            .ok_or(AuthError::InvalidOrExpiredCode)?;

        let method = record.method().ok_or(AuthError::InvalidOrExpiredCode)?;
        if !is_valid_code_verifier(code_verifier)
            || !verify_pkce(code_verifier, &record.code_challenge, method)
        {
            tracing::warn!(client_id = %client_id, user_id = %record.user_id, "PKCE verification failed");
            self.audit.record(
                Some(record.user_id),
                AuthEventType::CodeExchanged,
                false,
                AuthEventDetails {
                    reason: Some("invalid_code_verifier".to_string()),
                    client_id: Some(client_id.to_string()),
                    ..Default::default()
                },
            );
            return Err(AuthError::InvalidCodeVerifier);
        }

        let user = self.active_user(record.user_id).await?.ok_or(AuthError::InvalidOrExpiredCode)?;
        let (response, issued) = self.mint_tokens(&user, client_id, record.scopes)?;

        let redeemed = bounded(
            timeout,
            self.grants.redeem_authorization_code(&code_hash, &issued, now_utc()),
        )
        .await?;
        if !redeemed {
            return Err(AuthError::InvalidOrExpiredCode);
        }

        self.audit.record(
            Some(user.user_id),
            AuthEventType::CodeExchanged,
            true,
            AuthEventDetails {
                client_id: Some(client_id.to_string()),
                ..Default::default()
            },
        );

        Ok(response)
    }

    /// Single-use refresh for delegated tokens. The requested scope must be
    /// a subset of what was originally granted.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        client_id: Option<&str>,
        scope: Option<&str>,
    ) -> Result<DelegatedTokenResponse, AuthError> {
        let timeout = self.settings.store_timeout;
        let token_hash = self.hasher.hash(refresh_token);

        let record = bounded(timeout, self.grants.find_delegated_refresh_token(&token_hash))
            .await?
            .filter(|t| t.is_live(now_utc()))
            .filter(|t| client_id.map_or(true, |id| id == t.client_id))
            .ok_or(AuthError::InvalidRefreshToken)?;

        let scopes = match scope {
            Some(s) if !s.trim().is_empty() => {
                let requested = parse_scopes(Some(s))?;
                if let Some(extra) = requested.iter().find(|r| !record.scopes.contains(r)) {
                    return Err(AuthError::InvalidScope(format!("'{}' was not granted", extra)));
                }
                requested
            }
            _ => record.scopes.clone(),
        };

        let user = self.active_user(record.user_id).await?.ok_or(AuthError::InvalidRefreshToken)?;
        let (response, issued) = self.mint_tokens(&user, &record.client_id, scopes)?;

        let replaced = bounded(
            timeout,
            self.grants
                .replace_delegated_refresh_token(&token_hash, &issued, now_utc()),
        )
        .await?;
        if !replaced {
            return Err(AuthError::InvalidRefreshToken);
        }

        self.audit.record(
            Some(user.user_id),
            AuthEventType::DelegatedRefresh,
            true,
            AuthEventDetails {
                client_id: Some(record.client_id),
                ..Default::default()
            },
        );

        Ok(response)
    }

    /// RFC 7662 introspection. Never fails; anything unverifiable is
    /// reported as inactive.
    pub async fn introspect(&self, token: &str) -> IntrospectionResponse {
        match self.introspect_inner(token).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Introspection failed, reporting token inactive");
                IntrospectionResponse::inactive()
            }
        }
    }

    async fn introspect_inner(&self, token: &str) -> Result<IntrospectionResponse, AuthError> {
        let timeout = self.settings.store_timeout;

        if let Ok(claims) =
            self.keys
                .verify::<AccessClaims>(token, &self.settings.issuer, &self.settings.audience)
        {
            if let Some(session_id) = claims.sid {
                let live = bounded(timeout, self.sessions.find_session(session_id))
                    .await?
                    .is_some_and(|s| s.is_active(now_utc()));
                if !live {
                    return Ok(IntrospectionResponse::inactive());
                }
            }

            return Ok(IntrospectionResponse {
                active: true,
                sub: Some(claims.sub),
                iss: Some(claims.iss),
                aud: Some(claims.aud),
                exp: Some(claims.exp),
                iat: Some(claims.iat),
                scope: claims.scope,
                client_id: claims.client_id,
                token_type: Some("Bearer".to_string()),
            });
        }

        let token_hash = self.hasher.hash(token);
        let record = bounded(timeout, self.grants.find_delegated_refresh_token(&token_hash)).await?;
        match record {
            Some(t) if t.is_live(now_utc()) => Ok(IntrospectionResponse {
                active: true,
                sub: Some(t.user_id.to_string()),
                exp: Some(t.expiry_utc.timestamp()),
                iat: Some(t.created_utc.timestamp()),
                scope: Some(t.scopes.join(" ")),
                client_id: Some(t.client_id),
                token_type: Some("refresh_token".to_string()),
                ..Default::default()
            }),
            _ => Ok(IntrospectionResponse::inactive()),
        }
    }

    /// RFC 7009 revocation. Self-contained access tokens cannot be revoked
    /// here and are accepted as a no-op.
    pub async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        if jsonwebtoken::decode_header(token).is_ok() {
            tracing::info!("Revocation requested for a structured access token, nothing to do");
            return Ok(());
        }

        let token_hash = self.hasher.hash(token);
        let timeout = self.settings.store_timeout;
        let record = bounded(timeout, self.grants.find_delegated_refresh_token(&token_hash)).await?;
        let consumed = bounded(
            timeout,
            self.grants.consume_delegated_refresh_token(&token_hash, now_utc()),
        )
        .await?;

        if consumed {
            if let Some(record) = record {
                self.audit.record(
                    Some(record.user_id),
                    AuthEventType::DelegatedRevoke,
                    true,
                    AuthEventDetails {
                        client_id: Some(record.client_id),
                        ..Default::default()
                    },
                );
            }
        }
        Ok(())
    }

    pub async fn userinfo(&self, access_token: &str) -> Result<UserInfo, AuthError> {
        let claims: AccessClaims =
            self.keys
                .verify(access_token, &self.settings.issuer, &self.settings.audience)?;
        let user_id = claims.user_id()?;
        let timeout = self.settings.store_timeout;

        if let Some(session_id) = claims.sid {
            let live = bounded(timeout, self.sessions.find_session(session_id))
                .await?
                .is_some_and(|s| s.user_id == user_id && s.is_active(now_utc()));
            if !live {
                return Err(AuthError::InvalidToken);
            }
        }

        let user = bounded(timeout, self.users.find_user_by_id(user_id))
            .await?
            .ok_or(AuthError::InvalidToken)?;

        let scopes = claims.scopes();
        let mut info = UserInfo {
            sub: user.user_id.to_string(),
            email: None,
            email_verified: None,
        };
        if scopes.contains(&"email") || scopes.contains(&"profile") {
            info.email_verified = Some(user.email_verified());
            info.email = Some(user.email);
        }
        Ok(info)
    }

    pub fn configuration(&self) -> OidcConfiguration {
        OidcConfiguration {
            issuer: self.settings.issuer.clone(),
            authorization_endpoint: self.endpoint("oauth/authorize"),
            token_endpoint: self.endpoint("oauth/token"),
            userinfo_endpoint: self.endpoint("oauth/userinfo"),
            jwks_uri: self.endpoint(".well-known/jwks.json"),
            introspection_endpoint: self.endpoint("oauth/introspect"),
            revocation_endpoint: self.endpoint("oauth/revoke"),
            response_types_supported: strings(&["code"]),
            grant_types_supported: strings(&["authorization_code", "refresh_token"]),
            subject_types_supported: strings(&["public"]),
            id_token_signing_alg_values_supported: strings(&["HS256"]),
            scopes_supported: strings(&SUPPORTED_SCOPES),
            claims_supported: strings(&["sub", "iss", "aud", "exp", "iat", "email", "email_verified"]),
            code_challenge_methods_supported: strings(&["S256"]),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        let mut base = self.settings.public_base_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        match base.join(path) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}{}", base, path),
        }
    }

    pub async fn purge_expired(&self) -> Result<u64, AuthError> {
        let cutoff = now_utc() - Duration::days(EXPIRED_GRANT_RETENTION_DAYS);
        Ok(bounded(self.settings.store_timeout, self.grants.purge_expired_grants(cutoff)).await?)
    }

    async fn active_user(&self, user_id: Uuid) -> Result<Option<User>, AuthError> {
        let user = bounded(self.settings.store_timeout, self.users.find_user_by_id(user_id)).await?;
        match user {
            Some(user) if !user.is_active() => Err(AuthError::AccountNotActive),
            other => Ok(other),
        }
    }

    /// Sign the token pair and build the refresh record. The caller
    /// persists the record together with the grant it consumes.
    fn mint_tokens(
        &self,
        user: &User,
        client_id: &str,
        scopes: Vec<String>,
    ) -> Result<(DelegatedTokenResponse, DelegatedRefreshToken), AuthError> {
        let now = Utc::now();
        let exp = (now + Duration::seconds(DELEGATED_ACCESS_TTL_SECONDS)).timestamp();
        let scope = scopes.join(" ");

        let access_token = self.keys.sign(&AccessClaims {
            sub: user.user_id.to_string(),
            sid: None,
            iss: self.settings.issuer.clone(),
            aud: self.settings.audience.clone(),
            iat: now.timestamp(),
            exp,
            jti: Uuid::new_v4().to_string(),
            scope: Some(scope.clone()),
            client_id: Some(client_id.to_string()),
        })?;

        let id_token = if scopes.iter().any(|s| s == "openid") {
            let with_email = scopes.iter().any(|s| s == "email");
            Some(self.keys.sign(&IdTokenClaims {
                sub: user.user_id.to_string(),
                iss: self.settings.issuer.clone(),
                aud: client_id.to_string(),
                iat: now.timestamp(),
                exp,
                email: with_email.then(|| user.email.clone()),
                email_verified: with_email.then(|| user.email_verified()),
            })?)
        } else {
            None
        };

        let refresh_token = generate_opaque_token();
        let created = now_utc();
        let record = DelegatedRefreshToken {
            token_hash: self.hasher.hash(&refresh_token),
            user_id: user.user_id,
            client_id: client_id.to_string(),
            scopes,
            created_utc: created,
            expiry_utc: created + Duration::days(DELEGATED_REFRESH_DAYS),
            used_utc: None,
        };

        let response = DelegatedTokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: DELEGATED_ACCESS_TTL_SECONDS,
            refresh_token,
            scope,
            id_token,
        };
        Ok((response, record))
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
