pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;

use axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Json, Router,
};
use service_core::middleware::{
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::{make_request_span, request_id_middleware},
};
use std::{sync::Arc, time::Duration};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::{AuthorityConfig, SwaggerMode};
use crate::services::{
    delegated::DelegatedSettings, key_authority::KeySettings, session_ledger::LedgerSettings,
    AuditTrail, AuthError, Collaborators, DelegatedEngine, IdentityVerifier, KeyAuthority,
    MaintenanceJob, SessionLedger,
};
use crate::store::AuthorityStore;
use crate::utils::TokenHasher;

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::well_known::jwks,
        handlers::well_known::openid_configuration,
        handlers::auth::registration::register,
        handlers::auth::registration::verify_email,
        handlers::auth::password::request_password_reset,
        handlers::auth::password::confirm_password_reset,
        handlers::auth::session::login,
        handlers::auth::session::refresh,
        handlers::auth::session::logout,
        handlers::auth::session::list_sessions,
        handlers::auth::session::revoke_session,
        handlers::auth::session::revoke_all_sessions,
        handlers::oauth::authorize,
        handlers::oauth::token,
        handlers::oauth::userinfo,
        handlers::oauth::introspect,
        handlers::oauth::revoke,
        handlers::admin::rotate_keys,
        handlers::admin::key_status,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::OAuthErrorResponse,
            dtos::MessageResponse,
            dtos::auth::RegisterRequest,
            dtos::auth::RegisterResponse,
            dtos::auth::VerifyResponse,
            dtos::auth::LoginRequest,
            dtos::auth::LoginResponse,
            dtos::auth::RefreshRequest,
            dtos::auth::SessionListResponse,
            dtos::auth::RevokeSessionResponse,
            dtos::auth::RevokeAllResponse,
            dtos::auth::PasswordResetRequest,
            dtos::auth::PasswordResetConfirm,
            dtos::oauth::TokenRequest,
            dtos::oauth::TokenOnlyRequest,
            dtos::admin::RotateKeysResponse,
            dtos::admin::KeyStatusResponse,
            services::TokenResponse,
            services::DelegatedTokenResponse,
            services::IntrospectionResponse,
            services::UserInfo,
            services::OidcConfiguration,
            services::PublishedKeySet,
            services::key_authority::PublishedKey,
            services::KeyStatus,
            services::key_authority::KeyHealth,
            models::UserSummary,
            models::DeviceSignals,
            models::ActiveSession,
            models::RevocationOutcome,
            models::SigningKeyInfo,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Registration, login and token refresh"),
        (name = "Sessions", description = "Session listing and revocation"),
        (name = "OAuth", description = "Delegated authorization for registered clients"),
        (name = "Admin", description = "Signing key administration"),
        (name = "Well-Known", description = "Public service metadata"),
        (name = "Observability", description = "Service health"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
            components.add_security_scheme(
                "admin_api_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(
                    middleware::admin::ADMIN_API_KEY_HEADER,
                ))),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: AuthorityConfig,
    pub keys: Arc<KeyAuthority>,
    pub ledger: Arc<SessionLedger>,
    pub identity: Arc<IdentityVerifier>,
    pub delegated: Arc<DelegatedEngine>,
    pub audit: AuditTrail,
    pub login_rate_limiter: IpRateLimiter,
}

impl AppState {
    /// Wire every component onto one store. Fails when the signing keys
    /// cannot be loaded and no fallback secret is configured.
    pub async fn new<S>(
        config: AuthorityConfig,
        store: Arc<S>,
        collaborators: Collaborators,
    ) -> Result<Self, AuthError>
    where
        S: AuthorityStore + 'static,
    {
        let store_timeout = Duration::from_millis(config.store.timeout_ms);
        let hasher = TokenHasher::new(&config.jwt.token_hash_pepper)?;
        let audit = AuditTrail::new(store.clone(), store_timeout);

        let keys = Arc::new(
            KeyAuthority::initialize(
                store.clone(),
                audit.clone(),
                KeySettings::from_config(&config),
                config.jwt.fallback_secret.as_ref(),
            )
            .await?,
        );

        let ledger = Arc::new(SessionLedger::new(
            store.clone(),
            store.clone(),
            keys.clone(),
            hasher.clone(),
            audit.clone(),
            LedgerSettings::from_config(&config),
        ));

        let identity = Arc::new(IdentityVerifier::new(
            store.clone(),
            store.clone(),
            store.clone(),
            ledger.clone(),
            collaborators,
            hasher.clone(),
            audit.clone(),
            store_timeout,
        ));

        let delegated = Arc::new(DelegatedEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            keys.clone(),
            hasher,
            audit.clone(),
            DelegatedSettings::from_config(&config)?,
        ));

        let login_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.login_attempts,
            config.rate_limit.login_window_seconds,
        );

        Ok(Self {
            config,
            keys,
            ledger,
            identity,
            delegated,
            audit,
            login_rate_limiter,
        })
    }

    pub fn maintenance(&self) -> MaintenanceJob {
        MaintenanceJob::new(self.keys.clone(), self.ledger.clone(), self.delegated.clone())
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(middleware::admin::ADMIN_API_KEY_HEADER),
        ])
}

pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/admin/keys", get(handlers::admin::key_status))
        .route("/admin/keys/rotate", post(handlers::admin::rotate_keys))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::admin_auth_middleware,
        ));

    let login_route = Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .layer(from_fn_with_state(
            state.login_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let session_routes = Router::new()
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/sessions", get(handlers::auth::list_sessions))
        .route(
            "/auth/sessions/revoke-all",
            post(handlers::auth::revoke_all_sessions),
        )
        .route(
            "/auth/sessions/:session_id",
            delete(handlers::auth::revoke_session),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/.well-known/jwks.json", get(handlers::well_known::jwks))
        .route(
            "/.well-known/openid-configuration",
            get(handlers::well_known::openid_configuration),
        );

    match state.config.swagger.enabled {
        SwaggerMode::Public => {
            app = app.merge(
                SwaggerUi::new("/docs").url("/.well-known/openapi.json", ApiDoc::openapi()),
            );
        }
        SwaggerMode::Authenticated => {
            let docs: Router<AppState> = Router::new()
                .merge(SwaggerUi::new("/docs").url("/.well-known/openapi.json", ApiDoc::openapi()))
                .layer(from_fn_with_state(
                    state.clone(),
                    middleware::admin_auth_middleware,
                ));
            app = app.merge(docs);
        }
        SwaggerMode::Disabled => {
            // Keep the OpenAPI JSON for programmatic access
            app = app.route(
                "/.well-known/openapi.json",
                get(|| async { Json(ApiDoc::openapi()) }),
            );
        }
    }

    app.route("/auth/register", post(handlers::auth::register))
        .route("/auth/verify", get(handlers::auth::verify_email))
        .route(
            "/auth/password-reset/request",
            post(handlers::auth::request_password_reset),
        )
        .route(
            "/auth/password-reset/confirm",
            post(handlers::auth::confirm_password_reset),
        )
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/oauth/authorize", get(handlers::oauth::authorize))
        .route("/oauth/token", post(handlers::oauth::token))
        .route("/oauth/userinfo", get(handlers::oauth::userinfo))
        .route("/oauth/introspect", post(handlers::oauth::introspect))
        .route("/oauth/revoke", post(handlers::oauth::revoke))
        .merge(login_route)
        .merge(session_routes)
        .merge(admin_routes)
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http().make_span_with(make_request_span))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors_layer(&state.config.security.allowed_origins))
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up; `degraded` when signing with the fallback key")
    ),
    tag = "Observability"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let key_status = state.keys.key_status();
    let status = if key_status.degraded { "degraded" } else { "healthy" };

    Json(serde_json::json!({
        "status": status,
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "signing_keys": key_status.status,
        }
    }))
}
