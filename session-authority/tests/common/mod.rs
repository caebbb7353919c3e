//! Shared setup for the HTTP integration tests: an in-memory store, a
//! recording email provider and request helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use parking_lot::Mutex;
use serde_json::Value;
use service_core::config::Config;
use session_authority::{
    build_router,
    config::AuthorityConfig,
    models::ChallengeMethod,
    services::{Collaborators, EmailProvider},
    store::MemoryStore,
    utils::pkce_challenge,
    AppState,
};
use std::{collections::HashMap, sync::Arc};
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_ADMIN_API_KEY: &str = "test-admin-key-12345";
pub const CLIENT_ID: &str = "web-app";
pub const REDIRECT_URI: &str = "https://app.example.com/callback";
pub const LOGIN_URL: &str = "https://login.example.com/signin";
pub const PASSWORD: &str = "correct-horse-battery";
/// RFC 7636 appendix B verifier.
pub const CODE_VERIFIER: &str = "dBjftJeZ4CVP-mJ0Z3tYvEizgFmBgO6Ny4Ec5G8nC3w";

#[derive(Default)]
pub struct RecordingEmail {
    verification: Mutex<HashMap<String, String>>,
    reset: Mutex<HashMap<String, String>>,
}

impl RecordingEmail {
    pub fn verification_token(&self, email: &str) -> Option<String> {
        self.verification.lock().get(email).cloned()
    }

    pub fn reset_token(&self, email: &str) -> Option<String> {
        self.reset.lock().get(email).cloned()
    }
}

#[async_trait]
impl EmailProvider for RecordingEmail {
    async fn send_verification_email(
        &self,
        _user_id: Uuid,
        email: &str,
        token: &str,
    ) -> Result<(), anyhow::Error> {
        self.verification
            .lock()
            .insert(email.to_string(), token.to_string());
        Ok(())
    }

    async fn send_password_reset_email(
        &self,
        _user_id: Uuid,
        email: &str,
        token: &str,
    ) -> Result<(), anyhow::Error> {
        self.reset.lock().insert(email.to_string(), token.to_string());
        Ok(())
    }
}

pub fn test_config(overrides: &[(&str, &str)]) -> AuthorityConfig {
    let clients = format!(
        r#"[{{"client_id":"{}","redirect_uris":["{}"]}}]"#,
        CLIENT_ID, REDIRECT_URI
    );
    let mut vars: HashMap<String, String> = [
        ("ADMIN_API_KEY", TEST_ADMIN_API_KEY),
        ("STORE_BACKEND", "memory"),
        ("STORE_TIMEOUT_MS", "2000"),
        ("JWT_ISSUER", "https://auth.example.com"),
        ("JWT_AUDIENCE", "session-authority-tests"),
        ("PUBLIC_BASE_URL", "https://auth.example.com"),
        ("LOGIN_URL", LOGIN_URL),
        ("OIDC_CLIENTS", clients.as_str()),
        ("LOG_LEVEL", "error"),
        ("RATE_LIMIT_LOGIN_ATTEMPTS", "100"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in overrides {
        vars.insert(k.to_string(), v.to_string());
    }

    AuthorityConfig::from_lookup(Config::default(), |key| vars.get(key).cloned())
        .expect("Failed to build test configuration")
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub email: Arc<RecordingEmail>,
    router: Router,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::with_config(test_config(&[])).await
    }

    pub async fn with_config(config: AuthorityConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let email = Arc::new(RecordingEmail::default());
        let collaborators = Collaborators {
            email: email.clone(),
            ..Collaborators::default()
        };
        let state = AppState::new(config, store.clone(), collaborators)
            .await
            .expect("Failed to build application state");
        let router = build_router(state.clone());

        Self {
            state,
            store,
            email,
            router,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str, bearer: Option<&str>) -> Response {
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub async fn post_json(&self, uri: &str, body: Value, bearer: Option<&str>) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    pub async fn post_form(&self, uri: &str, fields: &[(&str, &str)]) -> Response {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }

    /// Register, verify and log in; returns the login response body.
    pub async fn signed_in_user(&self, email: &str) -> Value {
        let response = self
            .post_json(
                "/auth/register",
                serde_json::json!({ "email": email, "password": PASSWORD }),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let token = self
            .email
            .verification_token(email)
            .expect("Verification email was not sent");
        let response = self.get(&format!("/auth/verify?token={}", token), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = self.login(email, PASSWORD).await;
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await
    }

    pub async fn login(&self, email: &str, password: &str) -> Response {
        self.post_json(
            "/auth/login",
            serde_json::json!({
                "email": email,
                "password": password,
                "device": { "platform": "ios", "model": "iPhone15,2" }
            }),
            None,
        )
        .await
    }
}

pub async fn body_json(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub fn code_challenge() -> String {
    pkce_challenge(CODE_VERIFIER, ChallengeMethod::S256)
}

pub fn unique_email(prefix: &str) -> String {
    format!("{}-{}@example.com", prefix, Uuid::new_v4().simple())
}
