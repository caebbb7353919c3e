mod common;

use axum::http::{header, StatusCode};
use common::{body_json, TestApp};

#[tokio::test]
async fn test_jwks_endpoint() {
    let app = TestApp::spawn().await;

    let response = app.get("/.well-known/jwks.json", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "public, max-age=300");

    let jwks = body_json(response).await;
    let keys = jwks["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["kty"], "oct");
    assert_eq!(keys[0]["use"], "sig");
    assert_eq!(keys[0]["alg"], "HS256");
    assert_eq!(
        keys[0]["kid"].as_str(),
        app.state.keys.key_status().current_key_id.as_deref()
    );
    assert!(keys[0]["k"].as_str().is_some_and(|k| !k.is_empty()));
}

#[tokio::test]
async fn test_openid_configuration() {
    let app = TestApp::spawn().await;

    let response = app.get("/.well-known/openid-configuration", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let doc = body_json(response).await;
    assert_eq!(doc["issuer"], "https://auth.example.com");
    assert_eq!(doc["token_endpoint"], "https://auth.example.com/oauth/token");
    assert_eq!(doc["jwks_uri"], "https://auth.example.com/.well-known/jwks.json");
    assert_eq!(doc["code_challenge_methods_supported"], serde_json::json!(["S256"]));
    assert_eq!(
        doc["grant_types_supported"],
        serde_json::json!(["authorization_code", "refresh_token"])
    );
}

#[tokio::test]
async fn test_health_and_security_headers() {
    let app = TestApp::spawn().await;

    let response = app.get("/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    assert!(response.headers().get("x-request-id").is_some());

    let health = body_json(response).await;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["checks"]["signing_keys"], "healthy");
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let app = TestApp::spawn().await;

    let response = app.get("/.well-known/openapi.json", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let doc = body_json(response).await;
    assert!(doc["paths"]["/oauth/token"].is_object());
    assert!(doc["components"]["securitySchemes"]["admin_api_key"].is_object());
}
