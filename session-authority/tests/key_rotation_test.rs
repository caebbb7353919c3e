mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use common::{body_json, test_config, unique_email, TestApp, TEST_ADMIN_API_KEY};
use session_authority::{services::Collaborators, store::MemoryStore, AppState};
use std::sync::Arc;

fn admin_request(method: Method, uri: &str, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        builder = builder.header("x-admin-api-key", key);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_admin_routes_require_the_api_key() {
    let app = TestApp::spawn().await;

    let response = app.send(admin_request(Method::GET, "/admin/keys", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .send(admin_request(Method::POST, "/admin/keys/rotate", Some("wrong-key")))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_key_status_after_startup() {
    let app = TestApp::spawn().await;

    let response = app
        .send(admin_request(Method::GET, "/admin/keys", Some(TEST_ADMIN_API_KEY)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let status = body_json(response).await;
    assert_eq!(status["status"], "healthy");
    assert_eq!(status["total_keys"], 1);
    assert_eq!(status["degraded"], false);
    assert_eq!(status["keys"].as_array().unwrap().len(), 1);
    assert_eq!(status["keys"][0]["key_id"], status["current_key_id"]);
}

#[tokio::test]
async fn test_rotation_keeps_old_tokens_verifiable() {
    let app = TestApp::spawn().await;
    let before = app.signed_in_user(&unique_email("rotation")).await;
    let old_key = app.state.keys.key_status().current_key_id.unwrap();

    let response = app
        .send(admin_request(
            Method::POST,
            "/admin/keys/rotate",
            Some(TEST_ADMIN_API_KEY),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let new_key = body_json(response).await["key_id"]
        .as_str()
        .unwrap()
        .to_string();
    assert_ne!(old_key, new_key);

    // Tokens signed by the previous key still verify.
    let response = app.get("/auth/sessions", before["access_token"].as_str()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let jwks = body_json(app.get("/.well-known/jwks.json", None).await).await;
    let kids: Vec<&str> = jwks["keys"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| k["kid"].as_str().unwrap())
        .collect();
    assert_eq!(kids.len(), 2);
    assert_eq!(kids[0], new_key);
    assert!(kids.contains(&old_key.as_str()));

    let listed = body_json(
        app.send(admin_request(Method::GET, "/admin/keys", Some(TEST_ADMIN_API_KEY)))
            .await,
    )
    .await;
    let active: Vec<_> = listed["keys"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|k| k["is_active"] == true)
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["key_id"], new_key.as_str());
}

#[tokio::test]
async fn test_startup_without_store_uses_fallback_key() {
    let config = test_config(&[("JWT_FALLBACK_SECRET", "fallback-secret-for-tests-only")]);
    let store = Arc::new(MemoryStore::new());
    store.set_offline(true);

    let state = AppState::new(config, store.clone(), Collaborators::default())
        .await
        .expect("fallback key should allow startup");
    assert!(state.keys.is_degraded());

    let router = session_authority::build_router(state.clone());
    let response = tower::ServiceExt::oneshot(
        router,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "degraded");

    // Once the store is back, the next maintenance pass installs a real key.
    store.set_offline(false);
    let report = state.maintenance().run_once().await.unwrap();
    assert!(report.rotated);
    assert!(!state.keys.is_degraded());
    assert_ne!(
        state.keys.key_status().current_key_id.as_deref(),
        Some("fallback")
    );
}

#[tokio::test]
async fn test_startup_without_store_or_fallback_fails() {
    let store = Arc::new(MemoryStore::new());
    store.set_offline(true);

    let result = AppState::new(test_config(&[]), store, Collaborators::default()).await;
    assert!(result.is_err());
}
