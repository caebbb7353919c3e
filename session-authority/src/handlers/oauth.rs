//! OAuth 2.0 / OpenID Connect endpoints for delegated clients.
//!
//! Errors here use the RFC 6749 body shape instead of the service-wide
//! `AppError` JSON.

use axum::{
    extract::{
        rejection::{FormRejection, QueryRejection},
        OriginalUri, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use service_core::error::DEPENDENCY_RETRY_AFTER_SECS;
use url::Url;

use crate::{
    dtos::{
        oauth::{AuthorizeQuery, TokenOnlyRequest, TokenRequest},
        OAuthErrorResponse,
    },
    middleware::bearer_token,
    models::ChallengeMethod,
    services::{delegated::AuthorizationRequest, AuthError},
    AppState,
};

#[derive(Debug)]
pub enum OAuthError {
    Auth(AuthError),
    InvalidRequest(String),
    UnsupportedGrantType(String),
    UnsupportedResponseType(String),
}

impl From<AuthError> for OAuthError {
    fn from(err: AuthError) -> Self {
        OAuthError::Auth(err)
    }
}

impl OAuthError {
    fn code(&self) -> &'static str {
        match self {
            OAuthError::Auth(err) => err.oauth_error_code(),
            OAuthError::InvalidRequest(_) => "invalid_request",
            OAuthError::UnsupportedGrantType(_) => "unsupported_grant_type",
            OAuthError::UnsupportedResponseType(_) => "unsupported_response_type",
        }
    }

    fn description(&self) -> Option<String> {
        match self {
            OAuthError::Auth(AuthError::Internal(_)) => None,
            OAuthError::Auth(err) => Some(err.to_string()),
            OAuthError::InvalidRequest(msg)
            | OAuthError::UnsupportedGrantType(msg)
            | OAuthError::UnsupportedResponseType(msg) => Some(msg.clone()),
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let code = self.code();
        let status = match code {
            "invalid_client" | "invalid_token" => StatusCode::UNAUTHORIZED,
            "temporarily_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            "server_error" => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };

        if let OAuthError::Auth(AuthError::Internal(err)) = &self {
            tracing::error!(error = %format!("{:#}", err), "OAuth endpoint failed");
        }

        let mut res = (
            status,
            Json(OAuthErrorResponse {
                error: code.to_string(),
                error_description: self.description(),
            }),
        )
            .into_response();

        let headers = res.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        match code {
            "temporarily_unavailable" => {
                headers.insert(header::RETRY_AFTER, DEPENDENCY_RETRY_AFTER_SECS.into());
            }
            "invalid_token" => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer error=\"invalid_token\""),
                );
            }
            _ => {}
        }

        res
    }
}

fn required(value: Option<String>, name: &str) -> Result<String, OAuthError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::InvalidRequest(format!("{} is required", name)))
}

/// 302 to `location`.
fn found(location: &Url) -> Result<Response, OAuthError> {
    let value = HeaderValue::from_str(location.as_str()).map_err(|e| {
        OAuthError::Auth(AuthError::Internal(anyhow::anyhow!("unusable redirect location: {}", e)))
    })?;
    Ok((StatusCode::FOUND, [(header::LOCATION, value)]).into_response())
}

fn login_redirect(login_url: &str, return_to: &str) -> Result<Response, OAuthError> {
    let mut url = Url::parse(login_url).map_err(|e| {
        OAuthError::Auth(AuthError::Internal(anyhow::anyhow!("LOGIN_URL is not a valid URL: {}", e)))
    })?;
    url.query_pairs_mut().append_pair("return_to", return_to);
    found(&url)
}

/// Start an authorization-code grant for the signed-in user
#[utoipa::path(
    get,
    path = "/oauth/authorize",
    params(AuthorizeQuery),
    responses(
        (status = 302, description = "Redirect to the client with a code, or to the login page"),
        (status = 400, description = "Invalid request", body = OAuthErrorResponse),
        (status = 401, description = "Unknown client or redirect URI", body = OAuthErrorResponse)
    ),
    tag = "OAuth",
    security(
        (),
        ("bearer_auth" = [])
    )
)]
pub async fn authorize(
    State(state): State<AppState>,
    OriginalUri(original_uri): OriginalUri,
    headers: HeaderMap,
    query: Result<Query<AuthorizeQuery>, QueryRejection>,
) -> Result<Response, OAuthError> {
    let Query(query) = query.map_err(|e| OAuthError::InvalidRequest(e.body_text()))?;

    if query.response_type != "code" {
        return Err(OAuthError::UnsupportedResponseType(
            "only response_type=code is supported".to_string(),
        ));
    }
    let code_challenge = required(query.code_challenge, "code_challenge")?;
    if query.code_challenge_method.as_deref() != Some(ChallengeMethod::S256.as_str()) {
        return Err(OAuthError::InvalidRequest(
            "code_challenge_method must be S256".to_string(),
        ));
    }

    let claims = match bearer_token(&headers) {
        Some(token) => match state.ledger.validate_access(token).await {
            Ok(claims) => Some(claims),
            Err(e @ (AuthError::Timeout | AuthError::Unavailable(_) | AuthError::Internal(_))) => {
                return Err(e.into())
            }
            Err(_) => None,
        },
        None => None,
    };
    let Some(claims) = claims else {
        return login_redirect(&state.config.oidc.login_url, &original_uri.to_string());
    };

    let issued = state
        .delegated
        .issue_authorization_code(AuthorizationRequest {
            user_id: claims.user_id()?,
            client_id: query.client_id,
            redirect_uri: query.redirect_uri,
            scope: query.scope,
            code_challenge,
            challenge_method: ChallengeMethod::S256,
        })
        .await?;

    let mut target = Url::parse(&issued.redirect_uri)
        .map_err(|e| OAuthError::InvalidRequest(format!("redirect_uri is not a valid URL: {}", e)))?;
    {
        let mut pairs = target.query_pairs_mut();
        pairs.append_pair("code", &issued.code);
        if let Some(client_state) = &query.state {
            pairs.append_pair("state", client_state);
        }
    }

    found(&target)
}

/// Token endpoint: `authorization_code` and `refresh_token` grants
#[utoipa::path(
    post,
    path = "/oauth/token",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Tokens issued", body = DelegatedTokenResponse),
        (status = 400, description = "Invalid grant, scope or request", body = OAuthErrorResponse),
        (status = 401, description = "Invalid client", body = OAuthErrorResponse),
        (status = 503, description = "Store unavailable", body = OAuthErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn token(
    State(state): State<AppState>,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Result<impl IntoResponse, OAuthError> {
    let Form(req) = form.map_err(|e| OAuthError::InvalidRequest(e.body_text()))?;

    let response = match req.grant_type.as_str() {
        "authorization_code" => {
            let code = required(req.code, "code")?;
            let client_id = required(req.client_id, "client_id")?;
            let redirect_uri = required(req.redirect_uri, "redirect_uri")?;
            let verifier = required(req.code_verifier, "code_verifier")?;
            state
                .delegated
                .exchange_code(&code, &client_id, &redirect_uri, &verifier)
                .await?
        }
        "refresh_token" => {
            let refresh_token = required(req.refresh_token, "refresh_token")?;
            state
                .delegated
                .refresh(&refresh_token, req.client_id.as_deref(), req.scope.as_deref())
                .await?
        }
        other => {
            return Err(OAuthError::UnsupportedGrantType(format!(
                "grant_type '{}' is not supported",
                other
            )))
        }
    };

    Ok((
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        Json(response),
    ))
}

/// Claims about the user behind a delegated access token
#[utoipa::path(
    get,
    path = "/oauth/userinfo",
    responses(
        (status = 200, description = "User claims", body = UserInfo),
        (status = 401, description = "Invalid token", body = OAuthErrorResponse)
    ),
    tag = "OAuth",
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn userinfo(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, OAuthError> {
    let token = bearer_token(&headers).ok_or(OAuthError::Auth(AuthError::InvalidToken))?;
    let info = state.delegated.userinfo(token).await?;
    Ok(Json(info))
}

/// RFC 7662 token introspection
#[utoipa::path(
    post,
    path = "/oauth/introspect",
    request_body(content = TokenOnlyRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Token status returned", body = IntrospectionResponse)
    ),
    tag = "OAuth"
)]
pub async fn introspect(
    State(state): State<AppState>,
    form: Result<Form<TokenOnlyRequest>, FormRejection>,
) -> Result<impl IntoResponse, OAuthError> {
    let Form(req) = form.map_err(|e| OAuthError::InvalidRequest(e.body_text()))?;
    Ok(Json(state.delegated.introspect(&req.token).await))
}

/// RFC 7009 token revocation
#[utoipa::path(
    post,
    path = "/oauth/revoke",
    request_body(content = TokenOnlyRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Token revoked, or was not revocable"),
        (status = 503, description = "Store unavailable", body = OAuthErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn revoke(
    State(state): State<AppState>,
    form: Result<Form<TokenOnlyRequest>, FormRejection>,
) -> Result<StatusCode, OAuthError> {
    let Form(req) = form.map_err(|e| OAuthError::InvalidRequest(e.body_text()))?;
    state.delegated.revoke(&req.token).await?;
    Ok(StatusCode::OK)
}
