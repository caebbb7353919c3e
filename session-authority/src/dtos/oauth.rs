use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuthorizeQuery {
    #[param(example = "code")]
    pub response_type: String,
    #[param(example = "my-app")]
    pub client_id: String,
    #[param(example = "https://app.example.com/callback")]
    pub redirect_uri: String,
    #[param(example = "openid email")]
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    #[param(example = "S256")]
    pub code_challenge_method: Option<String>,
}

/// `application/x-www-form-urlencoded` body of the token endpoint.
#[derive(Debug, Deserialize, ToSchema)]
pub struct TokenRequest {
    #[schema(example = "authorization_code")]
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TokenOnlyRequest {
    pub token: String,
    pub token_type_hint: Option<String>,
}
