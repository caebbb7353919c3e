use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::SigningKeyInfo;
use crate::services::KeyStatus;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RotateKeysResponse {
    #[schema(example = "3f9a1c2b7d4e8f60")]
    pub key_id: String,
    #[schema(example = "Signing key rotated")]
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct KeyStatusResponse {
    #[serde(flatten)]
    pub status: KeyStatus,
    pub keys: Vec<SigningKeyInfo>,
}
