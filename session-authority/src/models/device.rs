//! Device model - clients a user has signed in from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{types::Json, FromRow};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Client-reported device attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema, Validate)]
pub struct DeviceSignals {
    #[validate(length(min = 1, max = 32))]
    pub platform: String,
    #[validate(length(max = 128))]
    pub model: Option<String>,
    #[validate(length(max = 64))]
    pub os_version: Option<String>,
    #[validate(length(max = 64))]
    pub app_version: Option<String>,
}

impl DeviceSignals {
    /// Stable fingerprint of the device attributes.
    pub fn handle(&self) -> String {
        let fingerprint = [
            self.platform.as_str(),
            self.model.as_deref().unwrap_or("unknown"),
            self.os_version.as_deref().unwrap_or("unknown"),
            self.app_version.as_deref().unwrap_or("unknown"),
        ]
        .join("|");

        hex::encode(Sha256::digest(fingerprint.as_bytes()))
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Device {
    pub device_id: Uuid,
    pub user_id: Uuid,
    pub platform: String,
    pub device_handle: String,
    pub signals: Json<DeviceSignals>,
    pub first_seen_utc: DateTime<Utc>,
    pub last_seen_utc: DateTime<Utc>,
}

impl Device {
    pub fn new(user_id: Uuid, signals: DeviceSignals, now: DateTime<Utc>) -> Self {
        Self {
            device_id: Uuid::new_v4(),
            user_id,
            platform: signals.platform.clone(),
            device_handle: signals.handle(),
            signals: Json(signals),
            first_seen_utc: now,
            last_seen_utc: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_is_stable_and_distinguishes_versions() {
        let ios = DeviceSignals {
            platform: "ios".to_string(),
            model: Some("iPhone15,2".to_string()),
            os_version: Some("17.1".to_string()),
            app_version: None,
        };
        assert_eq!(ios.handle(), ios.clone().handle());

        let upgraded = DeviceSignals {
            os_version: Some("17.2".to_string()),
            ..ios.clone()
        };
        assert_ne!(ios.handle(), upgraded.handle());
        assert_eq!(ios.handle().len(), 64);
    }
}
