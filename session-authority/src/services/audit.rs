//! Fire-and-forget audit trail.

use std::{sync::Arc, time::Duration};
use uuid::Uuid;

use crate::models::{AuthEvent, AuthEventDetails, AuthEventType};
use crate::store::{bounded, AuditStore};

#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
    timeout: Duration,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn AuditStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Append an event in the background. A failed insert is logged and
    /// otherwise ignored; it never affects the caller's result.
    pub fn record(
        &self,
        user_id: Option<Uuid>,
        event_type: AuthEventType,
        success: bool,
        details: AuthEventDetails,
    ) {
        let event = AuthEvent::new(user_id, event_type, success, details);
        let store = self.store.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            if let Err(e) = bounded(timeout, store.append_event(&event)).await {
                tracing::warn!(
                    error = %e,
                    event_type = %event.event_type,
                    user_id = ?event.user_id,
                    "Failed to record auth event"
                );
            }
        });
    }
}
