use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::{interval_at, Instant}};
use tokio_util::sync::CancellationToken;

use crate::services::{AuthError, DelegatedEngine, KeyAuthority, SessionLedger};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    pub rotated: bool,
    pub deleted_keys: usize,
    pub purged_sessions: u64,
    pub purged_grants: u64,
}

/// Periodic key rotation check plus cleanup of expired sessions and grants.
#[derive(Clone)]
pub struct MaintenanceJob {
    keys: Arc<KeyAuthority>,
    ledger: Arc<SessionLedger>,
    delegated: Arc<DelegatedEngine>,
}

impl MaintenanceJob {
    pub fn new(
        keys: Arc<KeyAuthority>,
        ledger: Arc<SessionLedger>,
        delegated: Arc<DelegatedEngine>,
    ) -> Self {
        Self {
            keys,
            ledger,
            delegated,
        }
    }

    /// One pass. A failed step is logged and does not stop the others.
    pub async fn run_once(&self) -> Result<MaintenanceReport, AuthError> {
        let mut report = MaintenanceReport::default();
        let mut first_error: Option<AuthError> = None;

        match self.keys.check_rotation().await {
            Ok(check) => {
                report.rotated = check.rotated;
                report.deleted_keys = check.deleted.len();
            }
            Err(e) => {
                tracing::error!(error = %e, "Signing key rotation check failed");
                first_error.get_or_insert(e);
            }
        }

        match self.ledger.purge_expired().await {
            Ok(count) => report.purged_sessions = count,
            Err(e) => {
                tracing::error!(error = %e, "Expired session purge failed");
                first_error.get_or_insert(e);
            }
        }

        match self.delegated.purge_expired().await {
            Ok(count) => report.purged_grants = count,
            Err(e) => {
                tracing::error!(error = %e, "Expired grant purge failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Run every `every` until `shutdown` is cancelled. The first pass
    /// happens one interval after start; startup already loaded the keys.
    pub fn spawn(self, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + every, every);
            tracing::info!(interval = ?every, "Maintenance job scheduled");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Maintenance job stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        match self.run_once().await {
                            Ok(report) => tracing::info!(
                                rotated = report.rotated,
                                deleted_keys = report.deleted_keys,
                                purged_sessions = report.purged_sessions,
                                purged_grants = report.purged_grants,
                                "Maintenance pass completed"
                            ),
                            Err(e) => tracing::warn!(error = %e, "Maintenance pass failed, retrying next tick"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthorityConfig;
    use crate::services::Collaborators;
    use crate::store::MemoryStore;
    use crate::AppState;

    async fn job(store: Arc<MemoryStore>) -> MaintenanceJob {
        let config = AuthorityConfig::from_lookup(service_core::config::Config::default(), |key| {
            match key {
                "ADMIN_API_KEY" => Some("admin".to_string()),
                "STORE_BACKEND" => Some("memory".to_string()),
                _ => None,
            }
        })
        .unwrap();
        AppState::new(config, store, Collaborators::default())
            .await
            .unwrap()
            .maintenance()
    }

    #[tokio::test]
    async fn test_quiet_pass_on_fresh_keys() {
        let job = job(Arc::new(MemoryStore::new())).await;

        let report = job.run_once().await.unwrap();
        assert_eq!(report, MaintenanceReport::default());
    }

    #[tokio::test]
    async fn test_pass_reports_store_outage() {
        let store = Arc::new(MemoryStore::new());
        let job = job(store.clone()).await;

        store.set_offline(true);
        assert!(matches!(job.run_once().await, Err(AuthError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_spawned_job_stops_on_cancel() {
        let job = job(Arc::new(MemoryStore::new())).await;
        let shutdown = CancellationToken::new();

        let handle = job.spawn(Duration::from_secs(3600), shutdown.clone());
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("job did not stop")
            .unwrap();
    }
}
