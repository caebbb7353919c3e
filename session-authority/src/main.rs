use session_authority::{
    build_router,
    config::{AuthorityConfig, StoreBackend},
    db,
    services::Collaborators,
    store::{MemoryStore, PgStore},
    AppState,
};
use service_core::{error::AppError, observability::init_tracing};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();

    // Load configuration - fail fast if invalid
    let config = AuthorityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        backend = ?config.store.backend,
        "Starting session authority"
    );

    let state = match config.store.backend {
        StoreBackend::Postgres => {
            let pool = db::create_pool(&config.store)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
            db::run_migrations(&pool)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
            AppState::new(config.clone(), Arc::new(PgStore::new(pool)), Collaborators::default())
                .await?
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; nothing survives a restart");
            AppState::new(config.clone(), Arc::new(MemoryStore::new()), Collaborators::default())
                .await?
        }
    };

    if state.keys.is_degraded() {
        tracing::warn!("Signing with the fallback key until the key store recovers");
    }

    let shutdown = CancellationToken::new();
    let maintenance = state.maintenance().spawn(
        Duration::from_secs(config.signing_keys.check_interval_seconds),
        shutdown.clone(),
    );

    let app = build_router(state);

    let addr = SocketAddr::new(config.common.host, config.common.port);
    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    shutdown.cancel();
    if let Err(e) = maintenance.await {
        tracing::error!(error = %e, "Maintenance task ended abnormally");
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    shutdown.cancel();
}
