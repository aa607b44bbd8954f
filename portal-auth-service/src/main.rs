use portal_auth_service::{
    build_router,
    config::{PortalConfig, StoreBackend},
    db,
    services::{
        metrics, CredentialStore, EmailProvider, EmailService, InMemoryCredentialStore,
        JwtService, LogOnlyEmailService, MockSessionCache, RedisService, SessionCache,
    },
    AppState,
};
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Fail fast on invalid configuration
    let config = PortalConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )?;

    metrics::init_metrics()
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Failed to register metrics: {}", e)))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        store_backend = ?config.store_backend,
        "Starting portal auth service"
    );

    let store: Arc<dyn CredentialStore> = match config.store_backend {
        StoreBackend::Postgres => {
            Arc::new(db::open_store(&config.database, config.store_retry.retry_config()).await?)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory credential store; nothing survives a restart");
            Arc::new(InMemoryCredentialStore::new())
        }
    };

    let cache: Arc<dyn SessionCache> = match &config.redis {
        Some(redis) => Arc::new(RedisService::new(redis).await?),
        None => {
            tracing::warn!("REDIS_URL not set, using an in-process session cache");
            Arc::new(MockSessionCache::new())
        }
    };

    let email: Arc<dyn EmailProvider> = match &config.gmail {
        Some(gmail) => Arc::new(EmailService::new(gmail)?),
        None => {
            tracing::warn!("GMAIL_USER not set, outgoing email will only be logged");
            Arc::new(LogOnlyEmailService)
        }
    };

    let jwt = JwtService::new(&config.jwt)?;

    let addr = config.common.socket_addr();
    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );

    let matrix_refresh_seconds = config.provisioning.matrix_refresh_seconds;
    let state = AppState::new(config, store, cache, email, jwt).await?;
    if matrix_refresh_seconds > 0 {
        state
            .authz
            .matrix()
            .clone()
            .spawn_refresh(Duration::from_secs(matrix_refresh_seconds));
    }
    let app = build_router(state);

    let _guard = service_span.enter();
    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
}
