use hub_auth::{
    config::{AuthConfig, BlacklistBackend, Environment},
    db,
    federation::FederationGateway,
    services::{
        AuthError, AuthService, AuthSettings, EmailProvider, LoggingSmsProvider,
        MaintenanceWorker, MockEmailService, SmtpEmailService,
    },
    store::{PgStore, RedisBlacklist, Stores},
};
use service_core::error::AppError;
use service_core::observability::logging::init_tracing;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = AuthConfig::from_env()?;

    init_tracing(
        &config.common.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    )?;

    tracing::info!(
        service = %config.common.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting authentication core"
    );

    let pool = db::create_pool(&config.database)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::Error::new(e)))?;
    db::run_migrations(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::Error::new(e)))?;

    let backend = Arc::new(PgStore::new(pool));
    let mut stores = Stores::from_backend(backend);

    if config.blacklist_backend == BlacklistBackend::Redis {
        if let Some(redis) = &config.redis {
            let blacklist = RedisBlacklist::connect(&redis.url)
                .await
                .map_err(AuthError::from)?;
            stores = stores.with_blacklist(Arc::new(blacklist));
            tracing::info!("Token blacklist backed by Redis");
        }
    }

    let email: Arc<dyn EmailProvider> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpEmailService::new(smtp)?),
        None if config.environment == Environment::Prod => {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SMTP_HOST is required in production"
            )));
        }
        None => {
            tracing::warn!("SMTP not configured; outgoing email is only recorded in memory");
            Arc::new(MockEmailService::new())
        }
    };

    let federation = FederationGateway::from_config(
        &config.federation,
        stores.users.clone(),
        stores.federation.clone(),
    )
    .await
    .map_err(AuthError::from)?;

    let auth = AuthService::new(
        AuthSettings::from(&config),
        &stores,
        email,
        Arc::new(LoggingSmsProvider),
        Arc::new(federation),
    )?;

    let worker = MaintenanceWorker::new(auth, &stores, config.maintenance.telemetry_retention_days);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = Duration::from_secs(config.maintenance.interval_seconds);

    let handle = tokio::spawn(async move {
        worker.run_periodic_cleanup(interval, shutdown_rx).await;
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = handle.await {
        tracing::error!(error = %e, "Maintenance worker panicked");
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
