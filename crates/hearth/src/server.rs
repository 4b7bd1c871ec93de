use hearth_server::{CreateApiServiceParams, create_api_service};
use shared::libsql::{merge_migrations, open_database, run_migrations};
use telemetry::logic::logfile::RotatingLogWriter;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::CliError;
use crate::config::Config;

pub fn all_migrations() -> Result<Vec<shared::libsql::Migration>, shared::error::BridgeError> {
    merge_migrations(vec![
        encryption::repository::Repository::migrations(),
        identity::repository::Repository::migrations(),
        hub::repository::Repository::migrations(),
        telemetry::repository::Repository::migrations(),
    ])
}

/// Full server lifecycle: store, migrations, services, subsystems,
/// listener, graceful drain.
pub async fn run_server(config: Config) -> Result<(), CliError> {
    let log_writer = RotatingLogWriter::new(&config.log_dir, config.log_archives)?;
    shared::logging::configure_logging(Some(log_writer.clone()))
        .map_err(|e| CliError::Config(format!("failed to configure logging: {e}")))?;

    // Migrations run to completion before anything is served
    let (_db, conn) = open_database(&config.db_path).await?;
    let migrations = all_migrations()?;
    let applied = run_migrations(&conn, migrations)
        .await
        .map_err(|e| CliError::Migration(e.to_string()))?;
    if applied > 0 {
        info!(applied, "applied schema migrations");
    }

    let api_service = create_api_service(CreateApiServiceParams {
        conn,
        jwt_issuer: config.jwt_issuer.clone(),
        jwt_ttl_secs: config.jwt_ttl_secs,
        refresh_ttl_secs: config.refresh_ttl_secs,
        seed_admin: config.seed_admin,
        forbid_loopback: config.forbid_loopback,
        retention_days: config.retention_days,
        queue_config: config.queue_config.clone(),
        pool_config: config.pool_config.clone(),
        breaker_config: config.breaker_config.clone(),
        cache_capacity: config.cache_capacity,
        cache_default_ttl: config.cache_default_ttl,
        bridge_config: config.bridge_config.clone(),
        log_writer,
    })
    .await?;

    let shutdown = CancellationToken::new();
    let handles = hearth_server::subsystems::start_subsystems(&api_service, shutdown.clone());

    let app = hearth_server::router::build_app(&api_service);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| CliError::Config(format!("cannot bind {}: {e}", config.bind_addr)))?;
    info!(addr = %config.bind_addr, "hearth bridge listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            info!("shutdown signal received, draining");
            serve_shutdown.cancel();
        })
        .await
        .map_err(|e| CliError::Other(shared::error::BridgeError::from(e)))?;

    // In-flight calls drain within the grace window, then workers stop
    hearth_server::subsystems::shutdown_subsystems(handles, shutdown, config.shutdown_grace).await;
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
