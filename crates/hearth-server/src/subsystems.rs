use std::time::Duration;

use bridge::logic::dispatch::run_queue_consumer;
use shared::primitives::WrappedChronoDateTime;
use shared::subsystem::{SubsystemHandle, spawn_subsystem};
use telemetry::repository::TelemetryRepositoryLike;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::factory::ApiService;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const SCALER_INTERVAL: Duration = Duration::from_secs(10);
const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);
const LOG_ROTATE_INTERVAL: Duration = Duration::from_secs(60);

/// Start the background workers: queue consumer, session health checker,
/// pool scaler, retention sweeper and log rotator. Handles are awaited
/// during graceful shutdown.
pub fn start_subsystems(
    api_service: &ApiService,
    shutdown: CancellationToken,
) -> Vec<SubsystemHandle> {
    let mut handles = Vec::new();

    // Queue consumer: pairs admitted calls with session leases
    handles.push(spawn_subsystem("queue_consumer", shutdown.clone(), {
        let service = api_service.bridge_service.clone();
        let shutdown = shutdown.clone();
        async move { run_queue_consumer(service, shutdown).await }
    }));

    // Out-of-band session health checks
    handles.push(spawn_subsystem("health_checker", shutdown.clone(), {
        let service = api_service.bridge_service.clone();
        let shutdown = shutdown.clone();
        async move {
            let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => return Ok(()),
                }
                for pool in service.pools.pools() {
                    if let Some(base_url) = service
                        .upstream_urls
                        .get(&pool.upstream_id)
                        .map(|url| url.clone())
                    {
                        pool.health_check(&base_url).await;
                    }
                }
                service
                    .metrics
                    .set_active_sessions(service.pools.total_counts().live() as i64);
            }
        }
    }));

    // Pool scaler: grow under backlog, shrink when idle
    handles.push(spawn_subsystem("pool_scaler", shutdown.clone(), {
        let service = api_service.bridge_service.clone();
        let shutdown = shutdown.clone();
        async move {
            let mut ticker = tokio::time::interval(SCALER_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => return Ok(()),
                }
                let avg_latency = service.queue.avg_exec_ms();
                for pool in service.pools.pools() {
                    if let Err(e) = pool.ensure_baseline() {
                        error!(error = ?e, upstream = %pool.upstream_id, "baseline grow failed");
                    }
                    if pool.should_scale_up(avg_latency) {
                        if let Err(e) = pool.grow_one() {
                            error!(error = ?e, upstream = %pool.upstream_id, "scale up failed");
                        }
                    }
                    pool.scale_down_idle();
                }
            }
        }
    }));

    // Retention sweeper: store records past the horizon, expired auth
    // sessions, stale client sessions
    handles.push(spawn_subsystem("retention_sweeper", shutdown.clone(), {
        let service = api_service.clone();
        let shutdown = shutdown.clone();
        async move {
            let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
            // The first tick fires immediately; skip it so startup stays fast
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => return Ok(()),
                }
                let horizon = WrappedChronoDateTime::new(
                    chrono::Utc::now() - chrono::Duration::days(service.retention_days),
                );
                match service.admin_service.telemetry.cleanup(horizon).await {
                    Ok(outcome) => {
                        if outcome.logs_deleted + outcome.requests_deleted > 0 {
                            info!(
                                logs = outcome.logs_deleted,
                                requests = outcome.requests_deleted,
                                "retention sweep"
                            );
                        }
                    }
                    Err(e) => error!(error = ?e, "retention sweep failed"),
                }

                use identity::repository::UserRepositoryLike;
                if let Err(e) = service
                    .identity_service
                    .repository
                    .sweep_expired_sessions(WrappedChronoDateTime::now())
                    .await
                {
                    error!(error = ?e, "session sweep failed");
                }

                service.bridge_service.client_sessions.sweep();
            }
        }
    }));

    // Log rotator: roll the file over at the date boundary
    handles.push(spawn_subsystem("log_rotator", shutdown.clone(), {
        let writer = api_service.admin_service.log_writer.clone();
        let shutdown = shutdown.clone();
        async move {
            let mut ticker = tokio::time::interval(LOG_ROTATE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => return Ok(()),
                }
                match writer.rotate_if_date_changed() {
                    Ok(true) => info!("log file rolled over to a new date"),
                    Ok(false) => {}
                    Err(e) => error!(error = ?e, "log rotation failed"),
                }
            }
        }
    }));

    handles
}

/// Wait for in-flight work to drain, then force the remainder. Bounded by
/// `grace`; workers observe the shutdown token.
pub async fn shutdown_subsystems(
    handles: Vec<SubsystemHandle>,
    shutdown: CancellationToken,
    grace: Duration,
) {
    shutdown.cancel();

    let drain = async {
        for handle in handles {
            handle.wait_for_shutdown().await;
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        error!("graceful shutdown window elapsed; abandoning remaining workers");
    }
}
