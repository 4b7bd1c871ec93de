use std::time::Duration;

use bridge::logic::breaker::BreakerConfig;
use bridge::logic::pool::PoolConfig;
use bridge::logic::queue::QueueConfig;
use bridge::logic::registry::ToolRegistry;
use bridge::{BridgeConfig, BridgeService};
use encryption::logic::jwt::JwtSigner;
use encryption::logic::keys::{KeyPurpose, ensure_system_keys};
use encryption::logic::CryptoService;
use encryption::repository::SystemKeyRepositoryLike;
use hub::service::HubService;
use identity::service::IdentityService;
use shared::error::BridgeError;
use telemetry::logic::logfile::RotatingLogWriter;
use telemetry::{LogStore, Metrics};
use tracing::{debug, info, trace};

use crate::router::admin::AdminService;

pub struct CreateApiServiceParams {
    pub conn: shared::libsql::Connection,
    pub jwt_issuer: String,
    pub jwt_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    pub seed_admin: bool,
    pub forbid_loopback: bool,
    pub retention_days: i64,
    pub queue_config: QueueConfig,
    pub pool_config: PoolConfig,
    pub breaker_config: BreakerConfig,
    pub cache_capacity: usize,
    pub cache_default_ttl: Duration,
    pub bridge_config: BridgeConfig,
    pub log_writer: RotatingLogWriter,
}

/// Everything the HTTP surface and the subsystems need, assembled once at
/// startup and cloned into handlers.
#[derive(Clone)]
pub struct ApiService {
    pub identity_service: IdentityService,
    pub hub_service: HubService,
    pub bridge_service: BridgeService,
    pub admin_service: AdminService,
    pub metrics: Metrics,
    pub logstore: LogStore<telemetry::repository::Repository>,
    pub retention_days: i64,
}

/// Build repositories and services over an already-migrated store:
/// system keys first (everything cryptographic hangs off them), then the
/// seeds, then the service graph.
pub async fn create_api_service(
    params: CreateApiServiceParams,
) -> Result<ApiService, BridgeError> {
    let conn = params.conn;

    trace!("setting up repositories");
    let system_key_repo = encryption::repository::Repository::new(conn.clone());
    let identity_repo = identity::repository::Repository::new(conn.clone());
    let hub_repo = hub::repository::Repository::new(conn.clone());
    let telemetry_repo = telemetry::repository::Repository::new(conn.clone());

    // One active key per purpose must exist before any credential is
    // touched
    ensure_system_keys(&system_key_repo).await?;
    let hub_key = system_key_repo
        .get_active_key(KeyPurpose::HubTokenEncryption)
        .await?
        .ok_or_else(|| BridgeError::internal("hub encryption key missing after ensure"))?;
    let jwt_key = system_key_repo
        .get_active_key(KeyPurpose::JwtSigning)
        .await?
        .ok_or_else(|| BridgeError::internal("jwt signing key missing after ensure"))?;

    let crypto = CryptoService::from_system_key(&hub_key)?;
    let jwt_signer = JwtSigner::from_system_key(&jwt_key, params.jwt_issuer, params.jwt_ttl_secs)?;

    let metrics = Metrics::new();
    let logstore = LogStore::new(telemetry_repo.clone());

    // Seeds: the admin account and the default permission matrix
    if params.seed_admin {
        identity::logic::user::seed_default_admin(&identity_repo).await?;
    }
    use identity::repository::UserRepositoryLike;
    let registry = ToolRegistry::new();
    identity_repo
        .seed_default_permissions(&registry.default_permissions())
        .await?;
    debug!("seeded default tool permissions");

    let identity_service = IdentityService::new(
        identity_repo.clone(),
        jwt_signer,
        logstore.clone(),
        params.refresh_ttl_secs,
    );

    let probe_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| BridgeError::internal(format!("failed to build probe client: {e}")))?;

    let hub_service = HubService::new(
        hub_repo.clone(),
        identity_service.clone(),
        logstore.clone(),
        crypto.clone(),
        probe_client,
        params.forbid_loopback,
    );

    let bridge_service = BridgeService::new(bridge::service::BridgeServiceParams {
        identity: identity_service.clone(),
        hub_repository: hub_repo.clone(),
        crypto: crypto.clone(),
        telemetry: telemetry_repo.clone(),
        logstore: logstore.clone(),
        metrics: metrics.clone(),
        queue_config: params.queue_config,
        pool_config: params.pool_config,
        breaker_config: params.breaker_config,
        cache_capacity: params.cache_capacity,
        cache_default_ttl: params.cache_default_ttl,
        config: params.bridge_config,
        upstream: None,
    });

    let admin_service = AdminService {
        identity: identity_service.clone(),
        bridge: bridge_service.clone(),
        telemetry: telemetry_repo.clone(),
        metrics: metrics.clone(),
        logstore: logstore.clone(),
        log_writer: params.log_writer,
        retention_days: params.retention_days,
    };

    info!("api service assembled");
    Ok(ApiService {
        identity_service,
        hub_service,
        bridge_service,
        admin_service,
        metrics,
        logstore,
        retention_days: params.retention_days,
    })
}
