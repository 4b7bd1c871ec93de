use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use encryption::logic::CryptoService;
use identity::service::IdentityService;
use telemetry::{LogStore, Metrics};

use crate::logic::breaker::{BreakerConfig, BreakerRegistry};
use crate::logic::cache::{ResultCache, SingleFlight};
use crate::logic::client_session::ClientSessionRegistry;
use crate::logic::pool::{PoolConfig, PoolRegistry, SessionLease};
use crate::logic::queue::{QueueConfig, RequestQueue};
use crate::logic::registry::ToolRegistry;
use crate::logic::upstream::{HttpUpstreamClient, UpstreamClientLike};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Deadline applied when the client sends no `X-Timeout`.
    pub default_timeout: Duration,
    /// Hard ceiling for `X-Timeout`; larger values are clamped.
    pub timeout_ceiling: Duration,
    /// Attempt budget for retryable (read-only) calls.
    pub max_retry_attempts: u32,
    /// Client session idle TTL.
    pub client_session_ttl: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            timeout_ceiling: Duration::from_secs(120),
            max_retry_attempts: 3,
            client_session_ttl: Duration::from_secs(3600),
        }
    }
}

pub struct BridgeServiceParams {
    pub identity: IdentityService,
    pub hub_repository: hub::repository::Repository,
    pub crypto: CryptoService,
    pub telemetry: telemetry::repository::Repository,
    pub logstore: LogStore<telemetry::repository::Repository>,
    pub metrics: Metrics,
    pub queue_config: QueueConfig,
    pub pool_config: PoolConfig,
    pub breaker_config: BreakerConfig,
    pub cache_capacity: usize,
    pub cache_default_ttl: Duration,
    pub config: BridgeConfig,
    /// Overridable for tests; `None` uses the real HTTP client.
    pub upstream: Option<Arc<dyn UpstreamClientLike>>,
}

/// The dispatcher's world: every long-lived runtime piece, owned by the
/// composition root and shared by handlers and subsystems.
#[derive(Clone)]
pub struct BridgeService {
    pub identity: IdentityService,
    pub hub_repository: hub::repository::Repository,
    pub crypto: CryptoService,
    pub telemetry: telemetry::repository::Repository,
    pub logstore: LogStore<telemetry::repository::Repository>,
    pub metrics: Metrics,
    pub registry: Arc<ToolRegistry>,
    pub cache: Arc<ResultCache>,
    pub flights: Arc<SingleFlight>,
    pub breakers: BreakerRegistry,
    pub queue: Arc<RequestQueue<SessionLease>>,
    pub pools: PoolRegistry,
    /// Base URL per upstream id, maintained at dispatch time for the
    /// health checker.
    pub upstream_urls: Arc<DashMap<String, String>>,
    pub upstream: Arc<dyn UpstreamClientLike>,
    pub client_sessions: ClientSessionRegistry,
    pub config: BridgeConfig,
}

impl BridgeService {
    pub fn new(params: BridgeServiceParams) -> Self {
        Self {
            identity: params.identity,
            hub_repository: params.hub_repository,
            crypto: params.crypto,
            telemetry: params.telemetry,
            logstore: params.logstore,
            metrics: params.metrics,
            registry: Arc::new(ToolRegistry::new()),
            cache: Arc::new(ResultCache::new(params.cache_capacity, params.cache_default_ttl)),
            flights: Arc::new(SingleFlight::new()),
            breakers: BreakerRegistry::new(params.breaker_config),
            queue: Arc::new(RequestQueue::new(params.queue_config)),
            pools: PoolRegistry::new(params.pool_config),
            upstream_urls: Arc::new(DashMap::new()),
            upstream: params
                .upstream
                .unwrap_or_else(|| Arc::new(HttpUpstreamClient)),
            client_sessions: ClientSessionRegistry::new(params.config.client_session_ttl),
            config: params.config,
        }
    }
}
