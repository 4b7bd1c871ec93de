use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use encryption::logic::CryptoService;
use encryption::logic::jwt::JwtSigner;
use encryption::logic::keys::{KeyPurpose, generate_system_key};
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use identity::service::IdentityService;
use parking_lot::Mutex;
use shared::error::BridgeError;
use telemetry::{LogStore, Metrics};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::logic::breaker::BreakerConfig;
use crate::logic::dispatch::run_queue_consumer;
use crate::logic::pool::{PoolConfig, UpstreamSession};
use crate::logic::queue::QueueConfig;
use crate::logic::registry::{ToolRegistry, UpstreamRequest};
use crate::logic::upstream::UpstreamClientLike;
use crate::service::{BridgeConfig, BridgeService, BridgeServiceParams};

type ScriptFn = Box<dyn Fn(&UpstreamRequest) -> Result<serde_json::Value, BridgeError> + Send>;

/// Programmable upstream: a script decides each response, a delay models a
/// slow hub, and a counter proves how many calls actually went out.
pub struct ScriptedUpstream {
    script: Mutex<ScriptFn>,
    delay: Mutex<Duration>,
    pub calls: AtomicUsize,
}

impl ScriptedUpstream {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Box::new(|_req| Ok(serde_json::json!([])))),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_script(
        &self,
        script: impl Fn(&UpstreamRequest) -> Result<serde_json::Value, BridgeError> + Send + 'static,
    ) {
        *self.script.lock() = Box::new(script);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn fail_connect(&self) {
        self.set_script(|_req| {
            Err(BridgeError::UpstreamUnavailable {
                msg: "could not connect to upstream".to_string(),
                retry_after_ms: 1_000,
                source: None,
            })
        });
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamClientLike for ScriptedUpstream {
    async fn execute(
        &self,
        _session: &UpstreamSession,
        _base_url: &str,
        _token: &str,
        request: &UpstreamRequest,
    ) -> Result<serde_json::Value, BridgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        (self.script.lock())(request)
    }
}

pub struct HarnessOptions {
    pub queue_capacity: usize,
    pub max_inflight_per_user: usize,
    pub pool_max_sessions: usize,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery: Duration,
    pub cache_default_ttl: Duration,
    pub default_timeout: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            max_inflight_per_user: 16,
            pool_max_sessions: 2,
            breaker_failure_threshold: 5,
            breaker_recovery: Duration::from_millis(200),
            cache_default_ttl: Duration::from_secs(30),
            default_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Harness {
    pub app: Router,
    pub service: BridgeService,
    pub upstream: Arc<ScriptedUpstream>,
    pub identity_repo: identity::repository::Repository,
    pub hub_repo: hub::repository::Repository,
    pub telemetry_repo: telemetry::repository::Repository,
    pub consumer_shutdown: CancellationToken,
    // Keeps the in-memory database alive for the harness lifetime
    _db: libsql::Database,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.consumer_shutdown.cancel();
    }
}

pub async fn harness() -> Harness {
    harness_with(HarnessOptions::default()).await
}

pub async fn harness_with(options: HarnessOptions) -> Harness {
    shared::setup_test!();

    let (db, conn) = shared::test_utils::repository::setup_in_memory_database(vec![
        encryption::repository::Repository::migrations(),
        identity::repository::Repository::migrations(),
        hub::repository::Repository::migrations(),
        telemetry::repository::Repository::migrations(),
    ])
    .await
    .unwrap();

    let identity_repo = identity::repository::Repository::new(conn.clone());
    let hub_repo = hub::repository::Repository::new(conn.clone());
    let telemetry_repo = telemetry::repository::Repository::new(conn.clone());
    let logstore = LogStore::new(telemetry_repo.clone());

    let jwt_signer = JwtSigner::from_system_key(
        &generate_system_key(KeyPurpose::JwtSigning),
        "hearth-test",
        3600,
    )
    .unwrap();
    let crypto =
        CryptoService::from_system_key(&generate_system_key(KeyPurpose::HubTokenEncryption))
            .unwrap();

    let identity_service = IdentityService::new(
        identity_repo.clone(),
        jwt_signer,
        logstore.clone(),
        7 * 24 * 3600,
    );

    // Seed the admin and the default permission matrix
    identity::logic::user::seed_default_admin(&identity_repo)
        .await
        .unwrap();
    use identity::repository::UserRepositoryLike;
    identity_repo
        .seed_default_permissions(&ToolRegistry::new().default_permissions())
        .await
        .unwrap();

    let upstream = ScriptedUpstream::ok();

    let service = BridgeService::new(BridgeServiceParams {
        identity: identity_service.clone(),
        hub_repository: hub_repo.clone(),
        crypto: crypto.clone(),
        telemetry: telemetry_repo.clone(),
        logstore: logstore.clone(),
        metrics: Metrics::new(),
        queue_config: QueueConfig {
            capacity: options.queue_capacity,
            max_inflight_per_user: options.max_inflight_per_user,
        },
        pool_config: PoolConfig {
            max_sessions: options.pool_max_sessions,
            ..PoolConfig::default()
        },
        breaker_config: BreakerConfig {
            failure_threshold: options.breaker_failure_threshold,
            recovery_timeout: options.breaker_recovery,
            ..BreakerConfig::default()
        },
        cache_capacity: 256,
        cache_default_ttl: options.cache_default_ttl,
        config: BridgeConfig {
            default_timeout: options.default_timeout,
            ..BridgeConfig::default()
        },
        upstream: Some(upstream.clone()),
    });

    let consumer_shutdown = CancellationToken::new();
    tokio::spawn(run_queue_consumer(service.clone(), consumer_shutdown.clone()));

    // Hub config for the seeded admin
    let admin = identity_repo
        .get_user_by_username("admin")
        .await
        .unwrap()
        .unwrap();
    hub::logic::config::create_config(
        &hub_repo,
        &crypto,
        admin.id,
        hub::logic::config::HubConfigParams {
            name: "test-hub".to_string(),
            url: "http://hub.test:8123".to_string(),
            token: Some("llat-test-token".to_string()),
            is_default: true,
        },
        false,
    )
    .await
    .unwrap();

    let identity_router = {
        let (router, _openapi) = identity::router::create_router().split_for_parts();
        router.with_state(identity_service.clone())
    };
    let app = crate::router::create_router(service.clone()).merge(identity_router);

    Harness {
        app,
        service,
        upstream,
        identity_repo,
        hub_repo,
        telemetry_repo,
        consumer_shutdown,
        _db: db,
    }
}

// ============================================
// Request helpers
// ============================================

pub async fn send_json(
    app: &Router,
    request: Request<Body>,
) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}

pub async fn login(app: &Router, username: &str, password: &str) -> String {
    let request = Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "username": username, "password": password }).to_string(),
        ))
        .unwrap();
    let (status, body) = send_json(app, request).await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    body["access_token"].as_str().unwrap().to_string()
}

pub async fn initialize(app: &Router, token: &str) -> String {
    let request = Request::builder()
        .method("POST")
        .uri("/mcp/initialize")
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::json!({ "id": 1 }).to_string()))
        .unwrap();
    let (status, body) = send_json(app, request).await;
    assert_eq!(status, StatusCode::OK, "initialize failed: {body}");
    body["result"]["session_id"].as_str().unwrap().to_string()
}

pub struct CallOptions<'a> {
    pub priority: Option<&'a str>,
    pub timeout: Option<&'a str>,
    pub request_id: Option<&'a str>,
}

impl Default for CallOptions<'_> {
    fn default() -> Self {
        Self {
            priority: None,
            timeout: None,
            request_id: None,
        }
    }
}

pub async fn call_tool(
    app: &Router,
    token: &str,
    session_id: &str,
    name: &str,
    arguments: serde_json::Value,
    options: CallOptions<'_>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/mcp/tools/call")
        .header("authorization", format!("Bearer {token}"))
        .header("x-session-id", session_id)
        .header("content-type", "application/json");
    if let Some(priority) = options.priority {
        builder = builder.header("x-priority", priority);
    }
    if let Some(timeout) = options.timeout {
        builder = builder.header("x-timeout", timeout);
    }
    if let Some(request_id) = options.request_id {
        builder = builder.header("x-request-id", request_id);
    }

    let request = builder
        .body(Body::from(
            serde_json::json!({ "id": 1, "name": name, "arguments": arguments }).to_string(),
        ))
        .unwrap();
    send_json(app, request).await
}
