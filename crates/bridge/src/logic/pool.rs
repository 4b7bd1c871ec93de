use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use shared::error::BridgeError;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_sessions: usize,
    pub target_sessions: usize,
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    /// Scale up when `pending > factor × active`.
    pub scale_pending_factor: usize,
    /// ...and the latency moving average exceeds this.
    pub scale_latency_threshold_ms: u64,
    /// Per-request timeout baked into each session's HTTP client.
    pub upstream_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_sessions: 1,
            target_sessions: 2,
            max_sessions: 8,
            idle_timeout: Duration::from_secs(300),
            scale_pending_factor: 2,
            scale_latency_threshold_ms: 500,
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Initializing,
    Healthy,
    Busy,
    Reconnecting,
    Closed,
}

/// One backend session: a dedicated HTTP client with its own connection
/// pool, exclusively leased to at most one in-flight call.
pub struct UpstreamSession {
    pub id: String,
    client: Mutex<reqwest::Client>,
    state: Mutex<SessionState>,
    last_used: Mutex<Instant>,
}

impl UpstreamSession {
    fn new(upstream_timeout: Duration) -> Result<Self, BridgeError> {
        let session = Self {
            id: uuid::Uuid::new_v4().to_string(),
            client: Mutex::new(build_client(upstream_timeout)?),
            state: Mutex::new(SessionState::Initializing),
            last_used: Mutex::new(Instant::now()),
        };
        // Client construction succeeded; the session can serve traffic
        *session.state.lock() = SessionState::Healthy;
        Ok(session)
    }

    pub fn client(&self) -> reqwest::Client {
        self.client.lock().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, BridgeError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| BridgeError::Internal(anyhow::anyhow!("failed to build http client: {e}")))
}

/// Exclusive use of one session for one call. Dropping the lease returns
/// the session; a lease marked failed sends it through reconnection
/// instead.
pub struct SessionLease {
    session: Arc<UpstreamSession>,
    pool: Arc<UpstreamPool>,
    failed: bool,
}

impl SessionLease {
    pub fn session(&self) -> &Arc<UpstreamSession> {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    /// The upstream did not acknowledge the call cleanly (error, timeout,
    /// or forced cancel); recycle the session instead of reusing it.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.pool.release(&self.session, !self.failed);
    }
}

/// Session pool for one upstream identity. Sessions scale between min and
/// max; acquisition hands out exclusive leases in arrival order of the
/// acquirers.
pub struct UpstreamPool {
    pub upstream_id: String,
    config: PoolConfig,
    sessions: Mutex<Vec<Arc<UpstreamSession>>>,
    notify: Notify,
    pending: AtomicUsize,
}

impl UpstreamPool {
    pub fn new(upstream_id: String, config: PoolConfig) -> Self {
        Self {
            upstream_id,
            config,
            sessions: Mutex::new(Vec::new()),
            notify: Notify::new(),
            pending: AtomicUsize::new(0),
        }
    }

    fn try_lease(self: &Arc<Self>) -> Result<Option<SessionLease>, BridgeError> {
        let mut sessions = self.sessions.lock();

        for session in sessions.iter() {
            let mut state = session.state.lock();
            if *state == SessionState::Healthy {
                *state = SessionState::Busy;
                *session.last_used.lock() = Instant::now();
                return Ok(Some(SessionLease {
                    session: session.clone(),
                    pool: self.clone(),
                    failed: false,
                }));
            }
        }

        // No free session: grow if the cap allows
        let live = sessions
            .iter()
            .filter(|s| s.state() != SessionState::Closed)
            .count();
        if live < self.config.max_sessions {
            let session = Arc::new(UpstreamSession::new(self.config.upstream_timeout)?);
            debug!(
                upstream = %self.upstream_id,
                session = %session.id,
                "created upstream session"
            );
            *session.state.lock() = SessionState::Busy;
            sessions.push(session.clone());
            return Ok(Some(SessionLease {
                session,
                pool: self.clone(),
                failed: false,
            }));
        }

        Ok(None)
    }

    /// Wait for an exclusive session lease. Returns `Cancelled` when the
    /// caller's token fires first.
    pub async fn acquire(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<SessionLease, BridgeError> {
        self.pending.fetch_add(1, Ordering::Relaxed);
        let result = self.acquire_inner(cancel).await;
        self.pending.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn acquire_inner(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<SessionLease, BridgeError> {
        loop {
            if let Some(lease) = self.try_lease()? {
                return Ok(lease);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
            }
        }
    }

    fn release(&self, session: &Arc<UpstreamSession>, healthy: bool) {
        {
            let mut state = session.state.lock();
            *state = if healthy {
                SessionState::Healthy
            } else {
                SessionState::Reconnecting
            };
            *session.last_used.lock() = Instant::now();
        }
        if !healthy {
            warn!(
                upstream = %self.upstream_id,
                session = %session.id,
                "session released unhealthy, will reconnect"
            );
        }
        self.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn counts(&self) -> PoolCounts {
        let sessions = self.sessions.lock();
        let mut counts = PoolCounts::default();
        for session in sessions.iter() {
            match session.state() {
                SessionState::Initializing => counts.initializing += 1,
                SessionState::Healthy => counts.healthy += 1,
                SessionState::Busy => counts.busy += 1,
                SessionState::Reconnecting => counts.reconnecting += 1,
                SessionState::Closed => counts.closed += 1,
            }
        }
        counts
    }

    /// Load-based scale-up signal.
    pub fn should_scale_up(&self, avg_latency_ms: u64) -> bool {
        let counts = self.counts();
        let active = (counts.healthy + counts.busy).max(1);
        self.pending() > self.config.scale_pending_factor * active
            && avg_latency_ms > self.config.scale_latency_threshold_ms
            && counts.live() < self.config.max_sessions
    }

    /// Keep at least `min` sessions warm, and grow toward `target` while
    /// callers are waiting. The full pressure condition
    /// ([`Self::should_scale_up`]) is what goes beyond the target.
    pub fn ensure_baseline(&self) -> Result<usize, BridgeError> {
        let mut grown = 0;
        loop {
            let live = self.counts().live();
            let wanted = if self.pending() > 0 {
                self.config.target_sessions
            } else {
                self.config.min_sessions
            };
            if live >= wanted.min(self.config.max_sessions) {
                break;
            }
            if !self.grow_one()? {
                break;
            }
            grown += 1;
        }
        Ok(grown)
    }

    /// Add one session toward the cap (called by the scaler subsystem).
    pub fn grow_one(&self) -> Result<bool, BridgeError> {
        let mut sessions = self.sessions.lock();
        let live = sessions
            .iter()
            .filter(|s| s.state() != SessionState::Closed)
            .count();
        if live >= self.config.max_sessions {
            return Ok(false);
        }
        let session = Arc::new(UpstreamSession::new(self.config.upstream_timeout)?);
        sessions.push(session);
        drop(sessions);
        self.notify.notify_one();
        Ok(true)
    }

    /// Close idle sessions beyond the minimum; drop closed ones entirely.
    pub fn scale_down_idle(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let mut live = sessions
            .iter()
            .filter(|s| s.state() != SessionState::Closed)
            .count();
        let mut closed = 0;

        for session in sessions.iter() {
            if live <= self.config.min_sessions {
                break;
            }
            let mut state = session.state.lock();
            if *state == SessionState::Healthy && session.idle_for() > self.config.idle_timeout {
                *state = SessionState::Closed;
                live -= 1;
                closed += 1;
            }
        }

        sessions.retain(|s| s.state() != SessionState::Closed);
        if closed > 0 {
            info!(upstream = %self.upstream_id, closed, "scaled down idle sessions");
        }
        closed
    }

    /// Out-of-band health verification. Reconnecting sessions get a fresh
    /// client and rejoin on success; healthy sessions that stop answering
    /// transition to reconnecting. Busy sessions are left alone.
    pub async fn health_check(&self, base_url: &str) {
        let candidates: Vec<Arc<UpstreamSession>> = {
            let sessions = self.sessions.lock();
            sessions
                .iter()
                .filter(|s| {
                    matches!(
                        s.state(),
                        SessionState::Healthy | SessionState::Reconnecting
                    )
                })
                .cloned()
                .collect()
        };

        for session in candidates {
            let was_reconnecting = session.state() == SessionState::Reconnecting;
            if was_reconnecting {
                // Reconnect = rebuild the client and its connection pool
                match build_client(self.config.upstream_timeout) {
                    Ok(client) => *session.client.lock() = client,
                    Err(e) => {
                        warn!(session = %session.id, error = ?e, "failed to rebuild client");
                        continue;
                    }
                }
            }

            // Any HTTP response proves the transport; auth is per-call
            let reachable = session
                .client()
                .get(format!("{}/api/", base_url.trim_end_matches('/')))
                .send()
                .await
                .is_ok();

            let mut state = session.state.lock();
            match (*state, reachable) {
                (SessionState::Healthy, false) => {
                    warn!(
                        upstream = %self.upstream_id,
                        session = %session.id,
                        "health check failed"
                    );
                    *state = SessionState::Reconnecting;
                }
                (SessionState::Reconnecting, true) => {
                    info!(
                        upstream = %self.upstream_id,
                        session = %session.id,
                        "session reconnected"
                    );
                    *state = SessionState::Healthy;
                    drop(state);
                    self.notify.notify_one();
                }
                _ => {}
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, ToSchema)]
pub struct PoolCounts {
    pub initializing: usize,
    pub healthy: usize,
    pub busy: usize,
    pub reconnecting: usize,
    pub closed: usize,
}

impl PoolCounts {
    pub fn live(&self) -> usize {
        self.initializing + self.healthy + self.busy + self.reconnecting
    }
}

/// Pools keyed by upstream identity (hub config id).
#[derive(Clone)]
pub struct PoolRegistry {
    pools: Arc<DashMap<String, Arc<UpstreamPool>>>,
    config: PoolConfig,
}

impl PoolRegistry {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            pools: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn for_upstream(&self, upstream_id: &str) -> Arc<UpstreamPool> {
        self.pools
            .entry(upstream_id.to_string())
            .or_insert_with(|| {
                Arc::new(UpstreamPool::new(
                    upstream_id.to_string(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    pub fn pools(&self) -> Vec<Arc<UpstreamPool>> {
        self.pools.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn total_counts(&self) -> PoolCounts {
        let mut total = PoolCounts::default();
        for entry in self.pools.iter() {
            let counts = entry.value().counts();
            total.initializing += counts.initializing;
            total.healthy += counts.healthy;
            total.busy += counts.busy;
            total.reconnecting += counts.reconnecting;
            total.closed += counts.closed;
        }
        total
    }
}
