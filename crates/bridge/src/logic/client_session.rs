use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use shared::error::BridgeError;

/// A client-scoped MCP context: allocated by `/mcp/initialize`, required
/// (via `X-Session-ID`) on every `/mcp/tools/*` call, bound to one user.
pub struct ClientSession {
    pub id: String,
    pub user_id: i64,
    pub created_at: Instant,
    last_seen: Mutex<Instant>,
}

impl ClientSession {
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }
}

#[derive(Clone)]
pub struct ClientSessionRegistry {
    sessions: Arc<DashMap<String, Arc<ClientSession>>>,
    ttl: Duration,
}

impl ClientSessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Allocate a session, or hand back the existing one when the client
    /// re-initializes with its previous id.
    pub fn initialize(&self, user_id: i64, reuse: Option<&str>) -> Arc<ClientSession> {
        if let Some(existing_id) = reuse {
            if let Some(existing) = self.sessions.get(existing_id) {
                if existing.user_id == user_id {
                    existing.touch();
                    return existing.clone();
                }
            }
        }

        let session = Arc::new(ClientSession {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            created_at: Instant::now(),
            last_seen: Mutex::new(Instant::now()),
        });
        self.sessions.insert(session.id.clone(), session.clone());
        session
    }

    /// Look up and touch a session. A session belonging to another user is
    /// indistinguishable from a missing one.
    pub fn validate(
        &self,
        session_id: &str,
        user_id: i64,
    ) -> Result<Arc<ClientSession>, BridgeError> {
        let unknown = || BridgeError::Malformed {
            msg: "unknown or expired session; call /mcp/initialize first".to_string(),
            source: None,
        };

        let session = self.sessions.get(session_id).ok_or_else(unknown)?;
        if session.user_id != user_id {
            return Err(unknown());
        }
        if session.idle_for() > self.ttl {
            drop(session);
            self.sessions.remove(session_id);
            return Err(unknown());
        }
        session.touch();
        Ok(session.clone())
    }

    /// Drop sessions idle past the TTL (retention sweeper).
    pub fn sweep(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.idle_for() <= self.ttl);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
