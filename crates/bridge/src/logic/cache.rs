use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

/// Deterministic cache key for `(user, tool, normalized arguments)`.
/// Object keys are sorted recursively; absent and null argument sets
/// collapse to the same fingerprint.
pub fn fingerprint(user_id: i64, tool_name: &str, arguments: &serde_json::Value) -> String {
    let normalized = canonicalize(arguments);

    let mut hasher = Sha256::new();
    hasher.update(user_id.to_le_bytes());
    hasher.update([0]);
    hasher.update(tool_name.as_bytes());
    hasher.update([0]);
    hasher.update(normalized.to_string().as_bytes());

    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Null => serde_json::json!({}),
        serde_json::Value::Object(map) => {
            // BTreeMap iteration gives the sorted key order
            let sorted: std::collections::BTreeMap<_, _> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize_inner(v)))
                .collect();
            serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
        }
        other => other.clone(),
    }
}

fn canonicalize_inner(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<_, _> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize_inner(v)))
                .collect();
            serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize_inner).collect())
        }
        other => other.clone(),
    }
}

struct CacheEntry {
    value: serde_json::Value,
    tool_name: String,
    expires_at: Instant,
    last_hit_tick: u64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
}

/// Bounded result cache: per-entry TTL, LRU eviction amortized on insert.
/// Only read-only tool results ever enter it.
pub struct ResultCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    default_ttl: Duration,
}

impl ResultCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
            default_ttl,
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<serde_json::Value> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        let entry = inner.entries.get_mut(fingerprint)?;
        if entry.expires_at <= Instant::now() {
            inner.entries.remove(fingerprint);
            return None;
        }
        entry.last_hit_tick = tick;
        Some(entry.value.clone())
    }

    pub fn insert(
        &self,
        fingerprint: String,
        tool_name: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        inner.entries.insert(
            fingerprint,
            CacheEntry {
                value,
                tool_name: tool_name.to_string(),
                expires_at: Instant::now() + ttl,
                last_hit_tick: tick,
            },
        );

        // Amortized eviction: expired first, then least-recently-hit
        if inner.entries.len() > self.capacity {
            let now = Instant::now();
            inner.entries.retain(|_, entry| entry.expires_at > now);

            while inner.entries.len() > self.capacity {
                let oldest = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_hit_tick)
                    .map(|(key, _)| key.clone());
                match oldest {
                    Some(key) => inner.entries.remove(&key),
                    None => break,
                };
            }
        }
    }

    /// Drop every entry for the named tools, any user, any arguments.
    /// The conservative invalidation policy for mutating calls.
    pub fn invalidate_tools(&self, tool_names: &[&str]) -> usize {
        if tool_names.is_empty() {
            return 0;
        }
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| !tool_names.contains(&entry.tool_name.as_str()));
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome shared between a single-flight leader and its followers.
pub type SharedOutcome = Result<serde_json::Value, String>;

enum FlightState {
    Pending,
    Done(SharedOutcome),
}

/// Coalesces concurrent identical read-only calls: one leader issues the
/// upstream request, followers wait for its outcome.
#[derive(Default)]
pub struct SingleFlight {
    flights: Mutex<HashMap<String, watch::Receiver<Arc<FlightStateCell>>>>,
}

pub struct FlightStateCell {
    state: Mutex<FlightState>,
}

pub enum FlightRole {
    /// This caller issues the upstream request and must call
    /// [`SingleFlight::complete`].
    Leader(FlightToken),
    /// This caller waits; the receiver resolves once the leader finishes.
    Follower(watch::Receiver<Arc<FlightStateCell>>),
}

pub struct FlightToken {
    key: String,
    sender: watch::Sender<Arc<FlightStateCell>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, key: &str) -> FlightRole {
        let mut flights = self.flights.lock();
        if let Some(receiver) = flights.get(key) {
            // A dead sender means the previous leader vanished without
            // completing (cancelled mid-flight); take over as leader.
            if receiver.has_changed().is_ok() {
                return FlightRole::Follower(receiver.clone());
            }
        }

        let cell = Arc::new(FlightStateCell {
            state: Mutex::new(FlightState::Pending),
        });
        let (sender, receiver) = watch::channel(cell);
        flights.insert(key.to_string(), receiver);
        FlightRole::Leader(FlightToken {
            key: key.to_string(),
            sender,
        })
    }

    /// Publish the leader's outcome and retire the flight.
    pub fn complete(&self, token: FlightToken, outcome: SharedOutcome) {
        self.flights.lock().remove(&token.key);
        let cell = Arc::new(FlightStateCell {
            state: Mutex::new(FlightState::Done(outcome)),
        });
        let _ = token.sender.send(cell);
    }

    /// Wait for the leader's outcome. `Err` carries the leader's error code.
    pub async fn await_follower(
        mut receiver: watch::Receiver<Arc<FlightStateCell>>,
    ) -> SharedOutcome {
        loop {
            {
                let cell = receiver.borrow();
                if let FlightState::Done(outcome) = &*cell.state.lock() {
                    return outcome.clone();
                }
            }
            if receiver.changed().await.is_err() {
                // Leader dropped without completing
                return Err("Cancelled".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_key_order_and_null_args() {
        let a = fingerprint(1, "get_entities", &serde_json::json!({"a": 1, "b": 2}));
        let b = fingerprint(1, "get_entities", &serde_json::json!({"b": 2, "a": 1}));
        assert_eq!(a, b);

        let null = fingerprint(1, "get_entities", &serde_json::Value::Null);
        let empty = fingerprint(1, "get_entities", &serde_json::json!({}));
        assert_eq!(null, empty);
    }

    #[test]
    fn fingerprint_separates_users_and_tools() {
        let args = serde_json::json!({"domain": "light"});
        assert_ne!(
            fingerprint(1, "get_entities", &args),
            fingerprint(2, "get_entities", &args)
        );
        assert_ne!(
            fingerprint(1, "get_entities", &args),
            fingerprint(1, "get_history", &args)
        );
    }

    #[test]
    fn entries_expire() {
        let cache = ResultCache::new(16, Duration::from_millis(0));
        cache.insert("k".into(), "get_entities", serde_json::json!(1), None);
        assert!(cache.get("k").is_none());

        cache.insert(
            "k".into(),
            "get_entities",
            serde_json::json!(1),
            Some(Duration::from_secs(60)),
        );
        assert_eq!(cache.get("k"), Some(serde_json::json!(1)));
    }

    #[test]
    fn lru_eviction_keeps_recently_hit_entries() {
        let cache = ResultCache::new(2, Duration::from_secs(60));
        cache.insert("a".into(), "t", serde_json::json!("a"), None);
        cache.insert("b".into(), "t", serde_json::json!("b"), None);

        // Touch "a" so "b" is the LRU victim
        cache.get("a");
        cache.insert("c".into(), "t", serde_json::json!("c"), None);

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn invalidation_is_by_tool_name() {
        let cache = ResultCache::new(16, Duration::from_secs(60));
        cache.insert("e1".into(), "get_entities", serde_json::json!(1), None);
        cache.insert("e2".into(), "get_entities", serde_json::json!(2), None);
        cache.insert("s1".into(), "get_services", serde_json::json!(3), None);

        let dropped = cache.invalidate_tools(&["get_entities", "get_history"]);
        assert_eq!(dropped, 2);
        assert!(cache.get("e1").is_none());
        assert!(cache.get("s1").is_some());
    }

    #[tokio::test]
    async fn followers_receive_the_leader_outcome() {
        let flight = Arc::new(SingleFlight::new());

        let FlightRole::Leader(token) = flight.join("fp") else {
            panic!("first join must lead");
        };
        let FlightRole::Follower(receiver) = flight.join("fp") else {
            panic!("second join must follow");
        };

        let waiter = tokio::spawn(SingleFlight::await_follower(receiver));
        flight.complete(token, Ok(serde_json::json!({"cached": "shared"})));

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome["cached"], "shared");

        // A new call after completion leads again
        assert!(matches!(flight.join("fp"), FlightRole::Leader(_)));
    }

    #[tokio::test]
    async fn leader_errors_propagate_to_followers() {
        let flight = SingleFlight::new();
        let FlightRole::Leader(token) = flight.join("fp") else {
            panic!("first join must lead");
        };
        let FlightRole::Follower(receiver) = flight.join("fp") else {
            panic!("second join must follow");
        };

        flight.complete(token, Err("UpstreamUnavailable".to_string()));
        let outcome = SingleFlight::await_follower(receiver).await;
        assert_eq!(outcome.unwrap_err(), "UpstreamUnavailable");
    }
}
