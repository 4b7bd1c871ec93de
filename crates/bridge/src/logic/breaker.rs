use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker outright.
    pub failure_threshold: u32,
    /// Failure rate over the window that trips it (given enough samples).
    pub failure_rate_threshold: f64,
    /// Minimum samples before the rate is meaningful.
    pub min_samples: usize,
    /// Rolling window length.
    pub window: Duration,
    /// How long OPEN lasts before one probe is admitted.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            min_samples: 10,
            window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Whether a permitted call is an ordinary one or the half-open probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Normal,
    Probe,
}

struct BreakerInner {
    state: BreakerState,
    outcomes: VecDeque<(Instant, bool)>,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker for one upstream identity.
///
/// CLOSED records outcomes in a rolling window; OPEN fails fast with a
/// retry hint; after the recovery timeout exactly one probe is admitted,
/// deciding between CLOSED and another OPEN period.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                outcomes: VecDeque::new(),
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Admission decision for a call. `Err(retry_after_ms)` means fail fast.
    pub fn try_acquire(&self) -> Result<CallKind, u64> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            BreakerState::Closed => Ok(CallKind::Normal),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.duration_since(opened_at);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(CallKind::Probe)
                } else {
                    let remaining = self.config.recovery_timeout - elapsed;
                    Err(remaining.as_millis() as u64)
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    // Exactly one probe at a time
                    Err(self.config.recovery_timeout.as_millis() as u64)
                } else {
                    inner.probe_in_flight = true;
                    Ok(CallKind::Probe)
                }
            }
        }
    }

    /// Report the outcome of an admitted call. Returns the new state when a
    /// transition happened, for logging and metrics.
    pub fn report(&self, kind: CallKind, success: bool) -> Option<BreakerState> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if kind == CallKind::Probe {
            inner.probe_in_flight = false;
            return if success {
                inner.state = BreakerState::Closed;
                inner.outcomes.clear();
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                Some(BreakerState::Closed)
            } else {
                // Timer restarts from the failed probe
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                Some(BreakerState::Open)
            };
        }

        // Normal call while CLOSED
        inner.outcomes.push_back((now, success));
        let window = self.config.window;
        while let Some(&(at, _)) = inner.outcomes.front() {
            if now.duration_since(at) > window {
                inner.outcomes.pop_front();
            } else {
                break;
            }
        }

        if success {
            inner.consecutive_failures = 0;
            return None;
        }
        inner.consecutive_failures += 1;

        let failures = inner.outcomes.iter().filter(|(_, ok)| !ok).count();
        let samples = inner.outcomes.len();
        let rate_tripped = samples >= self.config.min_samples
            && failures as f64 / samples as f64 >= self.config.failure_rate_threshold;

        if inner.state == BreakerState::Closed
            && (inner.consecutive_failures >= self.config.failure_threshold || rate_tripped)
        {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            return Some(BreakerState::Open);
        }

        None
    }
}

/// One breaker per upstream identity (hub config id).
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn for_upstream(&self, upstream_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(upstream_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    pub fn states(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| BreakerSnapshot {
                upstream: entry.key().clone(),
                state: entry.value().state(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BreakerSnapshot {
    pub upstream: String,
    pub state: BreakerState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            min_samples: 10,
            window: Duration::from_secs(60),
            recovery_timeout: recovery,
        })
    }

    #[test]
    fn trips_after_consecutive_failures() {
        let breaker = breaker(Duration::from_secs(30));

        for i in 0..5 {
            assert!(breaker.try_acquire().is_ok(), "call {i} should pass");
            let transition = breaker.report(CallKind::Normal, false);
            if i < 4 {
                assert!(transition.is_none());
            } else {
                assert_eq!(transition, Some(BreakerState::Open));
            }
        }

        // Fails fast with a retry hint while OPEN
        let retry_after = breaker.try_acquire().unwrap_err();
        assert!(retry_after > 0 && retry_after <= 30_000);
    }

    #[test]
    fn success_resets_the_consecutive_count() {
        let breaker = breaker(Duration::from_secs(30));
        for _ in 0..4 {
            breaker.try_acquire().unwrap();
            breaker.report(CallKind::Normal, false);
        }
        breaker.try_acquire().unwrap();
        breaker.report(CallKind::Normal, true);

        // Four more failures still do not trip (count restarted)
        for _ in 0..4 {
            breaker.try_acquire().unwrap();
            assert!(breaker.report(CallKind::Normal, false).is_none());
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let breaker = breaker(Duration::from_millis(0));
        for _ in 0..5 {
            breaker.try_acquire().unwrap();
            breaker.report(CallKind::Normal, false);
        }

        // Recovery timeout of zero: next acquire is the probe
        assert_eq!(breaker.try_acquire().unwrap(), CallKind::Probe);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // A second caller is rejected while the probe is in flight
        assert!(breaker.try_acquire().is_err());

        // Probe success closes the breaker
        assert_eq!(breaker.report(CallKind::Probe, true), Some(BreakerState::Closed));
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn failed_probe_reopens_with_a_fresh_timer() {
        let breaker = breaker(Duration::from_secs(30));
        for _ in 0..5 {
            breaker.try_acquire().unwrap();
            breaker.report(CallKind::Normal, false);
        }

        // Force the probe by pretending recovery elapsed
        {
            let mut inner = breaker.inner.lock();
            inner.opened_at = Some(Instant::now() - Duration::from_secs(31));
        }
        assert_eq!(breaker.try_acquire().unwrap(), CallKind::Probe);
        assert_eq!(breaker.report(CallKind::Probe, false), Some(BreakerState::Open));

        // Fresh OPEN period: fail fast again
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn failure_rate_trips_with_enough_samples() {
        let breaker = breaker(Duration::from_secs(30));

        // Alternate ok/fail so the consecutive count never reaches 5
        let mut tripped = None;
        for i in 0..20 {
            breaker.try_acquire().unwrap();
            if let Some(state) = breaker.report(CallKind::Normal, i % 2 == 0) {
                tripped = Some(state);
                break;
            }
        }
        assert_eq!(tripped, Some(BreakerState::Open));
    }

    #[test]
    fn registry_isolates_upstreams() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        });

        let a = registry.for_upstream("hub-a");
        a.try_acquire().unwrap();
        a.report(CallKind::Normal, false);
        assert_eq!(a.state(), BreakerState::Open);

        let b = registry.for_upstream("hub-b");
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.try_acquire().is_ok());
    }
}
