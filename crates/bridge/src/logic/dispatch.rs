use std::time::{Duration, Instant};

use hub::logic::config::{decrypt_token, resolve_active_config};
use hub::repository::HubConfig;
use identity::logic::Identity;
use identity::logic::permission::check_tool_access;
use rand::Rng;
use shared::error::BridgeError;
use shared::primitives::WrappedChronoDateTime;
use telemetry::repository::{
    NewErrorRecord, NewRequestRecord, RequestOutcome, RequestStatus, TelemetryRepositoryLike,
};
use telemetry::{LogCategory, LogLevel};
use tokio_util::sync::CancellationToken;

use crate::logic::breaker::{BreakerState, CallKind, CircuitBreaker};
use crate::logic::cache::{FlightRole, SingleFlight, fingerprint};
use crate::logic::pool::SessionLease;
use crate::logic::queue::Priority;
use crate::logic::registry::{ToolDescriptor, UpstreamRequest};
use crate::service::BridgeService;

/// One tool invocation, already authenticated and session-checked.
pub struct CallRequest {
    pub identity: Identity,
    pub client_session_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub priority: Priority,
    pub timeout: Duration,
    pub client_request_id: Option<String>,
}

#[derive(Debug)]
pub struct CallOutcome {
    pub value: serde_json::Value,
    pub cached: bool,
    pub queue_wait_ms: u64,
    pub execution_time_ms: u64,
}

/// Writes a `cancelled` completion if the request future is dropped
/// (client disconnect) before a real outcome was recorded.
struct CompletionGuard {
    telemetry: telemetry::repository::Repository,
    record_id: String,
    enqueued: Instant,
    armed: bool,
}

impl CompletionGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let telemetry = self.telemetry.clone();
        let record_id = self.record_id.clone();
        let waited_ms = self.enqueued.elapsed().as_millis() as i64;
        tokio::spawn(async move {
            let outcome = RequestOutcome {
                started_at: None,
                finished_at: WrappedChronoDateTime::now(),
                queue_wait_ms: Some(waited_ms),
                exec_ms: None,
                status: RequestStatus::Cancelled,
                error_code: Some("Cancelled".to_string()),
            };
            if let Err(e) = telemetry.finish_request(&record_id, &outcome).await {
                tracing::error!(error = ?e, "failed to record cancelled request");
            }
        });
    }
}

/// Full dispatch pipeline for `/mcp/tools/call`:
/// authorize → fingerprint → cache / single-flight → enqueue → lease →
/// breaker-guarded upstream call with retries → record, cache, return.
pub async fn dispatch_tool_call(
    service: &BridgeService,
    request: CallRequest,
) -> Result<CallOutcome, BridgeError> {
    let tool = service
        .registry
        .get(&request.tool_name)
        .ok_or_else(|| BridgeError::NotFound {
            msg: format!("unknown tool '{}'", request.tool_name),
            lookup_id: request.tool_name.clone(),
        })?;

    check_tool_access(
        &service.identity.repository,
        &service.logstore,
        &request.identity,
        tool.name,
        tool.kind.required_bit(),
    )
    .await?;

    // Argument validation happens before any queueing
    let upstream_request = tool.build_request(&request.arguments)?;

    let fp = fingerprint(request.identity.user_id, tool.name, &request.arguments);

    if tool.kind.is_cacheable() {
        if let Some(value) = service.cache.get(&fp) {
            service.metrics.record_cache_hit();
            record_served_without_upstream(service, &request, tool).await;
            return Ok(CallOutcome {
                value,
                cached: true,
                queue_wait_ms: 0,
                execution_time_ms: 0,
            });
        }
        service.metrics.record_cache_miss();
    }

    // Single-flight: one upstream call per live fingerprint for read tools
    let flight_token = if tool.kind.is_cacheable() {
        match service.flights.join(&fp) {
            FlightRole::Leader(token) => Some(token),
            FlightRole::Follower(receiver) => {
                return match SingleFlight::await_follower(receiver).await {
                    Ok(value) => {
                        service.metrics.record_cache_hit();
                        record_served_without_upstream(service, &request, tool).await;
                        Ok(CallOutcome {
                            value,
                            cached: true,
                            queue_wait_ms: 0,
                            execution_time_ms: 0,
                        })
                    }
                    Err(code) => Err(BridgeError::UpstreamError {
                        msg: format!("coalesced upstream call failed ({code})"),
                        source: None,
                    }),
                };
            }
        }
    } else {
        None
    };

    let result = dispatch_leader(service, &request, tool, upstream_request).await;

    if let Some(token) = flight_token {
        let shared = match &result {
            Ok(outcome) => Ok(outcome.value.clone()),
            Err(e) => Err(e.code().to_string()),
        };
        service.flights.complete(token, shared);
    }

    result
}

async fn dispatch_leader(
    service: &BridgeService,
    request: &CallRequest,
    tool: &ToolDescriptor,
    upstream_request: UpstreamRequest,
) -> Result<CallOutcome, BridgeError> {
    let hub_config = resolve_active_config(&service.hub_repository, request.identity.user_id).await?;
    service
        .upstream_urls
        .insert(hub_config.id.clone(), hub_config.url.clone());

    let cancel = CancellationToken::new();
    let started_waiting = Instant::now();
    let deadline = started_waiting + request.timeout;

    // Admission first: an overflowing queue leaves no trace by design
    let ticket = service.queue.enqueue(
        request.identity.user_id,
        hub_config.id.clone(),
        request.priority,
        cancel.clone(),
    )?;
    service.metrics.set_queue_depth(service.queue.depth() as i64);

    let record_id = uuid::Uuid::new_v4().to_string();
    service
        .telemetry
        .append_request(&NewRequestRecord {
            id: record_id.clone(),
            client_request_id: request.client_request_id.clone(),
            session_id: Some(request.client_session_id.clone()),
            user_id: Some(request.identity.user_id),
            tool_name: tool.name.to_string(),
            priority: request.priority.as_str().to_string(),
            enqueued_at: WrappedChronoDateTime::now(),
        })
        .await?;

    let mut guard = CompletionGuard {
        telemetry: service.telemetry.clone(),
        record_id: record_id.clone(),
        enqueued: started_waiting,
        armed: true,
    };

    // Phase 1: wait for a session lease, bounded by the deadline
    let lease = tokio::select! {
        granted = ticket.grant_rx => match granted {
            Ok(lease) => lease,
            Err(_) => {
                guard.disarm();
                finish(service, &record_id, tool, RequestStatus::Cancelled,
                    Some("Cancelled"), started_waiting.elapsed(), None).await;
                return Err(BridgeError::Cancelled);
            }
        },
        _ = tokio::time::sleep_until(deadline.into()) => {
            cancel.cancel();
            guard.disarm();
            finish(service, &record_id, tool, RequestStatus::Timeout,
                Some("Timeout"), started_waiting.elapsed(), None).await;
            return Err(BridgeError::Timeout {
                msg: "timed out waiting for an upstream session".to_string(),
            });
        }
    };

    let queue_wait = started_waiting.elapsed();
    service.metrics.set_queue_depth(service.queue.depth() as i64);
    service
        .metrics
        .observe_queue_wait_ms(queue_wait.as_millis() as u64);

    // Phase 2: breaker-guarded execution on the exclusive session
    let breaker = service.breakers.for_upstream(&hub_config.id);
    let execution_started = Instant::now();

    let execution = execute_with_retries(
        service,
        tool,
        &upstream_request,
        lease,
        &hub_config,
        breaker.as_ref(),
        deadline,
    )
    .await;

    let exec_time = execution_started.elapsed();
    guard.disarm();

    match execution {
        Ok(value) => {
            let value = tool.postprocess(value, &request.arguments);

            if tool.kind.is_cacheable() {
                service
                    .cache
                    .insert(fingerprint(request.identity.user_id, tool.name, &request.arguments),
                        tool.name, value.clone(), tool.cache_ttl);
            } else if !tool.invalidates.is_empty() {
                let dropped = service.cache.invalidate_tools(tool.invalidates);
                if dropped > 0 {
                    service
                        .logstore
                        .log(
                            LogLevel::Debug,
                            LogCategory::Cache,
                            "invalidated cached reads after mutation",
                            serde_json::json!({ "tool": tool.name, "dropped": dropped }),
                        )
                        .await;
                }
            }
            service.metrics.set_cache_entries(service.cache.len() as i64);
            service.queue.record_exec_ms(exec_time.as_millis() as u64);
            service
                .metrics
                .observe_upstream_latency_ms(exec_time.as_millis() as u64);

            finish(service, &record_id, tool, RequestStatus::Ok, None, queue_wait, Some(exec_time))
                .await;

            Ok(CallOutcome {
                value,
                cached: false,
                queue_wait_ms: queue_wait.as_millis() as u64,
                execution_time_ms: exec_time.as_millis() as u64,
            })
        }
        Err(e) => {
            let status = match &e {
                BridgeError::Timeout { .. } => RequestStatus::Timeout,
                BridgeError::Cancelled => RequestStatus::Cancelled,
                _ => RequestStatus::Err,
            };
            finish(service, &record_id, tool, status, Some(e.code()), queue_wait, Some(exec_time))
                .await;

            let error_record = NewErrorRecord {
                id: uuid::Uuid::new_v4().to_string(),
                request_id: Some(record_id),
                kind: e.code().to_string(),
                message: e.public_message(),
                stacktrace_digest: telemetry::logic::logstore::error_digest(&e),
            };
            if let Err(log_err) = service.telemetry.append_error(&error_record).await {
                tracing::error!(error = ?log_err, "failed to append error record");
            }

            Err(e)
        }
    }
}

async fn execute_with_retries(
    service: &BridgeService,
    tool: &ToolDescriptor,
    upstream_request: &UpstreamRequest,
    mut lease: SessionLease,
    hub_config: &HubConfig,
    breaker: &CircuitBreaker,
    deadline: Instant,
) -> Result<serde_json::Value, BridgeError> {
    let max_attempts = if tool.kind.is_retryable() {
        service.config.max_retry_attempts.max(1)
    } else {
        1
    };

    // Decrypted token lives exactly as long as this execution scope
    let token = match decrypt_token(&service.crypto, hub_config) {
        Ok(token) => token,
        Err(e) => {
            service
                .logstore
                .error(
                    LogCategory::Hub,
                    "hub credential could not be decrypted",
                    serde_json::json!({ "config_id": hub_config.id, "kind": e.code() }),
                )
                .await;
            return Err(e);
        }
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;

        // Every attempt respects the breaker state
        let call_kind = match breaker.try_acquire() {
            Ok(kind) => kind,
            Err(retry_after_ms) => {
                return Err(BridgeError::UpstreamUnavailable {
                    msg: "upstream circuit breaker is open".to_string(),
                    retry_after_ms,
                    source: None,
                });
            }
        };

        let now = Instant::now();
        if now >= deadline {
            // Our deadline, not an upstream fault; only the probe slot
            // must be handed back
            if call_kind == CallKind::Probe {
                breaker_report(service, breaker, &hub_config.id, call_kind, false).await;
            }
            lease.mark_failed();
            return Err(BridgeError::Timeout {
                msg: "deadline exceeded before the upstream call".to_string(),
            });
        }
        let remaining = deadline - now;

        let attempt_result = tokio::time::timeout(
            remaining,
            service
                .upstream
                .execute(lease.session().as_ref(), &hub_config.url, &token, upstream_request),
        )
        .await;

        let outcome = match attempt_result {
            Ok(inner) => inner,
            Err(_elapsed) => Err(BridgeError::Timeout {
                msg: "upstream call exceeded the request deadline".to_string(),
            }),
        };

        match outcome {
            Ok(value) => {
                breaker_report(service, breaker, &hub_config.id, call_kind, true).await;
                return Ok(value);
            }
            Err(e) => {
                let upstream_fault = matches!(
                    e,
                    BridgeError::UpstreamUnavailable { .. }
                        | BridgeError::UpstreamError { .. }
                        | BridgeError::Timeout { .. }
                );
                if upstream_fault || call_kind == CallKind::Probe {
                    breaker_report(service, breaker, &hub_config.id, call_kind, false).await;
                }

                if matches!(e, BridgeError::Timeout { .. }) {
                    // The upstream did not acknowledge in time: the session
                    // may have a response in flight, recycle it
                    lease.mark_failed();
                    return Err(e);
                }

                let retry_eligible = tool.kind.is_retryable()
                    && attempt < max_attempts
                    && upstream_fault
                    && Instant::now() < deadline;
                if !retry_eligible {
                    if upstream_fault {
                        lease.mark_failed();
                    }
                    return Err(e);
                }

                // Exponential backoff with jitter, capped by the deadline
                let base = Duration::from_millis(100 * (1 << (attempt - 1).min(6)));
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
                let backoff = (base + jitter).min(deadline.saturating_duration_since(Instant::now()));
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

async fn breaker_report(
    service: &BridgeService,
    breaker: &CircuitBreaker,
    upstream_id: &str,
    kind: CallKind,
    success: bool,
) {
    if let Some(new_state) = breaker.report(kind, success) {
        service
            .metrics
            .record_breaker_transition(upstream_id, new_state.as_str());
        let level = if new_state == BreakerState::Closed {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        service
            .logstore
            .log(
                level,
                LogCategory::Breaker,
                "circuit breaker transition",
                serde_json::json!({ "upstream": upstream_id, "state": new_state.as_str() }),
            )
            .await;
    }
}

/// Record a request served from the cache or a coalesced flight: it still
/// counts as accepted, with zero execution time.
async fn record_served_without_upstream(
    service: &BridgeService,
    request: &CallRequest,
    tool: &ToolDescriptor,
) {
    let record_id = uuid::Uuid::new_v4().to_string();
    let result = async {
        service
            .telemetry
            .append_request(&NewRequestRecord {
                id: record_id.clone(),
                client_request_id: request.client_request_id.clone(),
                session_id: Some(request.client_session_id.clone()),
                user_id: Some(request.identity.user_id),
                tool_name: tool.name.to_string(),
                priority: request.priority.as_str().to_string(),
                enqueued_at: WrappedChronoDateTime::now(),
            })
            .await?;
        service
            .telemetry
            .finish_request(
                &record_id,
                &RequestOutcome {
                    started_at: Some(WrappedChronoDateTime::now()),
                    finished_at: WrappedChronoDateTime::now(),
                    queue_wait_ms: Some(0),
                    exec_ms: Some(0),
                    status: RequestStatus::Ok,
                    error_code: None,
                },
            )
            .await
    }
    .await;

    if let Err(e) = result {
        tracing::error!(error = ?e, "failed to record cached request");
    }
    service.metrics.record_request(tool.name, "ok");
}

async fn finish(
    service: &BridgeService,
    record_id: &str,
    tool: &ToolDescriptor,
    status: RequestStatus,
    error_code: Option<&str>,
    queue_wait: Duration,
    exec_time: Option<Duration>,
) {
    let outcome = RequestOutcome {
        started_at: exec_time.map(|exec| {
            WrappedChronoDateTime::new(
                chrono::Utc::now() - chrono::Duration::milliseconds(exec.as_millis() as i64),
            )
        }),
        finished_at: WrappedChronoDateTime::now(),
        queue_wait_ms: Some(queue_wait.as_millis() as i64),
        exec_ms: exec_time.map(|exec| exec.as_millis() as i64),
        status,
        error_code: error_code.map(|code| code.to_string()),
    };
    if let Err(e) = service.telemetry.finish_request(record_id, &outcome).await {
        tracing::error!(error = ?e, "failed to finish request record");
    }
    service.metrics.record_request(tool.name, status.as_str());
}

/// Queue consumer subsystem: pops admitted calls in priority order and
/// pairs each with an exclusive session lease from its upstream's pool.
pub async fn run_queue_consumer(
    service: BridgeService,
    shutdown: CancellationToken,
) -> Result<(), BridgeError> {
    while let Some(handle) = service.queue.next(&shutdown).await {
        let pool = service.pools.for_upstream(&handle.upstream_id);
        let lease = tokio::select! {
            lease = pool.acquire(&handle.cancel) => match lease {
                Ok(lease) => lease,
                // The caller gave up while we waited; move on
                Err(_) => continue,
            },
            _ = shutdown.cancelled() => return Ok(()),
        };
        service
            .metrics
            .set_active_sessions(service.pools.total_counts().live() as i64);

        // If the caller is gone the lease drops straight back to the pool
        let _ = handle.grant(lease);
    }
    Ok(())
}
