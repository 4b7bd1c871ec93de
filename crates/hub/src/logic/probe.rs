use std::time::Instant;

use encryption::logic::CryptoService;
use serde::{Deserialize, Serialize};
use shared::error::BridgeError;
use shared::primitives::WrappedChronoDateTime;
use telemetry::{LogCategory, LogStore};
use telemetry::repository::TelemetryRepositoryLike;
use utoipa::ToSchema;

use crate::logic::config::decrypt_token;
use crate::repository::{HubConfig, HubConfigRepositoryLike, ProbeRecord};

/// Wire shape of a probe result (bit-stable for clients).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProbeOutcome {
    pub status: String,
    pub latency_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HubConfigResponse {
    version: Option<String>,
}

/// Lightweight authenticated probe against the upstream: `/api/config` for
/// liveness and version, `/api/states` for the entity count. A hub that
/// answers `/api/` but not `/api/config` still counts as reachable.
pub async fn probe_hub(client: &reqwest::Client, base_url: &str, token: &str) -> ProbeOutcome {
    let started = Instant::now();
    let base_url = base_url.trim_end_matches('/');

    let config_response = client
        .get(format!("{base_url}/api/config"))
        .bearer_auth(token)
        .send()
        .await;

    let (ok, version, error) = match config_response {
        Ok(response) if response.status().is_success() => {
            let version = response
                .json::<HubConfigResponse>()
                .await
                .ok()
                .and_then(|body| body.version);
            (true, version, None)
        }
        Ok(response) if response.status() == reqwest::StatusCode::UNAUTHORIZED => {
            (false, None, Some("upstream rejected the token".to_string()))
        }
        Ok(_) => {
            // Older hubs: fall back to the bare API root
            match client
                .get(format!("{base_url}/api/"))
                .bearer_auth(token)
                .send()
                .await
            {
                Ok(fallback) if fallback.status().is_success() => (true, None, None),
                Ok(fallback) => (
                    false,
                    None,
                    Some(format!("upstream returned {}", fallback.status())),
                ),
                Err(e) => (false, None, Some(redact_probe_error(&e))),
            }
        }
        Err(e) => (false, None, Some(redact_probe_error(&e))),
    };

    // Entity count is best-effort: a reachable hub with an unparseable
    // state list still probes as ok
    let mut entities = None;
    if ok {
        if let Ok(response) = client
            .get(format!("{base_url}/api/states"))
            .bearer_auth(token)
            .send()
            .await
        {
            if response.status().is_success() {
                entities = response
                    .json::<Vec<serde_json::Value>>()
                    .await
                    .ok()
                    .map(|states| states.len() as i64);
            }
        }
    }

    ProbeOutcome {
        status: if ok { "ok" } else { "error" }.to_string(),
        latency_ms: started.elapsed().as_millis() as i64,
        version,
        entities,
        error,
    }
}

// reqwest errors embed the full URL including any userinfo; keep only the
// error class.
fn redact_probe_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "upstream timed out".to_string()
    } else if e.is_connect() {
        "could not connect to upstream".to_string()
    } else {
        "upstream request failed".to_string()
    }
}

/// Probe a config and persist the result. The decrypted token is scoped to
/// this call.
pub async fn probe_and_record<R, T>(
    repository: &R,
    logstore: &LogStore<T>,
    crypto: &CryptoService,
    client: &reqwest::Client,
    config: &HubConfig,
) -> Result<ProbeOutcome, BridgeError>
where
    R: HubConfigRepositoryLike,
    T: TelemetryRepositoryLike,
{
    let token = match decrypt_token(crypto, config) {
        Ok(token) => token,
        Err(e) => {
            // A credential that fails authenticated decryption is dead;
            // never probed with a guess, never silently replaced
            logstore
                .error(
                    LogCategory::Hub,
                    "hub credential could not be decrypted",
                    serde_json::json!({ "config_id": config.id, "kind": e.code() }),
                )
                .await;
            return Err(e);
        }
    };
    let outcome = probe_hub(client, &config.url, &token).await;
    drop(token);

    repository
        .record_probe(
            &config.id,
            &ProbeRecord {
                at: WrappedChronoDateTime::now(),
                status: outcome.status.clone(),
                latency_ms: Some(outcome.latency_ms),
                version: outcome.version.clone(),
                entities: outcome.entities,
            },
        )
        .await?;

    logstore
        .log(
            telemetry::LogLevel::Info,
            LogCategory::Hub,
            "probed hub config",
            serde_json::json!({
                "config_id": config.id,
                "status": outcome.status,
                "latency_ms": outcome.latency_ms,
            }),
        )
        .await;

    Ok(outcome)
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use axum::Json;
    use axum::routing::get;

    /// Minimal stand-in for the hub's REST surface.
    async fn spawn_fake_hub(expected_token: &'static str) -> String {
        let app = axum::Router::new()
            .route(
                "/api/config",
                get(move |headers: http::HeaderMap| async move {
                    let authorized = headers
                        .get(http::header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        == Some(&format!("Bearer {expected_token}"));
                    if authorized {
                        Json(serde_json::json!({ "version": "2026.7.1" })).into_response()
                    } else {
                        http::StatusCode::UNAUTHORIZED.into_response()
                    }
                }),
            )
            .route(
                "/api/states",
                get(|| async {
                    Json(serde_json::json!([
                        { "entity_id": "light.kitchen", "state": "on" },
                        { "entity_id": "light.porch", "state": "off" },
                    ]))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    use axum::response::IntoResponse;

    #[tokio::test]
    async fn probe_reports_version_and_entity_count() {
        shared::setup_test!();
        let base_url = spawn_fake_hub("good-token").await;
        let client = reqwest::Client::new();

        let outcome = probe_hub(&client, &base_url, "good-token").await;
        assert_eq!(outcome.status, "ok");
        assert_eq!(outcome.version.as_deref(), Some("2026.7.1"));
        assert_eq!(outcome.entities, Some(2));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn probe_flags_a_rejected_token() {
        shared::setup_test!();
        let base_url = spawn_fake_hub("good-token").await;
        let client = reqwest::Client::new();

        let outcome = probe_hub(&client, &base_url, "wrong-token").await;
        assert_eq!(outcome.status, "error");
        assert!(outcome.error.unwrap().contains("token"));
    }

    #[tokio::test]
    async fn probe_survives_an_unreachable_upstream() {
        shared::setup_test!();
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(500))
            .build()
            .unwrap();

        // RFC 5737 TEST-NET-1, guaranteed non-routable
        let outcome = probe_hub(&client, "http://192.0.2.1:8123", "token").await;
        assert_eq!(outcome.status, "error");
        assert!(outcome.error.is_some());
    }
}
