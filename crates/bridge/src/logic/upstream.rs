use async_trait::async_trait;
use shared::error::BridgeError;

use crate::logic::pool::UpstreamSession;
use crate::logic::registry::UpstreamRequest;

/// Seam between the dispatcher and the hub's HTTP API. The production
/// implementation drives the leased session's client; tests substitute a
/// scripted one.
#[async_trait]
pub trait UpstreamClientLike: Send + Sync + 'static {
    async fn execute(
        &self,
        session: &UpstreamSession,
        base_url: &str,
        token: &str,
        request: &UpstreamRequest,
    ) -> Result<serde_json::Value, BridgeError>;
}

pub struct HttpUpstreamClient;

#[async_trait]
impl UpstreamClientLike for HttpUpstreamClient {
    async fn execute(
        &self,
        session: &UpstreamSession,
        base_url: &str,
        token: &str,
        request: &UpstreamRequest,
    ) -> Result<serde_json::Value, BridgeError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), request.path);
        let mut builder = session
            .client()
            .request(request.method.clone(), url)
            .bearer_auth(token);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                BridgeError::Timeout {
                    msg: "upstream call timed out".to_string(),
                }
            } else if e.is_connect() {
                BridgeError::UpstreamUnavailable {
                    msg: "could not connect to upstream".to_string(),
                    retry_after_ms: 1_000,
                    source: Some(anyhow::Error::from(e)),
                }
            } else {
                BridgeError::UpstreamError {
                    msg: "upstream request failed".to_string(),
                    source: Some(anyhow::Error::from(e)),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let msg = match status.as_u16() {
                401 | 403 => "upstream rejected the hub credentials".to_string(),
                code => format!("upstream returned {code}"),
            };
            return Err(BridgeError::UpstreamError { msg, source: None });
        }

        // Some hub routes answer with plain text; surface it as a string
        let bytes = response.bytes().await.map_err(|e| BridgeError::UpstreamError {
            msg: "failed to read upstream response".to_string(),
            source: Some(anyhow::Error::from(e)),
        })?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            Err(_) => Ok(serde_json::Value::String(
                String::from_utf8_lossy(&bytes).to_string(),
            )),
        }
    }
}
