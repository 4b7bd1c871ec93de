use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use shared::error::BridgeError;
use utoipa::ToSchema;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC error codes. Standard codes for protocol faults, the
/// implementation-defined range for bridge faults.
pub const CODE_INVALID_REQUEST: i64 = -32600;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INVALID_PARAMS: i64 = -32602;
pub const CODE_BRIDGE_ERROR: i64 = -32000;

/// Body of `POST /mcp/tools/call`. The JSON-RPC fields are tolerated but
/// optional; the route already addresses the method.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ToolCallBody {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub name: String,
    #[serde(default)]
    pub arguments: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct InitializeBody {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub protocol_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Non-protocol telemetry attached to every dispatcher response. Clients
/// that ignore unknown fields stay compatible.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BridgeInfo {
    pub queue_wait_ms: u64,
    pub execution_time_ms: u64,
    pub cached: bool,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Result(serde_json::Value),
    Error(JsonRpcError),
}

/// Strict JSON-RPC 2.0 envelope: serialization emits exactly one of
/// `result` / `error`, by construction.
#[derive(Debug, Clone)]
pub struct JsonRpcEnvelope {
    pub id: serde_json::Value,
    pub payload: Payload,
    pub bridge_info: Option<BridgeInfo>,
}

impl JsonRpcEnvelope {
    pub fn result(id: Option<serde_json::Value>, value: serde_json::Value) -> Self {
        Self {
            id: id.unwrap_or(serde_json::Value::Null),
            payload: Payload::Result(value),
            bridge_info: None,
        }
    }

    pub fn error(id: Option<serde_json::Value>, error: JsonRpcError) -> Self {
        Self {
            id: id.unwrap_or(serde_json::Value::Null),
            payload: Payload::Error(error),
            bridge_info: None,
        }
    }

    pub fn with_bridge_info(mut self, bridge_info: BridgeInfo) -> Self {
        self.bridge_info = Some(bridge_info);
        self
    }
}

impl Serialize for JsonRpcEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = 3 + usize::from(self.bridge_info.is_some());
        let mut state = serializer.serialize_struct("JsonRpcEnvelope", fields)?;
        state.serialize_field("jsonrpc", JSONRPC_VERSION)?;
        state.serialize_field("id", &self.id)?;
        match &self.payload {
            Payload::Result(value) => state.serialize_field("result", value)?,
            Payload::Error(error) => state.serialize_field("error", error)?,
        }
        if let Some(bridge_info) = &self.bridge_info {
            state.serialize_field("bridge_info", bridge_info)?;
        }
        state.end()
    }
}

/// Protocol-level faults ride inside a 200 as JSON-RPC errors; everything
/// else keeps its HTTP status. This decides which side of the line a
/// `BridgeError` falls on.
pub fn protocol_error_for(err: &BridgeError) -> Option<JsonRpcError> {
    let code = match err {
        BridgeError::NotFound { .. } => CODE_METHOD_NOT_FOUND,
        BridgeError::InvalidArgument { .. } => CODE_INVALID_PARAMS,
        BridgeError::Malformed { .. } => CODE_INVALID_REQUEST,
        BridgeError::UnsupportedProtocolVersion { .. } => CODE_INVALID_REQUEST,
        BridgeError::UpstreamError { .. } => CODE_BRIDGE_ERROR,
        _ => return None,
    };

    Some(JsonRpcError {
        code,
        message: err.public_message(),
        data: Some(serde_json::json!({ "kind": err.code() })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_envelope_has_no_error_field() {
        let envelope = JsonRpcEnvelope::result(
            Some(serde_json::json!(7)),
            serde_json::json!({"entities": []}),
        );
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 7);
        assert!(json.get("result").is_some());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn error_envelope_has_no_result_field() {
        let envelope = JsonRpcEnvelope::error(
            None,
            JsonRpcError {
                code: CODE_METHOD_NOT_FOUND,
                message: "unknown tool".to_string(),
                data: None,
            },
        );
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["id"], serde_json::Value::Null);
        assert!(json.get("result").is_none());
        assert_eq!(json["error"]["code"], -32601);
    }

    #[test]
    fn bridge_info_rides_alongside() {
        let envelope = JsonRpcEnvelope::result(None, serde_json::json!(1)).with_bridge_info(
            BridgeInfo {
                queue_wait_ms: 12,
                execution_time_ms: 340,
                cached: false,
                session_id: "sess".to_string(),
                request_id: Some("req-1".to_string()),
            },
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["bridge_info"]["queue_wait_ms"], 12);
        assert_eq!(json["bridge_info"]["cached"], false);
    }

    #[test]
    fn auth_failures_stay_http_level() {
        assert!(protocol_error_for(&BridgeError::TokenExpired).is_none());
        assert!(protocol_error_for(&BridgeError::QueueFull).is_none());
        assert!(
            protocol_error_for(&BridgeError::InvalidArgument { msg: "bad".into() }).is_some()
        );
    }
}
