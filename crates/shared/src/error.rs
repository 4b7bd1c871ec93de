use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;
use utoipa::{IntoResponses, PartialSchema, ToSchema};

pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug, Serialize)]
pub enum BridgeError {
    #[error("malformed request")]
    Malformed {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("invalid argument")]
    InvalidArgument { msg: String },
    #[error("unsupported protocol version")]
    UnsupportedProtocolVersion { requested: String },
    #[error("authentication required")]
    Unauthorized {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("operation not permitted")]
    Forbidden { msg: String },
    #[error("account is locked")]
    AccountLocked { retry_after_ms: u64 },
    #[error("token has expired")]
    TokenExpired,
    #[error("token has been revoked")]
    TokenRevoked,
    #[error("could not find resource")]
    NotFound { msg: String, lookup_id: String },
    #[error("conflicting state")]
    Conflict { msg: String },
    #[error("rate limited")]
    RateLimited { retry_after_ms: u64 },
    #[error("request queue is full")]
    QueueFull,
    #[error("deadline exceeded")]
    Timeout { msg: String },
    #[error("request was cancelled")]
    Cancelled,
    #[error("upstream is unavailable")]
    UpstreamUnavailable {
        msg: String,
        retry_after_ms: u64,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("upstream returned an error")]
    UpstreamError {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("cryptographic operation failed")]
    Crypto {
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("ciphertext integrity check failed")]
    Integrity,
    #[error("repository error")]
    Repository {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("internal error")]
    Internal(
        #[serde(skip)]
        #[from]
        anyhow::Error,
    ),
}

impl BridgeError {
    pub fn internal(msg: impl Into<String>) -> Self {
        BridgeError::Internal(anyhow::anyhow!(msg.into()))
    }

    /// Stable machine-readable code, used as `request_record.error_code`
    /// and as the `name` field of HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Malformed { .. } => "Malformed",
            BridgeError::InvalidArgument { .. } => "InvalidArgument",
            BridgeError::UnsupportedProtocolVersion { .. } => "UnsupportedProtocolVersion",
            BridgeError::Unauthorized { .. } => "Unauthorized",
            BridgeError::Forbidden { .. } => "Forbidden",
            BridgeError::AccountLocked { .. } => "AccountLocked",
            BridgeError::TokenExpired => "TokenExpired",
            BridgeError::TokenRevoked => "TokenRevoked",
            BridgeError::NotFound { .. } => "NotFound",
            BridgeError::Conflict { .. } => "Conflict",
            BridgeError::RateLimited { .. } => "RateLimited",
            BridgeError::QueueFull => "QueueFull",
            BridgeError::Timeout { .. } => "Timeout",
            BridgeError::Cancelled => "Cancelled",
            BridgeError::UpstreamUnavailable { .. } => "UpstreamUnavailable",
            BridgeError::UpstreamError { .. } => "UpstreamError",
            BridgeError::Crypto { .. } => "CryptoError",
            BridgeError::Integrity => "IntegrityError",
            BridgeError::Repository { .. } => "Repository",
            BridgeError::Internal(_) => "InternalError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::Malformed { .. }
            | BridgeError::InvalidArgument { .. }
            | BridgeError::UnsupportedProtocolVersion { .. } => StatusCode::BAD_REQUEST,
            BridgeError::Unauthorized { .. }
            | BridgeError::TokenExpired
            | BridgeError::TokenRevoked => StatusCode::UNAUTHORIZED,
            BridgeError::Forbidden { .. } => StatusCode::FORBIDDEN,
            BridgeError::AccountLocked { .. } => StatusCode::LOCKED,
            BridgeError::NotFound { .. } => StatusCode::NOT_FOUND,
            BridgeError::Conflict { .. } => StatusCode::CONFLICT,
            BridgeError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            BridgeError::QueueFull | BridgeError::UpstreamUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BridgeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            BridgeError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            BridgeError::Crypto { .. }
            | BridgeError::Integrity
            | BridgeError::Repository { .. }
            | BridgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to a client. Crypto and integrity failures
    /// never leak detail; internal failures collapse to a generic message.
    pub fn public_message(&self) -> String {
        match self {
            BridgeError::Crypto { .. } | BridgeError::Integrity => {
                "credential could not be processed".to_string()
            }
            BridgeError::Repository { .. } | BridgeError::Internal(_) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Machine-readable data object attached to the HTTP error body.
    pub fn data(&self) -> Option<serde_json::Value> {
        match self {
            BridgeError::AccountLocked { retry_after_ms }
            | BridgeError::RateLimited { retry_after_ms }
            | BridgeError::UpstreamUnavailable { retry_after_ms, .. } => {
                Some(serde_json::json!({ "retry_after_ms": retry_after_ms }))
            }
            BridgeError::UnsupportedProtocolVersion { requested } => {
                Some(serde_json::json!({ "requested": requested }))
            }
            _ => None,
        }
    }
}

impl From<libsql::Error> for BridgeError {
    fn from(e: libsql::Error) -> Self {
        BridgeError::Repository {
            msg: "database error".to_string(),
            source: Some(anyhow::Error::from(e)),
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Internal(anyhow::Error::from(e))
    }
}

impl From<url::ParseError> for BridgeError {
    fn from(e: url::ParseError) -> Self {
        BridgeError::InvalidArgument {
            msg: format!("invalid url: {e}"),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Internal(anyhow::Error::from(e))
    }
}

impl From<axum::Error> for BridgeError {
    fn from(e: axum::Error) -> Self {
        BridgeError::Internal(anyhow::Error::from(e))
    }
}

impl From<std::net::AddrParseError> for BridgeError {
    fn from(e: std::net::AddrParseError) -> Self {
        BridgeError::Internal(anyhow::Error::from(e))
    }
}

impl<T: Send + Sync + 'static> From<tokio::sync::mpsc::error::SendError<T>> for BridgeError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BridgeError::Internal(anyhow::anyhow!("channel closed: {e}"))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for BridgeError {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Self {
        BridgeError::Internal(anyhow::anyhow!("channel closed: {e}"))
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToSchema for BridgeError {
    fn name() -> std::borrow::Cow<'static, str> {
        std::borrow::Cow::Borrowed("Error")
    }

    fn schemas(
        _schemas: &mut Vec<(
            String,
            utoipa::openapi::RefOr<utoipa::openapi::schema::Schema>,
        )>,
    ) {
        // nothing by default
    }
}

impl PartialSchema for BridgeError {
    fn schema() -> utoipa::openapi::RefOr<utoipa::openapi::schema::Schema> {
        utoipa::openapi::ObjectBuilder::new()
            .property(
                "name",
                utoipa::openapi::ObjectBuilder::new()
                    .schema_type(utoipa::openapi::schema::Type::String),
            )
            .required("name")
            .property(
                "message",
                utoipa::openapi::ObjectBuilder::new()
                    .schema_type(utoipa::openapi::schema::Type::String),
            )
            .required("message")
            .into()
    }
}

impl IntoResponses for BridgeError {
    fn responses() -> std::collections::BTreeMap<
        String,
        utoipa::openapi::RefOr<utoipa::openapi::response::Response>,
    > {
        let mut responses = std::collections::BTreeMap::new();

        let error_content = utoipa::openapi::ContentBuilder::new()
            .schema(Some(BridgeError::schema()))
            .build();

        for (status, description) in [
            ("400", "Malformed request"),
            ("401", "Authentication error"),
            ("403", "Authorization error"),
            ("404", "Resource not found"),
            ("409", "Conflicting state"),
            ("423", "Account locked"),
            ("429", "Rate limited"),
            ("500", "Server error"),
            ("503", "Service unavailable"),
        ] {
            responses.insert(
                status.to_string(),
                utoipa::openapi::ResponseBuilder::new()
                    .description(description)
                    .content("application/json", error_content.clone())
                    .into(),
            );
        }

        responses
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(code = self.code(), error = ?self, "request failed");
        }

        let body = Json(ErrorResponse {
            name: self.code().to_string(),
            message: self.public_message(),
            data: self.data(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_errors_do_not_leak_detail() {
        let err = BridgeError::Crypto {
            source: Some(anyhow::anyhow!("aead tag mismatch for key k1")),
        };
        assert!(!err.public_message().contains("k1"));
        assert_eq!(err.code(), "CryptoError");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn retry_hints_are_machine_readable() {
        let err = BridgeError::UpstreamUnavailable {
            msg: "breaker open".to_string(),
            retry_after_ms: 30_000,
            source: None,
        };
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.data().unwrap()["retry_after_ms"], 30_000);
    }

    #[test]
    fn status_mapping_matches_contract() {
        assert_eq!(BridgeError::QueueFull.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            BridgeError::Timeout { msg: "queue wait".into() }.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            BridgeError::AccountLocked { retry_after_ms: 1000 }.status(),
            StatusCode::LOCKED
        );
        assert_eq!(BridgeError::TokenRevoked.status(), StatusCode::UNAUTHORIZED);
    }
}
