//! Error types and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Body type of every response the wrapper produces or relays
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Failures of the gateway lifecycle.
///
/// `Clone` because a single startup attempt hands the same outcome to every
/// request waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// No configuration artifact on disk; onboarding has not run
    #[error("gateway is not configured")]
    NotConfigured,
    /// The process was spawned but its port never answered
    #[error("gateway did not become ready within {}ms", .timeout.as_millis())]
    NotReady { timeout: Duration },
    /// The OS refused to launch the gateway
    #[error("failed to spawn gateway: {0}")]
    Spawn(String),
    /// The startup task itself died (panic or runtime shutdown)
    #[error("gateway startup attempt aborted: {0}")]
    Attempt(String),
}

impl GatewayError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            GatewayError::NotConfigured => ProxyErrorCode::NotConfigured,
            GatewayError::NotReady { .. } => ProxyErrorCode::GatewayNotReady,
            GatewayError::Spawn(_) | GatewayError::Attempt(_) => ProxyErrorCode::GatewayStartFailed,
        }
    }
}

/// Error codes for responses produced by the wrapper itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Onboarding has not produced a configuration artifact
    NotConfigured,
    /// Gateway spawned but never answered
    GatewayNotReady,
    /// Gateway could not be launched
    GatewayStartFailed,
    /// Request timed out waiting for the gateway
    RequestTimeout,
    /// Failed to reach the gateway
    ConnectionFailed,
    /// Setup password missing or wrong
    Unauthorized,
    /// No setup password configured
    SetupDisabled,
    /// Malformed request to the setup API
    BadRequest,
    /// Unknown setup route
    NotFound,
    /// Upload exceeds the configured limit
    PayloadTooLarge,
    /// Backup archive failed validation
    InvalidArchive,
    /// A CLI call exceeded the setup command timeout
    CommandTimeout,
    /// Internal wrapper error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::GatewayNotReady => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::GatewayStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::SetupDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::InvalidArchive => StatusCode::BAD_REQUEST,
            ProxyErrorCode::CommandTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NotConfigured => "NOT_CONFIGURED",
            ProxyErrorCode::GatewayNotReady => "GATEWAY_NOT_READY",
            ProxyErrorCode::GatewayStartFailed => "GATEWAY_START_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::Unauthorized => "UNAUTHORIZED",
            ProxyErrorCode::SetupDisabled => "SETUP_DISABLED",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ProxyErrorCode::InvalidArchive => "INVALID_ARCHIVE",
            ProxyErrorCode::CommandTimeout => "COMMAND_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_codes() {
        assert_eq!(GatewayError::NotConfigured.code(), ProxyErrorCode::NotConfigured);
        assert_eq!(
            GatewayError::NotReady { timeout: Duration::from_secs(20) }.code(),
            ProxyErrorCode::GatewayNotReady
        );
        assert_eq!(
            GatewayError::Spawn("No such file or directory".into()).code(),
            ProxyErrorCode::GatewayStartFailed
        );
    }

    #[test]
    fn test_gateway_error_messages() {
        let err = GatewayError::NotReady { timeout: Duration::from_millis(1500) };
        assert_eq!(err.to_string(), "gateway did not become ready within 1500ms");
        assert_eq!(
            GatewayError::Spawn("denied".into()).to_string(),
            "failed to spawn gateway: denied"
        );
    }

    #[test]
    fn test_lifecycle_failures_are_service_unavailable() {
        for code in [
            ProxyErrorCode::NotConfigured,
            ProxyErrorCode::GatewayNotReady,
            ProxyErrorCode::GatewayStartFailed,
        ] {
            assert_eq!(code.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        }
        assert_eq!(ProxyErrorCode::ConnectionFailed.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::GatewayNotReady, "gateway did not become ready");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"GATEWAY_NOT_READY\""));
        assert!(json.contains("\"message\":\"gateway did not become ready\""));
        assert!(json.contains("\"status\":503"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::ConnectionFailed, "connection refused");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "application/json");
        assert_eq!(response.headers().get("X-Gateway-Error").unwrap(), "CONNECTION_FAILED");
    }
}
