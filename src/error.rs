//! Error taxonomy and JSON error responses

use crate::body::{full, SpaResponse};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Every failure the router can hand to a request or to the startup sequence.
///
/// `Clone` because single-resolution signals give the same outcome to every
/// waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpaError {
    /// Missing or invalid setup value; aborts application startup
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The dev server failed to launch or exited before it was ready
    #[error("startup error: {0}")]
    Startup(String),
    /// A caller-imposed deadline on a pending resolution elapsed
    #[error("timed out after {}ms waiting for {what}", .timeout.as_millis())]
    ResolutionTimeout { what: String, timeout: Duration },
    /// Backend unreachable (connection-level failure only)
    #[error("proxy error: {0}")]
    Proxy(String),
    /// The backend did not answer within the route's request timeout
    #[error("backend did not respond within {}s", .0.as_secs())]
    ProxyTimeout(Duration),
    /// The renderer or the on-demand build failed
    #[error("render error: {0}")]
    Render(String),
}

impl SpaError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SpaError::Configuration(_) => ErrorCode::ConfigurationError,
            SpaError::Startup(_) => ErrorCode::StartupFailed,
            SpaError::ResolutionTimeout { .. } => ErrorCode::ResolutionTimeout,
            SpaError::Proxy(_) => ErrorCode::ConnectionFailed,
            SpaError::ProxyTimeout(_) => ErrorCode::RequestTimeout,
            SpaError::Render(_) => ErrorCode::RenderFailed,
        }
    }

    /// Convert into the JSON error response sent to the waiting client
    pub fn into_response(self) -> SpaResponse {
        json_error_response(self.code(), self.to_string())
    }
}

/// Error codes carried in JSON bodies and the `X-Spa-Error` header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConfigurationError,
    StartupFailed,
    ResolutionTimeout,
    ConnectionFailed,
    RequestTimeout,
    RenderFailed,
    NotFound,
    MethodNotAllowed,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ConfigurationError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StartupFailed => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ResolutionTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::RenderFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::StartupFailed => "STARTUP_FAILED",
            ErrorCode::ResolutionTimeout => "RESOLUTION_TIMEOUT",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::RenderFailed => "RENDER_FAILED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with the X-Spa-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> SpaResponse {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Spa-Error", code.as_header_value())
        .body(full(error.to_json()))
        .expect("valid response with StatusCode enum and static headers")
}
