//! # Error Handling
//!
//! Unified error handling for the integrations API: a problem+json response
//! shape with trace ID propagation, plus the mapping from broker errors onto
//! HTTP status codes. Provider diagnostic detail stays in server-side logs;
//! responses never carry token material or upstream bodies.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::broker::BrokerError;
use crate::exchange::ExchangeError;
use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                // Fallback correlation ID so clients can still quote something.
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<BrokerError> for ApiError {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::UnknownTool(tool) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("tool '{}' not found", tool),
            ),
            BrokerError::ToolUnavailable(tool) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "TOOL_UNAVAILABLE",
                &format!("tool '{}' is not configured in this deployment", tool),
            ),
            BrokerError::InvalidState => Self::new(
                StatusCode::BAD_REQUEST,
                "INVALID_STATE",
                "Authorization session expired or was invalid, please retry connecting",
            ),
            BrokerError::Exchange(exchange) => exchange_error(exchange),
            BrokerError::NotConnected => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "No connection exists for this tool",
            ),
            BrokerError::ReauthorizationRequired => Self::new(
                StatusCode::CONFLICT,
                "RECONNECT_REQUIRED",
                "The stored credential is no longer usable, please reconnect the tool",
            ),
            BrokerError::Store(err) => {
                tracing::error!(error = ?err, "Connection store error");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred",
                )
            }
            BrokerError::Internal(err) => {
                tracing::error!(error = ?err, "Broker internal error");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred",
                )
            }
        }
    }
}

/// Provider-side failures become 502 PROVIDER_ERROR. The upstream status is
/// included for diagnostics; the upstream body stays in server-side logs.
fn exchange_error(error: ExchangeError) -> ApiError {
    match error {
        ExchangeError::ExchangeFailed { status, body } => {
            tracing::error!(
                upstream_status = status,
                upstream_body = %body,
                "Provider token exchange failed"
            );
            ApiError::new(
                StatusCode::BAD_GATEWAY,
                "PROVIDER_ERROR",
                "Provider connection failed, please try again",
            )
            .with_details(json!({ "upstream_status": status }))
        }
        ExchangeError::MalformedResponse(detail) => {
            tracing::error!(detail = %detail, "Provider token response was malformed");
            ApiError::new(
                StatusCode::BAD_GATEWAY,
                "PROVIDER_ERROR",
                "Provider connection failed, please try again",
            )
        }
        ExchangeError::RefreshRejected { status, .. } => {
            tracing::warn!(upstream_status = status, "Refresh token rejected upstream");
            ApiError::new(
                StatusCode::CONFLICT,
                "RECONNECT_REQUIRED",
                "The stored credential is no longer usable, please reconnect the tool",
            )
        }
        ExchangeError::Transport(err) => {
            tracing::error!(error = %err, "Provider token endpoint unreachable");
            ApiError::new(
                StatusCode::BAD_GATEWAY,
                "PROVIDER_ERROR",
                "Provider connection failed, please try again",
            )
        }
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create an unauthorized error (401) with explicit trace_id
pub fn unauthorized_with_trace_id(message: Option<&str>, trace_id: String) -> ApiError {
    let mut error = unauthorized(message);
    error.trace_id = Some(trace_id.into_boxed_str());
    error
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}
