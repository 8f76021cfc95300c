//! Centralized error types for the Hearthcast core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the Hearthcast control plane.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum HearthError {
    /// A transition was requested to a source with no registered plugin.
    #[error("Unknown audio source: {0}")]
    UnknownSource(String),

    /// A plugin failed to initialize its resources.
    #[error("Plugin initialization failed: {0}")]
    PluginInitialization(String),

    /// A plugin failed to bring its external service to Ready.
    #[error("Plugin start failed: {0}")]
    PluginStart(String),

    /// A source transition failed and emergency stop was performed.
    ///
    /// Wraps the underlying plugin failure; the attempted target is carried
    /// so callers and event consumers can report what was being switched to.
    #[error("Transition to {attempted} failed: {reason}")]
    Transition {
        /// The source the failed transition was targeting.
        attempted: String,
        /// Detail from the underlying failure.
        reason: String,
    },

    /// A routing mode change failed and was rolled back.
    #[error("Routing change failed: {0}")]
    RoutingApply(String),

    /// Persisting state to disk failed.
    ///
    /// The in-memory change is kept; it will not survive a restart.
    #[error("Persistence failed: {0}")]
    Persistence(String),

    /// Controlling an external service (start/stop/probe) failed.
    #[error("Service control failed: {0}")]
    ServiceControl(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HearthError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownSource(_) => "unknown_source",
            Self::PluginInitialization(_) => "plugin_initialization_failed",
            Self::PluginStart(_) => "plugin_start_failed",
            Self::Transition { .. } => "transition_failed",
            Self::RoutingApply(_) => "routing_apply_failed",
            Self::Persistence(_) => "persistence_failed",
            Self::ServiceControl(_) => "service_control_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an HTTP status code.
    fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownSource(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::PluginInitialization(_)
            | Self::PluginStart(_)
            | Self::Transition { .. }
            | Self::RoutingApply(_)
            | Self::ServiceControl(_) => StatusCode::BAD_GATEWAY,
            Self::Persistence(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ErrorCode for HearthError {
    fn code(&self) -> &'static str {
        HearthError::code(self)
    }
}

/// JSON body for API error responses.
#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    code: &'static str,
}

impl IntoResponse for HearthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}

/// Convenience result alias for core operations.
pub type HearthResult<T> = Result<T, HearthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(HearthError::UnknownSource("x".into()).code(), "unknown_source");
        assert_eq!(
            HearthError::Transition {
                attempted: "bluetooth_receiver".into(),
                reason: "boom".into()
            }
            .code(),
            "transition_failed"
        );
        assert_eq!(HearthError::Persistence("disk".into()).code(), "persistence_failed");
    }

    #[test]
    fn status_codes_map_by_category() {
        assert_eq!(
            HearthError::UnknownSource("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HearthError::InvalidRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            HearthError::PluginStart("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }
}
