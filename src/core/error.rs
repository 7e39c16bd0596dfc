//! Unified error type for the gateway core.
//!
//! Every failure mode that can reach the HTTP/WebSocket edge is represented
//! here as a tagged variant rather than surfaced through `panic!` or a bare
//! `anyhow::Error` — the edge converts exactly one of these into the error
//! envelope (see `crate::envelope`), never a raw exception.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::envelope::ErrorEnvelope;

/// Main error type for all gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    // Authentication errors (spec.md §7: auth_invalid_token, auth_expired, auth_missing)
    #[error("missing authentication credentials")]
    AuthMissing,

    #[error("invalid authentication token: {reason}")]
    AuthInvalidToken { reason: String },

    #[error("authentication token expired")]
    AuthExpired,

    #[error("unknown API key")]
    AuthUnknownApiKey,

    #[error("API key checksum mismatch")]
    AuthApiKeyChecksumMismatch,

    // Authorization errors
    #[error("insufficient scope: required {required:?}, held {held:?}")]
    ScopeDenied {
        required: Vec<String>,
        held: Vec<String>,
    },

    // Refresh-session errors
    #[error("refresh token not recognized")]
    RefreshTokenUnknown,

    #[error("refresh token already rotated (possible replay)")]
    RefreshTokenReplayed,

    #[error("refresh token expired")]
    RefreshTokenExpired,

    // Rate limiting
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    // Validation / request shape
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("resource not found: {what}")]
    NotFound { what: String },

    // JSON-RPC / MCP specific (carries JSON-RPC numeric codes)
    #[error("JSON-RPC parse error")]
    RpcParseError,

    #[error("JSON-RPC invalid request")]
    RpcInvalidRequest,

    #[error("JSON-RPC method not found: {method}")]
    RpcMethodNotFound { method: String },

    #[error("JSON-RPC invalid params: {message}")]
    RpcInvalidParams { message: String },

    #[error("JSON-RPC internal error: {message}")]
    RpcInternalError { message: String },

    // WebSocket
    #[error("websocket upgrade requires graph:read scope")]
    WebSocketScopeDenied,

    #[error("websocket backpressure exceeded, closing connection")]
    WebSocketBackpressure,

    // Collaborator / internal
    #[error("external collaborator '{name}' failed: {message}")]
    CollaboratorFailure { name: String, message: String },

    #[error("internal error in {context}: {message}")]
    Internal { context: String, message: String },

    #[error("configuration error: {message}")]
    Config { message: String },
}

impl GatewayError {
    pub fn internal(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Machine-readable error code used in the envelope's `error.code` field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthMissing => "auth_missing",
            Self::AuthInvalidToken { .. } => "auth_invalid_token",
            Self::AuthExpired => "auth_expired",
            Self::AuthUnknownApiKey => "auth_unknown_api_key",
            Self::AuthApiKeyChecksumMismatch => "auth_checksum_mismatch",
            Self::ScopeDenied { .. } => "scope_denied",
            Self::RefreshTokenUnknown => "refresh_unknown",
            Self::RefreshTokenReplayed => "refresh_replayed",
            Self::RefreshTokenExpired => "refresh_expired",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::NotFound { .. } => "not_found",
            Self::RpcParseError => "rpc_parse_error",
            Self::RpcInvalidRequest => "rpc_invalid_request",
            Self::RpcMethodNotFound { .. } => "rpc_method_not_found",
            Self::RpcInvalidParams { .. } => "rpc_invalid_params",
            Self::RpcInternalError { .. } => "rpc_internal_error",
            Self::WebSocketScopeDenied => "ws_scope_denied",
            Self::WebSocketBackpressure => "ws_backpressure",
            Self::CollaboratorFailure { .. } => "collaborator_failure",
            Self::Internal { .. } => "internal_error",
            Self::Config { .. } => "config_error",
        }
    }

    /// HTTP status this error maps onto at the edge.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthMissing | Self::AuthInvalidToken { .. } | Self::AuthExpired => {
                StatusCode::UNAUTHORIZED
            }
            Self::AuthUnknownApiKey | Self::AuthApiKeyChecksumMismatch => StatusCode::UNAUTHORIZED,
            Self::ScopeDenied { .. } | Self::WebSocketScopeDenied => StatusCode::FORBIDDEN,
            Self::RefreshTokenUnknown
            | Self::RefreshTokenReplayed
            | Self::RefreshTokenExpired => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidRequest { .. } | Self::RpcInvalidParams { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::RpcParseError | Self::RpcInvalidRequest | Self::RpcMethodNotFound { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::RpcInternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::WebSocketBackpressure => StatusCode::INTERNAL_SERVER_ERROR,
            Self::CollaboratorFailure { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal { .. } | Self::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a client can reasonably retry this request unchanged.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::CollaboratorFailure { .. }
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// JSON-RPC 2.0 numeric error code, for variants reached through the
    /// tool router rather than the plain HTTP surface.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::RpcParseError => -32700,
            Self::RpcInvalidRequest => -32600,
            Self::RpcMethodNotFound { .. } => -32601,
            Self::RpcInvalidParams { .. } => -32602,
            Self::RpcInternalError { .. } | Self::Internal { .. } => -32603,
            _ => -32603,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        crate::core::logging::log_gateway_error(&self, "unknown");
        let envelope = ErrorEnvelope::from_error(&self);
        (status, axum::Json(envelope)).into_response()
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("collaborator", err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest {
            message: format!("JSON error: {}", err),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::internal("io", err.to_string())
    }
}

impl From<std::env::VarError> for GatewayError {
    fn from(err: std::env::VarError) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for GatewayError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::AuthExpired,
            _ => Self::AuthInvalidToken {
                reason: err.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error category, used only for structured log fields (`error.category`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    Authorization,
    RateLimit,
    Validation,
    Rpc,
    WebSocket,
    Collaborator,
    System,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth => write!(f, "auth"),
            Self::Authorization => write!(f, "authorization"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Validation => write!(f, "validation"),
            Self::Rpc => write!(f, "rpc"),
            Self::WebSocket => write!(f, "websocket"),
            Self::Collaborator => write!(f, "collaborator"),
            Self::System => write!(f, "system"),
        }
    }
}

impl GatewayError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AuthMissing
            | Self::AuthInvalidToken { .. }
            | Self::AuthExpired
            | Self::AuthUnknownApiKey
            | Self::AuthApiKeyChecksumMismatch
            | Self::RefreshTokenUnknown
            | Self::RefreshTokenReplayed
            | Self::RefreshTokenExpired => ErrorCategory::Auth,
            Self::ScopeDenied { .. } | Self::WebSocketScopeDenied => ErrorCategory::Authorization,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::InvalidRequest { .. } | Self::NotFound { .. } => ErrorCategory::Validation,
            Self::RpcParseError
            | Self::RpcInvalidRequest
            | Self::RpcMethodNotFound { .. }
            | Self::RpcInvalidParams { .. }
            | Self::RpcInternalError { .. } => ErrorCategory::Rpc,
            Self::WebSocketBackpressure => ErrorCategory::WebSocket,
            Self::CollaboratorFailure { .. } => ErrorCategory::Collaborator,
            Self::Internal { .. } | Self::Config { .. } => ErrorCategory::System,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_denied_maps_to_forbidden() {
        let err = GatewayError::ScopeDenied {
            required: vec!["graph:read".into()],
            held: vec![],
        };
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.code(), "scope_denied");
    }

    #[test]
    fn rate_limited_is_retryable_with_header_value() {
        let err = GatewayError::RateLimited {
            retry_after_secs: 30,
        };
        assert!(err.retryable());
        assert_eq!(err.retry_after_secs(), Some(30));
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn rpc_method_not_found_has_dash_32601() {
        let err = GatewayError::RpcMethodNotFound {
            method: "frobnicate".into(),
        };
        assert_eq!(err.rpc_code(), -32601);
    }
}
