//! The uniform response envelope (§4.G, GLOSSARY "Envelope").
//!
//! Every response the core produces directly — success or failure — carries
//! `requestId` and `timestamp`; failures additionally carry a structured
//! `error` object. This is the single place a `GatewayError` turns into
//! wire JSON, matching the Design Note that exceptions-as-control-flow be
//! replaced by a tagged result translated once, at the edge.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::error::GatewayError;

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

#[derive(Debug, Serialize, Default)]
pub struct ErrorMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provided_scopes: Option<Vec<String>>,
}

/// The `{success:false, error, metadata, timestamp, requestId}` shape.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorDetail,
    pub metadata: ErrorMetadata,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
}

impl ErrorEnvelope {
    /// Build the envelope body for an error with no request context yet
    /// attached (used by `GatewayError::into_response` for errors raised
    /// outside the dispatcher's request-scoped middleware, e.g. at parse
    /// time before a request id has been minted).
    pub fn from_error(error: &GatewayError) -> Self {
        Self::from_error_with_context(error, "unknown", ErrorMetadata::default())
    }

    pub fn from_error_with_context(
        error: &GatewayError,
        request_id: &str,
        metadata: ErrorMetadata,
    ) -> Self {
        let (reason, detail) = match error {
            GatewayError::ScopeDenied { required, held } => (
                None,
                Some(format!(
                    "required {:?}, held {:?}",
                    required, held
                )),
            ),
            GatewayError::RpcInvalidParams { message } => (None, Some(message.clone())),
            _ => (None, None),
        };

        Self {
            success: false,
            error: ErrorDetail {
                code: error.code().to_string(),
                message: error.to_string(),
                reason,
                detail,
                remediation: remediation_for(error),
            },
            metadata,
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
        }
    }

    /// Headers that accompany this envelope on the wire: `Retry-After` for
    /// retryable kinds, plus the security headers §4.G mandates on every
    /// response (applied globally by the dispatcher, but re-applied here so
    /// direct `IntoResponse` conversions stay correct in isolation).
    pub fn headers(error: &GatewayError) -> HeaderMap {
        let mut headers = HeaderMap::new();
        security_headers(&mut headers);
        if let Some(secs) = error.retry_after_secs() {
            headers.insert("Retry-After", secs.into());
        }
        headers
    }
}

fn remediation_for(error: &GatewayError) -> Option<String> {
    match error {
        GatewayError::AuthExpired => Some("obtain a new access token via /api/v1/auth/refresh".into()),
        GatewayError::ScopeDenied { required, .. } => Some(format!(
            "request a credential carrying scopes: {}",
            required.join(", ")
        )),
        GatewayError::RateLimited { retry_after_secs } => {
            Some(format!("retry after {} seconds", retry_after_secs))
        }
        _ => None,
    }
}

pub fn security_headers(headers: &mut HeaderMap) {
    headers.insert("X-Content-Type-Options", "nosniff".parse().unwrap());
    headers.insert("X-Frame-Options", "DENY".parse().unwrap());
    headers.insert("X-XSS-Protection", "1; mode=block".parse().unwrap());
}

/// The success-path shape for handlers that want the same envelope
/// consistency as the error path, used by §4.L health/metrics endpoints and
/// the MCP router's non-JSON-RPC REST aliases.
#[derive(Debug, Serialize)]
pub struct SuccessEnvelope {
    pub success: bool,
    pub data: Value,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl SuccessEnvelope {
    pub fn new(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            data,
            request_id: request_id.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_denied_carries_detail() {
        let err = GatewayError::ScopeDenied {
            required: vec!["admin".into()],
            held: vec!["graph:read".into()],
        };
        let envelope = ErrorEnvelope::from_error(&err);
        assert_eq!(envelope.error.code, "scope_denied");
        assert!(envelope.error.detail.is_some());
        assert!(!envelope.success);
    }

    #[test]
    fn rate_limited_has_remediation() {
        let err = GatewayError::RateLimited {
            retry_after_secs: 12,
        };
        let envelope = ErrorEnvelope::from_error(&err);
        assert!(envelope.error.remediation.unwrap().contains("12"));
    }
}
