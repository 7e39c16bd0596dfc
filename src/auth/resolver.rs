//! Auth Resolver (§4.E): classifies the presented credential and populates
//! an `AuthContext`. Grounded on `AuthenticationManager`'s provider-chain
//! dispatch in `security/auth.rs`, generalized from its password/session
//! providers to the admin-token / JWT / API-key / anonymous chain spec.md
//! specifies.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::api_keys::ApiKeyRegistry;
use crate::auth::jwt;
use crate::core::config::GatewayConfig;
use crate::core::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Jwt,
    ApiKey,
    AdminToken,
    Anonymous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    MissingBearer,
    InvalidToken,
    TokenExpired,
    InvalidApiKey,
    ChecksumMismatch,
}

#[derive(Debug, Clone)]
pub struct AuditInfo {
    pub request_id: String,
    pub ip: String,
    pub user_agent: String,
}

/// Per-request/per-upgrade authentication context. Created fresh, written
/// once by the Authorization Gate (§4.F), never shared across requests.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub token_type: TokenType,
    pub user: Option<String>,
    pub scopes: Vec<String>,
    pub required_scopes: Option<Vec<String>>,
    pub api_key_id: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub token_error: Option<TokenError>,
    pub token_error_detail: Option<String>,
    pub audit: AuditInfo,
    pub decision: Option<Decision>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted,
    Denied,
}

impl AuthContext {
    fn anonymous(audit: AuditInfo) -> Self {
        Self {
            token_type: TokenType::Anonymous,
            user: None,
            scopes: Vec::new(),
            required_scopes: None,
            api_key_id: None,
            issuer: None,
            audience: None,
            expires_at: None,
            session_id: None,
            token_error: None,
            token_error_detail: None,
            audit,
            decision: None,
        }
    }
}

const QUERY_TOKEN_KEYS: &[&str] = &[
    "access_token",
    "token",
    "bearer_token",
    "api_key",
    "apikey",
    "apiKey",
];

/// Extract a bearer-equivalent token from the WebSocket upgrade query
/// string, checked in the fixed key order spec.md §4.E lists.
pub fn token_from_query(query: &str) -> Option<String> {
    let pairs = url_decode_pairs(query);
    for key in QUERY_TOKEN_KEYS {
        if let Some((_, value)) = pairs.iter().find(|(k, _)| k == key) {
            return Some(value.clone());
        }
    }
    None
}

fn url_decode_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.replace('+', " ")))
        .collect()
}

const SCOPE_ALIASES: &[(&str, &str)] = &[
    ("read", "graph:read"),
    ("write", "graph:write"),
    ("analyze", "code:analyze"),
    ("code.read", "code:read"),
    ("code.write", "code:write"),
];

/// Split on whitespace/commas, trim, lowercase, alias, dedupe.
pub fn normalize_scopes(raw: &str) -> Vec<String> {
    let mut scopes: Vec<String> = raw
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .map(|s| {
            SCOPE_ALIASES
                .iter()
                .find(|(alias, _)| *alias == s)
                .map(|(_, canonical)| canonical.to_string())
                .unwrap_or(s)
        })
        .collect();
    scopes.sort();
    scopes.dedup();
    scopes
}

pub struct AuthResolver<'a> {
    pub config: &'a GatewayConfig,
    pub api_keys: &'a ApiKeyRegistry,
}

impl<'a> AuthResolver<'a> {
    pub fn new(config: &'a GatewayConfig, api_keys: &'a ApiKeyRegistry) -> Self {
        Self { config, api_keys }
    }

    /// Resolve the auth context from request headers (HTTP) or headers
    /// pre-populated from query-string tokens (WebSocket upgrade).
    pub fn resolve(&self, headers: &HeaderMap, ip: &str, user_agent: &str) -> AuthContext {
        let audit = AuditInfo {
            request_id: Uuid::new_v4().to_string(),
            ip: ip.to_string(),
            user_agent: user_agent.to_string(),
        };

        let authorization = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if let Some(admin_token) = &self.config.admin_api_token {
            let bearer_value = authorization
                .as_deref()
                .and_then(|v| v.strip_prefix("Bearer "));
            let full_matches = authorization.as_deref() == Some(admin_token.as_str());
            let bearer_matches = bearer_value == Some(admin_token.as_str());
            if full_matches || bearer_matches {
                return AuthContext {
                    token_type: TokenType::AdminToken,
                    user: Some("admin".to_string()),
                    scopes: vec![
                        "admin".into(),
                        "graph:read".into(),
                        "graph:write".into(),
                        "code:analyze".into(),
                        "session:manage".into(),
                    ],
                    required_scopes: None,
                    api_key_id: None,
                    issuer: None,
                    audience: None,
                    expires_at: None,
                    session_id: None,
                    token_error: None,
                    token_error_detail: None,
                    audit,
                    decision: None,
                };
            }
        }

        if let Some(authorization) = authorization {
            return self.resolve_bearer(&authorization, audit);
        }

        if let Some(api_key_header) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
            if self.config.admin_api_token.as_deref() == Some(api_key_header) {
                return AuthContext {
                    token_type: TokenType::AdminToken,
                    user: Some("admin".to_string()),
                    scopes: vec!["admin".into()],
                    required_scopes: None,
                    api_key_id: None,
                    issuer: None,
                    audience: None,
                    expires_at: None,
                    session_id: None,
                    token_error: None,
                    token_error_detail: None,
                    audit,
                    decision: None,
                };
            }
            return self.resolve_api_key(api_key_header, audit);
        }

        AuthContext::anonymous(audit)
    }

    fn resolve_bearer(&self, authorization: &str, audit: AuditInfo) -> AuthContext {
        let Some(token) = authorization.strip_prefix("Bearer ") else {
            return AuthContext {
                token_error: Some(TokenError::MissingBearer),
                token_error_detail: Some("Authorization header must use the Bearer scheme".into()),
                ..AuthContext::anonymous(audit)
            };
        };

        if token.is_empty() {
            return AuthContext {
                token_error: Some(TokenError::InvalidToken),
                token_error_detail: Some("bearer token is empty".into()),
                ..AuthContext::anonymous(audit)
            };
        }

        match jwt::verify(&self.config.jwt_secret, token) {
            Ok(claims) => {
                let scopes = claims
                    .scopes
                    .map(|s| {
                        s.into_iter()
                            .flat_map(|raw| normalize_scopes(&raw))
                            .collect()
                    })
                    .unwrap_or_default();
                AuthContext {
                    token_type: TokenType::Jwt,
                    user: Some(claims.sub),
                    scopes,
                    required_scopes: None,
                    api_key_id: None,
                    issuer: claims.iss,
                    audience: claims.aud,
                    expires_at: DateTime::from_timestamp(claims.exp, 0),
                    session_id: claims.session_id,
                    token_error: None,
                    token_error_detail: None,
                    audit,
                    decision: None,
                }
            }
            Err(err) => {
                use jsonwebtoken::errors::ErrorKind;
                let token_error = match err.kind() {
                    ErrorKind::ExpiredSignature => TokenError::TokenExpired,
                    _ => TokenError::InvalidToken,
                };
                AuthContext {
                    token_error: Some(token_error),
                    token_error_detail: Some(err.to_string()),
                    ..AuthContext::anonymous(audit)
                }
            }
        }
    }

    fn resolve_api_key(&self, header_value: &str, audit: AuditInfo) -> AuthContext {
        match self.api_keys.authenticate(header_value) {
            Ok(result) => AuthContext {
                token_type: TokenType::ApiKey,
                user: None,
                scopes: result.scopes,
                required_scopes: None,
                api_key_id: Some(result.record_id),
                issuer: None,
                audience: None,
                expires_at: None,
                session_id: None,
                token_error: None,
                token_error_detail: None,
                audit,
                decision: None,
            },
            Err(err) => {
                let token_error = match err {
                    GatewayError::AuthApiKeyChecksumMismatch => TokenError::ChecksumMismatch,
                    _ => TokenError::InvalidApiKey,
                };
                AuthContext {
                    token_error: Some(token_error),
                    token_error_detail: Some(err.to_string()),
                    ..AuthContext::anonymous(audit)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_and_aliases_scopes() {
        let scopes = normalize_scopes("Read, write ,ANALYZE");
        assert_eq!(
            scopes,
            vec![
                "code:analyze".to_string(),
                "graph:read".to_string(),
                "graph:write".to_string(),
            ]
        );
    }

    #[test]
    fn dedupes_after_aliasing() {
        let scopes = normalize_scopes("read read graph:read");
        assert_eq!(scopes, vec!["graph:read".to_string()]);
    }

    #[test]
    fn query_token_extraction_checks_fixed_key_order() {
        let query = "foo=bar&api_key=abc123";
        assert_eq!(token_from_query(query), Some("abc123".to_string()));
    }
}
