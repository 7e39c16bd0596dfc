//! Refresh Endpoint (§4.K): `POST /api/v1/auth/refresh` — verifies a
//! refresh JWT, checks it against the Refresh-Session Store, rotates, and
//! mints a new access/refresh pair.
//!
//! Grounded on the teacher's `jwt::mint`/`jwt::verify` pair and the
//! `SessionManager` rotate/validate shape in `security/auth.rs`, wired
//! together the way spec.md's seven-step algorithm names.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::jwt;
use crate::auth::sessions::{RefreshSessionStore, ValidationOutcome};
use crate::core::config::GatewayConfig;
use crate::core::error::GatewayError;

const ACCESS_TOKEN_TTL_SECS: i64 = 3600;
const REFRESH_TOKEN_TTL_SECS: i64 = 7 * 24 * 3600;

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
    #[serde(rename = "tokenType")]
    pub token_type: String,
    #[serde(rename = "expiresIn")]
    pub expires_in: i64,
    pub scopes: Vec<String>,
}

#[derive(Clone)]
pub struct RefreshState {
    pub config: Arc<GatewayConfig>,
    pub sessions: Arc<RefreshSessionStore>,
}

pub async fn refresh_handler(
    State(state): State<RefreshState>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, GatewayError> {
    if body.refresh_token.trim().is_empty() {
        return Err(GatewayError::InvalidRequest {
            message: "refreshToken is required".to_string(),
        });
    }

    let claims = jwt::verify(&state.config.jwt_secret, &body.refresh_token)?;

    if let Some(token_type) = &claims.token_type {
        if token_type != "refresh" {
            return Err(GatewayError::AuthInvalidToken {
                reason: "token is not a refresh token".to_string(),
            });
        }
    }

    let session_id = claims.session_id.as_deref();
    let rotation_id = claims.rotation_id.as_deref();
    let expires_at = chrono::DateTime::from_timestamp(claims.exp, 0);

    let validation = state
        .sessions
        .validate_presented_token(session_id, rotation_id, expires_at);
    if validation.outcome == ValidationOutcome::TokenReplayed {
        info!(event = "auth.refresh_replay", session_id = ?session_id, "refresh token replay detected");
        return Err(GatewayError::RefreshTokenReplayed);
    }
    if !validation.is_ok() {
        return Err(GatewayError::RefreshTokenUnknown);
    }

    let now = Utc::now();
    let new_access_expiry = now + ChronoDuration::seconds(ACCESS_TOKEN_TTL_SECS);
    let new_refresh_expiry = now + ChronoDuration::seconds(REFRESH_TOKEN_TTL_SECS);

    let next_rotation_id = match session_id {
        Some(session_id) => state.sessions.rotate(session_id, Some(new_refresh_expiry), None),
        None => state.sessions.generate_rotation_id(),
    };

    let scopes = claims.scopes.clone().unwrap_or_default();

    let access_token = jwt::mint(
        &state.config.jwt_secret,
        &claims.sub,
        claims.role.clone(),
        scopes.clone(),
        claims.session_id.clone(),
        None,
        "access",
        new_access_expiry,
    )?;

    let refresh_token = jwt::mint(
        &state.config.jwt_secret,
        &claims.sub,
        claims.role.clone(),
        scopes.clone(),
        claims.session_id.clone(),
        Some(next_rotation_id),
        "refresh",
        new_refresh_expiry,
    )?;

    Ok(Json(RefreshResponse {
        access_token,
        refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: ACCESS_TOKEN_TTL_SECS,
        scopes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ApiKeyRegistrySource, Environment, HistoryConfig};
    use std::net::{IpAddr, Ipv4Addr};

    fn config() -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            environment: Environment::Test,
            log_level: "info".to_string(),
            jwt_secret: "test-secret".to_string(),
            admin_api_token: None,
            api_key_registry: ApiKeyRegistrySource::None,
            history: HistoryConfig::default(),
        })
    }

    #[tokio::test]
    async fn happy_path_rotates_and_mints_new_pair() {
        let config = config();
        let sessions = Arc::new(RefreshSessionStore::new());
        let rotation_id = sessions.generate_rotation_id();

        let refresh_token = jwt::mint(
            &config.jwt_secret,
            "user-1",
            Some("member".to_string()),
            vec!["graph:read".to_string()],
            Some("sess-1".to_string()),
            Some(rotation_id.clone()),
            "refresh",
            Utc::now() + ChronoDuration::days(7),
        )
        .unwrap();

        // Seed the session with this rotation id so the first presentation validates.
        sessions.validate_presented_token(Some("sess-1"), Some(&rotation_id), None);

        let state = RefreshState {
            config: config.clone(),
            sessions: sessions.clone(),
        };
        let response = refresh_handler(State(state), Json(RefreshRequest { refresh_token: refresh_token.clone() }))
            .await
            .unwrap();
        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.expires_in, ACCESS_TOKEN_TTL_SECS);
        assert_eq!(response.scopes, vec!["graph:read".to_string()]);

        // The same refresh token must now replay.
        let state = RefreshState { config, sessions };
        let err = refresh_handler(State(state), Json(RefreshRequest { refresh_token }))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RefreshTokenReplayed));
    }

    #[tokio::test]
    async fn wrong_token_type_is_rejected() {
        let config = config();
        let sessions = Arc::new(RefreshSessionStore::new());
        let access_token = jwt::mint(
            &config.jwt_secret,
            "user-1",
            None,
            vec![],
            Some("sess-1".to_string()),
            None,
            "access",
            Utc::now() + ChronoDuration::hours(1),
        )
        .unwrap();

        let state = RefreshState { config, sessions };
        let err = refresh_handler(State(state), Json(RefreshRequest { refresh_token: access_token }))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AuthInvalidToken { .. }));
    }

    #[tokio::test]
    async fn empty_token_is_invalid_request() {
        let config = config();
        let sessions = Arc::new(RefreshSessionStore::new());
        let state = RefreshState { config, sessions };
        let err = refresh_handler(State(state), Json(RefreshRequest { refresh_token: "".to_string() }))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }
}
