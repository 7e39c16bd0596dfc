//! Environment-variable configuration for the gateway core.
//!
//! No config file format is supported — every setting is read once at
//! startup, the same `std::env::var` pattern the platform used for
//! `HIVE_HOME`, just widened to the gateway's whole surface.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::error::{GatewayError, Result};

/// Complete gateway configuration, loaded once into an `Arc<GatewayConfig>`
/// and threaded through axum `State`.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub environment: Environment,
    pub log_level: String,
    pub jwt_secret: String,
    pub admin_api_token: Option<String>,
    pub api_key_registry: ApiKeyRegistrySource,
    pub history: HistoryConfig,
}

/// Deployment environment, mirrors the `NODE_ENV` convention the teacher's
/// configuration carried over from the wider platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Environment {
    fn from_env_str(value: &str) -> Self {
        match value {
            "production" | "prod" => Self::Production,
            "test" => Self::Test,
            _ => Self::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Where the API-key registry (§4.B) should load its records from. Checked
/// in the order `Provider` (inline JSON in an env var) > `File` (path to a
/// JSON document) > `None` (registry starts empty, only the admin token and
/// JWTs authenticate).
#[derive(Debug, Clone)]
pub enum ApiKeyRegistrySource {
    Inline(String),
    File(PathBuf),
    None,
}

/// Scheduler toggles for the JSON-RPC execution history ring buffer (§4.J).
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 500,
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the process environment. Fails closed: a
    /// missing `JWT_SECRET` is a startup error, never a silently-generated
    /// one, since that would make every previously issued token
    /// unverifiable without anyone noticing.
    pub fn from_env() -> Result<Self> {
        let jwt_secret = std::env::var("JWT_SECRET").map_err(|_| GatewayError::Config {
            message: "JWT_SECRET must be set".to_string(),
        })?;

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        let bind_addr = std::env::var("HOST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let environment = Environment::from_env_str(
            &std::env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let admin_api_token = std::env::var("ADMIN_API_TOKEN").ok();

        let api_key_registry = if let Ok(inline) = std::env::var("API_KEY_REGISTRY") {
            ApiKeyRegistrySource::Inline(inline)
        } else if let Ok(path) = std::env::var("API_KEY_REGISTRY_PATH") {
            ApiKeyRegistrySource::File(PathBuf::from(path))
        } else {
            ApiKeyRegistrySource::None
        };

        let history = HistoryConfig {
            enabled: env_bool("HISTORY_ENABLED", true),
            capacity: env_usize("HISTORY_CAPACITY", 500),
            retention: Duration::from_secs(env_u64("HISTORY_RETENTION_SECS", 3600)),
            sweep_interval: Duration::from_secs(env_u64("HISTORY_SWEEP_INTERVAL_SECS", 300)),
        };

        Ok(Self {
            bind_addr,
            port,
            environment,
            log_level,
            jwt_secret,
            admin_api_token,
            api_key_registry,
            history,
        })
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
