//! Structured logging for the gateway core.
//!
//! Console logging always runs; file logging turns on in non-development
//! environments. There is no JSON analytics sink and no log-file rotation
//! policy to manage here — the platform this was split from shipped one,
//! but nothing in the gateway's scope needs it.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Once;
use tracing::{Level, Span};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::core::config::Environment;
use crate::core::error::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub console_level: Level,
    pub file_level: Level,
    pub log_dir: Option<PathBuf>,
    pub console_colors: bool,
}

impl LoggingConfig {
    pub fn from_level_str(level: &str, environment: Environment) -> Self {
        let console_level = level.parse().unwrap_or(Level::INFO);
        Self {
            console_level,
            file_level: Level::DEBUG,
            log_dir: environment
                .is_production()
                .then(|| PathBuf::from("/var/log/gatekeeper")),
            console_colors: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            console_level: Level::INFO,
            file_level: Level::DEBUG,
            log_dir: None,
            console_colors: true,
        }
    }
}

static LOGGING_INITIALIZED: Once = Once::new();

pub fn initialize_logging(config: LoggingConfig) -> Result<()> {
    let mut init_result = Ok(());
    LOGGING_INITIALIZED.call_once(|| {
        init_result = setup_logging_internal(config);
    });
    init_result
}

pub fn initialize_default_logging() -> Result<()> {
    initialize_logging(LoggingConfig::default())
}

fn setup_logging_internal(config: LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.console_level.into())
        .from_env_lossy()
        .add_directive("hyper=info".parse().unwrap())
        .add_directive("tower_http=debug".parse().unwrap());

    let registry = tracing_subscriber::registry().with(env_filter);

    let console_layer = fmt::layer()
        .with_ansi(config.console_colors && std::io::stdout().is_terminal())
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stdout)
        .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
            config.console_level,
        ));

    let mut layers = vec![Box::new(console_layer) as Box<dyn Layer<_> + Send + Sync>];

    if let Some(log_dir) = &config.log_dir {
        std::fs::create_dir_all(log_dir)
            .map_err(|e| GatewayError::internal("logging", e.to_string()))?;

        let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "gatekeeper.log");
        let file_layer = fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(file_appender)
            .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                config.file_level,
            ));
        layers.push(Box::new(file_layer));
    }

    registry
        .with(layers)
        .try_init()
        .map_err(|e| GatewayError::internal("logging", format!("failed to init tracing: {}", e)))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        console_level = %config.console_level,
        file_logging = config.log_dir.is_some(),
        "gateway logging initialized"
    );

    Ok(())
}

/// Simple elapsed-time helper for instrumenting a logical operation that
/// doesn't already have its own `tracing` span (most request handling does,
/// via the dispatcher's request span — this is for background tasks).
pub struct PerfTimer {
    name: String,
    start: std::time::Instant,
    span: Span,
}

impl PerfTimer {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let span = tracing::info_span!("perf_timer", operation = %name);
        Self {
            name,
            start: std::time::Instant::now(),
            span,
        }
    }

    pub fn finish(self) {
        let elapsed = self.start.elapsed();
        tracing::debug!(
            parent: &self.span,
            operation = %self.name,
            elapsed_ms = elapsed.as_millis() as f64,
            "operation completed"
        );
    }
}

/// Centralizes the error-to-log mapping so every call site logs consistently:
/// 5xx at error, 4xx validation/not-found at warn, everything else at info.
pub fn log_gateway_error(error: &GatewayError, request_id: &str) {
    let status = error.status();
    if status.is_server_error() {
        tracing::error!(
            error = %error,
            error.category = %error.category(),
            error.code = error.code(),
            request_id = request_id,
            "request failed"
        );
    } else if status.is_client_error() {
        tracing::warn!(
            error = %error,
            error.category = %error.category(),
            error.code = error.code(),
            request_id = request_id,
            "request rejected"
        );
    } else {
        tracing::info!(
            error = %error,
            request_id = request_id,
            "request not completed"
        );
    }
}

pub fn is_initialized() -> bool {
    LOGGING_INITIALIZED.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_info_console_only() {
        let config = LoggingConfig::default();
        assert_eq!(config.console_level, Level::INFO);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn production_environment_enables_file_logging() {
        let config = LoggingConfig::from_level_str("debug", Environment::Production);
        assert!(config.log_dir.is_some());
        assert_eq!(config.console_level, Level::DEBUG);
    }
}
