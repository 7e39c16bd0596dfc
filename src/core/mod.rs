//! Shared ambient concerns: configuration, error types, logging.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{ApiKeyRegistrySource, Environment, GatewayConfig, HistoryConfig};
pub use error::{ErrorCategory, GatewayError, Result};
pub use logging::{initialize_default_logging, initialize_logging, log_gateway_error, LoggingConfig, PerfTimer};
