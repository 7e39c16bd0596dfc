//! Gateway process entrypoint: load configuration, wire up shared state,
//! spawn background tickers, and serve the router until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use gatekeeper_core::auth::api_keys::ApiKeyRegistry;
use gatekeeper_core::auth::sessions::RefreshSessionStore;
use gatekeeper_core::authz::EnforcementState;
use gatekeeper_core::core::config::GatewayConfig;
use gatekeeper_core::core::logging::{initialize_logging, LoggingConfig};
use gatekeeper_core::events::EventBus;
use gatekeeper_core::ratelimit::RateLimiter;
use gatekeeper_core::rpc::registry::ToolRegistry;
use gatekeeper_core::scope::ScopeCatalogue;
use gatekeeper_core::ws::hub::WsHub;
use gatekeeper_core::{build_router, AppState, GatewayError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(GatewayConfig::from_env()?);

    initialize_logging(LoggingConfig::from_level_str(&config.log_level, config.environment))?;

    let api_keys = Arc::new(ApiKeyRegistry::new(config.api_key_registry.clone()));
    let enforcement = Arc::new(EnforcementState {
        jwt_secret_set: true,
        admin_token_set: config.admin_api_token.is_some(),
        registry_configured: api_keys.is_configured(),
    });

    let bus = Arc::new(EventBus::new());
    let hub = Arc::new(WsHub::new(bus.clone()));
    let rate_limiter = Arc::new(RateLimiter::new());

    let state = AppState {
        config: config.clone(),
        api_keys,
        sessions: Arc::new(RefreshSessionStore::new()),
        rate_limiter: rate_limiter.clone(),
        scopes: Arc::new(ScopeCatalogue::with_defaults()),
        enforcement,
        registry: Arc::new(ToolRegistry::new()),
        bus,
        hub: hub.clone(),
        started_at: Instant::now(),
    };

    rate_limiter.spawn_sweeper();
    hub.spawn_fanout();
    hub.spawn_keepalive();
    hub.spawn_sweeper();

    let app = build_router(state);
    let addr = SocketAddr::new(config.bind_addr, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::internal("startup", format!("failed to bind {addr}: {e}")))?;

    tracing::info!(%addr, environment = ?config.environment, "gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(hub))
    .await
    .map_err(|e| GatewayError::internal("server", e.to_string()))?;

    Ok(())
}

async fn shutdown_signal(hub: Arc<WsHub>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, draining websocket connections");
    hub.shutdown().await;
}
