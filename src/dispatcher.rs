//! HTTP Dispatcher (§4.M): wires every other component into the request
//! lifecycle — CORS, security headers, rate limiting, auth/authz, and
//! route mounting.
//!
//! Grounded on the teacher's `axum::Router` construction and
//! `tower_http::cors::CorsLayer` wiring in its own HTTP entrypoint, with
//! the auth/rate-limit/scope chain collapsed into a single
//! `axum::middleware::from_fn_with_state` the way the teacher's
//! `AuthenticationManager` is invoked once per request rather than as
//! several independently composed layers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Extension, Path, Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tower_http::cors::{AllowCredentials, AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::api_keys::ApiKeyRegistry;
use crate::auth::resolver::{AuthContext, AuthResolver};
use crate::auth::sessions::RefreshSessionStore;
use crate::authz::{self, EnforcementState};
use crate::core::config::GatewayConfig;
use crate::core::error::GatewayError;
use crate::envelope::{security_headers, ErrorEnvelope, ErrorMetadata};
use crate::events::EventBus;
use crate::health::{self, HealthState};
use crate::ratelimit::{RateLimitPreset, RateLimiter};
use crate::refresh::{self, RefreshState};
use crate::rpc::registry::ToolRegistry;
use crate::rpc::router::handle_payload;
use crate::scope::ScopeCatalogue;
use crate::ws::hub::{require_websocket_upgrade, upgrade_handler, WsHub, WsUpgradeState};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub api_keys: Arc<ApiKeyRegistry>,
    pub sessions: Arc<RefreshSessionStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub scopes: Arc<ScopeCatalogue>,
    pub enforcement: Arc<EnforcementState>,
    pub registry: Arc<ToolRegistry>,
    pub bus: Arc<EventBus>,
    pub hub: Arc<WsHub>,
    pub started_at: Instant,
}

impl AppState {
    fn health_state(&self) -> HealthState {
        HealthState {
            registry: self.registry.clone(),
            hub: self.hub.clone(),
            started_at: self.started_at,
        }
    }

    fn refresh_state(&self) -> RefreshState {
        RefreshState {
            config: self.config.clone(),
            sessions: self.sessions.clone(),
        }
    }

    fn ws_state(&self) -> WsUpgradeState {
        WsUpgradeState {
            hub: self.hub.clone(),
            config: self.config.clone(),
            api_keys: self.api_keys.clone(),
            enforcement: self.enforcement.clone(),
        }
    }
}

/// Build the full router. `ConnectInfo<SocketAddr>` must be available on the
/// incoming connection (via `into_make_service_with_connect_info`) for the
/// auth/rate-limit middleware and the WebSocket upgrade handler alike.
pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health::health_handler))
        .with_state(state.health_state());

    let mcp_introspection_routes = Router::new()
        .route("/mcp/health", get(health::mcp_health_handler))
        .route("/mcp/metrics", get(health::mcp_metrics_handler))
        .route("/mcp/history", get(health::mcp_history_handler))
        .route("/mcp/performance", get(health::mcp_performance_handler))
        .route("/mcp/stats", get(health::mcp_stats_handler))
        .with_state(state.health_state());

    let refresh_routes = Router::new()
        .route("/api/v1/auth/refresh", post(refresh::refresh_handler))
        .with_state(state.refresh_state());

    let ws_routes = Router::new()
        .route("/ws", get(upgrade_handler))
        .layer(middleware::from_fn(require_websocket_upgrade))
        .with_state(state.ws_state());

    let rpc_routes = Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/api/trpc", post(trpc_handler))
        .route("/api/trpc/*path", post(trpc_handler))
        .route("/mcp/tools", get(list_tools_handler))
        .route("/mcp/tools/:name", post(call_tool_handler))
        .with_state(state.clone());

    Router::new()
        .merge(health_routes)
        .merge(mcp_introspection_routes)
        .merge(refresh_routes)
        .merge(ws_routes)
        .merge(rpc_routes)
        .fallback(fallback_handler)
        .layer(middleware::from_fn_with_state(state.clone(), dispatch_middleware))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(AllowCredentials::yes())
}

async fn fallback_handler() -> GatewayError {
    GatewayError::NotFound {
        what: "route".to_string(),
    }
}

/// Rate-limit preset per route, a coarse heuristic over the path since
/// spec.md's per-route preset assignment is a deployment-time wiring
/// decision the core doesn't itself prescribe (§4.D: "a middleware factory
/// takes `{maxRequests, windowMs, ...}`" — callers choose the preset).
fn preset_for_path(path: &str) -> RateLimitPreset {
    if path.starts_with("/api/v1/admin") {
        RateLimitPreset::ADMIN
    } else if path.contains("search") {
        RateLimitPreset::SEARCH
    } else if path == "/api/v1/auth/refresh" {
        RateLimitPreset::STRICT
    } else {
        RateLimitPreset::DEFAULT
    }
}

/// Single pass combining rate limiting, auth resolution, and the
/// authorization gate (§4.D, §4.E, §4.F), since all three run before any
/// route handler and all three can short-circuit the request.
async fn dispatch_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let user_agent = request
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let rate_key = RateLimiter::key(&ip, &user_agent, method.as_str(), &path);
    let rate_outcome = state.rate_limiter.check(&rate_key, preset_for_path(&path));
    if !rate_outcome.allowed {
        let error = GatewayError::RateLimited {
            retry_after_secs: rate_outcome.retry_after_secs.unwrap_or(60),
        };
        return with_rate_limit_headers(error_response(&error, "unknown"), &rate_outcome);
    }

    let resolver = AuthResolver::new(&state.config, &state.api_keys);
    let context = resolver.resolve(request.headers(), &ip, &user_agent);
    let request_id = context.audit.request_id.clone();

    let requirement = state.scopes.resolve_requirement(method.as_str(), &path);
    let outcome = authz::authorize(context, requirement, &state.enforcement, &path);

    if let Some(error) = outcome.error {
        return with_rate_limit_headers(error_response(&error, &request_id), &rate_outcome);
    }

    let scopes = outcome.context.scopes.clone();
    let required_scopes = outcome.context.required_scopes.clone();
    let subject = outcome.context.user.clone();

    let mut request = request;
    request.extensions_mut().insert(outcome.context);
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    security_headers(headers);
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert("X-Request-Id", value);
    }
    if let Ok(value) = HeaderValue::from_str(&scopes.join(",")) {
        headers.insert("X-Auth-Scopes", value);
    }
    if let Some(required) = required_scopes {
        if let Ok(value) = HeaderValue::from_str(&required.join(",")) {
            headers.insert("X-Auth-Required-Scopes", value);
        }
    }
    if let Some(subject) = subject {
        if let Ok(value) = HeaderValue::from_str(&subject) {
            headers.insert("X-Auth-Subject", value);
        }
    }
    headers.insert("X-RateLimit-Limit", rate_outcome.limit.into());
    headers.insert("X-RateLimit-Remaining", rate_outcome.remaining.into());
    headers.insert("X-RateLimit-Reset", rate_outcome.reset_secs.into());

    response
}

fn error_response(error: &GatewayError, request_id: &str) -> Response {
    crate::core::logging::log_gateway_error(error, request_id);
    let envelope = ErrorEnvelope::from_error_with_context(error, request_id, ErrorMetadata::default());
    let mut response = (error.status(), Json(envelope)).into_response();
    security_headers(response.headers_mut());
    if let Some(secs) = error.retry_after_secs() {
        response.headers_mut().insert("Retry-After", secs.into());
    }
    response
}

fn with_rate_limit_headers(mut response: Response, outcome: &crate::ratelimit::RateLimitOutcome) -> Response {
    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", outcome.limit.into());
    headers.insert("X-RateLimit-Remaining", outcome.remaining.into());
    headers.insert("X-RateLimit-Reset", outcome.reset_secs.into());
    if let Some(retry_after) = outcome.retry_after_secs {
        headers.insert("Retry-After", retry_after.into());
    }
    response
}

/// `POST /mcp` — JSON-RPC alias accepting both shapes (§6).
async fn mcp_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<Value>,
) -> Response {
    rpc_response(&state, &auth, payload).await
}

/// `POST /api/trpc` and `POST /api/trpc/*path` — identical dispatch; the
/// trailing path segment is informational only (§4.J treats both the same
/// batch/single object).
async fn trpc_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<Value>,
) -> Response {
    rpc_response(&state, &auth, payload).await
}

/// Reuses the request id already resolved by `dispatch_middleware` rather
/// than minting a second one, so the id in the JSON-RPC response body and
/// the `X-Request-Id` header always match.
async fn rpc_response(state: &AppState, auth: &AuthContext, payload: Value) -> Response {
    let request_id = &auth.audit.request_id;
    match handle_payload(&state.registry, payload, request_id).await {
        Some(body) => Json(body).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// `GET /mcp/tools` — descriptor list outside the JSON-RPC envelope.
async fn list_tools_handler(State(state): State<AppState>) -> Json<Value> {
    let tools = state.registry.list().await;
    Json(serde_json::json!({ "tools": tools }))
}

/// `POST /mcp/tools/:name` — direct REST-style tool invocation.
async fn call_tool_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(params): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    if !state.registry.is_registered(&name).await {
        return Err(GatewayError::RpcMethodNotFound { method: name });
    }
    if let Some(schema) = state.registry.schema_for(&name).await {
        if let Err(message) = crate::rpc::schema::validate_params(&schema, &params) {
            return Err(GatewayError::InvalidRequest { message });
        }
    }
    let result = state.registry.call(&name, params).await?;
    Ok(Json(result))
}
